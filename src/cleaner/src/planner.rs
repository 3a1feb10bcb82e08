//! Retention planning.
//!
//! Scans the committed file system view and produces a [`CleanPlan`]
//! listing every file slice that is safe to remove under the configured
//! policy. Planning never touches storage data files; it only reads.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use common::config::CleanerConfig;
use common::fs_view::FileSystemView;
use common::model::{CleaningPolicy, CommitMetadata, FileGroup, FileSlice, InstantAction};
use common::storage::TableStorage;
use common::timeline::{Timeline, instant_payload};

use crate::migrator::CleanMetadataMigrator;
use crate::plan::{ActionInstant, CleanFileInfo, CleanMetadata, CleanPlan, LATEST_CLEAN_PLAN_VERSION};

pub struct CleanPlanner<'a> {
    config: &'a CleanerConfig,
    storage: &'a TableStorage,
    timeline: &'a Timeline,
    view: &'a FileSystemView,
}

impl<'a> CleanPlanner<'a> {
    pub fn new(
        config: &'a CleanerConfig,
        storage: &'a TableStorage,
        timeline: &'a Timeline,
        view: &'a FileSystemView,
    ) -> Self {
        Self {
            config,
            storage,
            timeline,
            view,
        }
    }

    /// Produce a plan, or `None` when nothing is eligible for deletion
    pub async fn plan(&self) -> Result<Option<CleanPlan>> {
        let earliest_retained = self.earliest_commit_to_retain();
        if self.config.policy == CleaningPolicy::KeepLatestCommits && earliest_retained.is_none() {
            debug!("not enough completed commits to clean");
            return Ok(None);
        }

        let partitions = self.partitions_to_scan().await?;
        let mut per_partition: BTreeMap<String, Vec<CleanFileInfo>> = BTreeMap::new();
        for partition in &partitions {
            let files = self.files_to_clean(partition, earliest_retained.as_deref());
            if !files.is_empty() {
                per_partition.insert(partition.clone(), files);
            }
        }

        if per_partition.is_empty() {
            debug!("no file slices eligible for cleaning");
            return Ok(None);
        }

        let total: usize = per_partition.values().map(Vec::len).sum();
        info!(
            partitions = per_partition.len(),
            files = total,
            policy = ?self.config.policy,
            "planned clean"
        );
        Ok(Some(CleanPlan {
            version: LATEST_CLEAN_PLAN_VERSION,
            policy: self.config.policy,
            earliest_instant_to_retain: earliest_retained.map(|timestamp| ActionInstant {
                timestamp,
                action: InstantAction::Commit.suffix().to_string(),
                state: "completed".to_string(),
            }),
            files_to_be_deleted_per_partition: BTreeMap::new(),
            file_paths_to_be_deleted_per_partition: per_partition,
        }))
    }

    /// Under `KeepLatestCommits` with `m` retained commits, the `m`-th
    /// completed commit from the end. Queries as of that commit or later
    /// must keep working after the clean.
    fn earliest_commit_to_retain(&self) -> Option<String> {
        if self.config.policy != CleaningPolicy::KeepLatestCommits
            || self.config.retained_commits == 0
        {
            return None;
        }
        let commits = self.timeline.completed_commits();
        if commits.len() <= self.config.retained_commits {
            return None;
        }
        commits
            .nth_from_last(self.config.retained_commits - 1)
            .map(|i| i.timestamp.clone())
    }

    /// Partitions to examine. In incremental mode only partitions written
    /// at or after the previous clean's retention boundary are scanned;
    /// the result must match what a full scan would find, because a
    /// partition with no commits since that boundary cannot have grown
    /// newly deletable slices.
    async fn partitions_to_scan(&self) -> Result<Vec<String>> {
        if self.config.incremental_clean_mode {
            if let Some(partitions) = self.incremental_partitions().await? {
                return Ok(partitions);
            }
        }
        Ok(self.view.partitions())
    }

    async fn incremental_partitions(&self) -> Result<Option<Vec<String>>> {
        let cleans = self.timeline.completed_cleans();
        let Some(last_clean) = cleans.latest() else {
            return Ok(None);
        };
        let payload = instant_payload(self.storage, last_clean)
            .await
            .context("reading previous clean metadata")?;
        let metadata: CleanMetadata = match serde_json::from_slice(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    timestamp = %last_clean.timestamp,
                    error = %e,
                    "previous clean metadata unreadable, falling back to full scan"
                );
                return Ok(None);
            }
        };
        // Metadata written by older releases may still use the absolute
        // path encoding
        let metadata = CleanMetadataMigrator::new(self.storage.base_path())
            .upgrade_to_latest(metadata)?;
        let Some(since) = metadata.earliest_commit_to_retain else {
            return Ok(None);
        };

        // Inclusive bound: a slice that was the fallback at the previous
        // boundary becomes deletable once the boundary moves past it, and
        // the commit that triggers that sits exactly at the old boundary
        let mut partitions = BTreeSet::new();
        let commits = self.timeline.completed_commits().find_after_or_equal(&since);
        for commit in commits.instants() {
            let payload = instant_payload(self.storage, commit)
                .await
                .with_context(|| format!("reading commit metadata for {}", commit.timestamp))?;
            let commit_metadata: CommitMetadata = match serde_json::from_slice(&payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        timestamp = %commit.timestamp,
                        error = %e,
                        "commit metadata unreadable, falling back to full scan"
                    );
                    return Ok(None);
                }
            };
            partitions.extend(commit_metadata.partitions().cloned());
        }
        debug!(
            since = %since,
            partitions = partitions.len(),
            "incremental clean partition selection"
        );
        Ok(Some(partitions.into_iter().collect()))
    }

    fn files_to_clean(&self, partition: &str, earliest_retained: Option<&str>) -> Vec<CleanFileInfo> {
        let mut files = Vec::new();
        for group in self.view.file_groups(partition) {
            match self.config.policy {
                CleaningPolicy::KeepLatestFileVersions => {
                    self.clean_keeping_latest_versions(group, &mut files);
                }
                CleaningPolicy::KeepLatestCommits => {
                    // Checked before partition iteration starts
                    if let Some(earliest) = earliest_retained {
                        self.clean_keeping_latest_commits(group, earliest, &mut files);
                    }
                }
            }
        }
        files
    }

    /// A slice claimed by a pending compaction, or produced at or after the
    /// claimed instant, must survive until the compaction lands
    fn is_protected_by_pending_compaction(&self, group: &FileGroup, slice: &FileSlice) -> bool {
        self.view
            .pending_compaction_base_instant(&group.group_id)
            .is_some_and(|claimed| slice.base_instant.as_str() >= claimed)
    }

    /// Keep the newest `retained_file_versions` slices of each file group.
    /// Slices protected by a pending compaction are skipped without
    /// consuming the retention budget; everything past the budget is
    /// deleted whole, logs included.
    fn clean_keeping_latest_versions(&self, group: &FileGroup, files: &mut Vec<CleanFileInfo>) {
        let mut remaining = self.config.retained_file_versions;
        for slice in group.slices_newest_first() {
            if self.is_protected_by_pending_compaction(group, slice) {
                continue;
            }
            if remaining > 0 {
                remaining -= 1;
                continue;
            }
            self.collect_slice(slice, files);
        }
    }

    /// Keep every slice a reader at or after the earliest retained commit
    /// could resolve: all slices committed at or after the boundary, plus
    /// the newest slice below it (the version such a reader falls back to).
    /// When the group went untouched inside the window its live slice is
    /// that fallback, and every older slice goes. Log-only slices are never
    /// candidates here; their data merges forward on compaction.
    fn clean_keeping_latest_commits(
        &self,
        group: &FileGroup,
        earliest_retained: &str,
        files: &mut Vec<CleanFileInfo>,
    ) {
        let base_slices: Vec<&FileSlice> = group
            .slices_newest_first()
            .filter(|s| s.base_file.is_some())
            .collect();
        let fallback = base_slices
            .iter()
            .find(|s| s.base_instant.as_str() < earliest_retained)
            .map(|s| s.base_instant.as_str());
        for slice in base_slices.iter().copied() {
            if slice.base_instant.as_str() >= earliest_retained {
                continue;
            }
            if fallback == Some(slice.base_instant.as_str()) {
                continue;
            }
            if self.is_protected_by_pending_compaction(group, slice) {
                continue;
            }
            self.collect_slice(slice, files);
        }
    }

    fn collect_slice(&self, slice: &FileSlice, files: &mut Vec<CleanFileInfo>) {
        if let Some(base) = &slice.base_file {
            files.push(CleanFileInfo::new(base.file_name.clone(), false));
            if self.config.clean_bootstrap_base_file_enabled {
                if let Some(source) = &base.bootstrap_source {
                    files.push(CleanFileInfo::new(source.clone(), true));
                }
            }
        }
        for log in &slice.log_files {
            files.push(CleanFileInfo::new(log.file_name.clone(), false));
        }
    }
}
