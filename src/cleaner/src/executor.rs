//! Crash-safe clean execution.
//!
//! A clean moves through the timeline like any other action: the plan is
//! persisted in the requested meta file, an inflight marker is written
//! before any deletion happens, and the resulting metadata lands in the
//! completed meta file. A crash at any point leaves a pending clean whose
//! plan the next run picks up and finishes before planning anything new.
//! Deletes are idempotent, so re-running a partially executed plan
//! converges to the same outcome.

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{info, warn};

use common::config::CleanerConfig;
use common::fs_view::{FileSystemView, load_bootstrap_index};
use common::model::{Instant, InstantAction, InstantState};
use common::storage::{TableStorage, storage_dsn_to_path};
use common::timeline::{Timeline, TimelineWriter, instant_payload};

use crate::migrator::CleanPlanMigrator;
use crate::plan::{CleanMetadata, CleanPlan, CleanStat};
use crate::planner::CleanPlanner;

/// Result of a clean attempt
#[derive(Debug)]
pub enum CleanOutcome {
    /// A fresh plan was created and executed at the requested instant
    Cleaned(CleanMetadata),
    /// A pending clean from an earlier attempt was finished instead; no
    /// new plan was created
    ResumedPriorAttempt(CleanMetadata),
    /// Nothing was eligible; no instant was written to the timeline
    NothingToClean,
}

impl CleanOutcome {
    pub fn metadata(&self) -> Option<&CleanMetadata> {
        match self {
            CleanOutcome::Cleaned(m) | CleanOutcome::ResumedPriorAttempt(m) => Some(m),
            CleanOutcome::NothingToClean => None,
        }
    }
}

pub struct CleanExecutor<'a> {
    config: &'a CleanerConfig,
    storage: &'a TableStorage,
}

impl<'a> CleanExecutor<'a> {
    pub fn new(config: &'a CleanerConfig, storage: &'a TableStorage) -> Self {
        Self { config, storage }
    }

    /// Run a clean, finishing any pending attempt first. `instant_time` is
    /// only used when a fresh plan is created.
    pub async fn clean(&self, instant_time: &str) -> Result<CleanOutcome> {
        let timeline = Timeline::load(self.storage).await?;

        let mut resumed = None;
        let pending_cleans = timeline.pending_cleans();
        for pending in pending_cleans.instants() {
            let requested = Instant::new(
                pending.timestamp.clone(),
                InstantAction::Clean,
                InstantState::Requested,
            );
            let payload = instant_payload(self.storage, &requested).await?;
            let plan: CleanPlan = match serde_json::from_slice(&payload) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(
                        timestamp = %pending.timestamp,
                        error = %e,
                        "pending clean has unreadable plan, skipping"
                    );
                    continue;
                }
            };
            info!(timestamp = %pending.timestamp, "finishing pending clean");
            resumed = Some(self.execute_plan(&pending.timestamp, plan).await?);
        }
        if let Some(metadata) = resumed {
            return Ok(CleanOutcome::ResumedPriorAttempt(metadata));
        }

        let view = FileSystemView::load(self.storage, &timeline).await?;
        let planner = CleanPlanner::new(self.config, self.storage, &timeline, &view);
        let Some(plan) = planner.plan().await? else {
            return Ok(CleanOutcome::NothingToClean);
        };

        if let Some(latest) = timeline.latest() {
            anyhow::ensure!(
                instant_time > latest.timestamp.as_str(),
                "clean instant {instant_time} must sort after latest instant {}",
                latest.timestamp
            );
        }
        let writer = TimelineWriter::new(self.storage);
        writer
            .create_requested(instant_time, InstantAction::Clean, serde_json::to_vec(&plan)?)
            .await?;
        let metadata = self.execute_plan(instant_time, plan).await?;
        Ok(CleanOutcome::Cleaned(metadata))
    }

    /// Execute a persisted plan and complete its instant
    async fn execute_plan(&self, instant_time: &str, plan: CleanPlan) -> Result<CleanMetadata> {
        let writer = TimelineWriter::new(self.storage);
        let requested = Instant::new(instant_time, InstantAction::Clean, InstantState::Requested);
        writer.transition_requested_to_inflight(&requested).await?;

        // Plans persisted by older releases may still use the absolute
        // path encoding
        let plan = CleanPlanMigrator::new(self.storage.base_path()).upgrade_to_latest(plan)?;

        let started = std::time::Instant::now();
        let start_clean_time = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();

        let bootstrap = self.bootstrap_target(&plan).await?;
        let mut stats = Vec::new();
        for (partition, entries) in &plan.file_paths_to_be_deleted_per_partition {
            let mut stat = CleanStat::new(partition.as_str(), plan.policy);
            let mut deletes = Vec::new();
            for entry in entries {
                if entry.is_bootstrap_base_file {
                    stat.bootstrap_delete_path_patterns
                        .push(entry.file_path.clone());
                    match &bootstrap {
                        Some((storage, base)) => {
                            let object_path = entry
                                .file_path
                                .strip_prefix(&format!("{base}/"))
                                .unwrap_or(&entry.file_path)
                                .to_string();
                            deletes.push((entry.file_path.clone(), true, storage, object_path));
                        }
                        None => {
                            warn!(path = %entry.file_path, "no bootstrap index for source file");
                            stat.bootstrap_failed_delete_files
                                .push(entry.file_path.clone());
                        }
                    }
                } else {
                    stat.delete_path_patterns.push(entry.file_path.clone());
                    let object_path = if partition.is_empty() {
                        entry.file_path.clone()
                    } else {
                        format!("{partition}/{}", entry.file_path)
                    };
                    deletes.push((entry.file_path.clone(), false, self.storage, object_path));
                }
            }

            let results = futures::stream::iter(deletes.into_iter().map(
                |(shown_path, is_bootstrap, storage, object_path)| async move {
                    let result = storage.delete(&object_path).await;
                    (shown_path, is_bootstrap, result)
                },
            ))
            .buffer_unordered(self.config.delete_parallelism.max(1))
            .collect::<Vec<_>>()
            .await;

            for (shown_path, is_bootstrap, result) in results {
                match (result, is_bootstrap) {
                    (Ok(()), false) => stat.success_delete_files.push(shown_path),
                    (Ok(()), true) => stat.bootstrap_success_delete_files.push(shown_path),
                    (Err(e), false) => {
                        warn!(path = %shown_path, error = %e, "failed to delete file");
                        stat.failed_delete_files.push(shown_path);
                    }
                    (Err(e), true) => {
                        warn!(path = %shown_path, error = %e, "failed to delete bootstrap source file");
                        stat.bootstrap_failed_delete_files.push(shown_path);
                    }
                }
            }
            stats.push(stat);
        }

        let earliest = plan
            .earliest_instant_to_retain
            .as_ref()
            .map(|a| a.timestamp.clone());
        let metadata = CleanMetadata::from_stats(
            stats,
            earliest,
            start_clean_time,
            started.elapsed().as_millis() as u64,
        );
        writer
            .save_as_complete(&requested, serde_json::to_vec(&metadata)?)
            .await?;
        info!(
            timestamp = instant_time,
            deleted = metadata.total_files_deleted,
            "clean completed"
        );
        Ok(metadata)
    }

    /// Storage and display base for bootstrap source deletions, when the
    /// plan names any
    async fn bootstrap_target(&self, plan: &CleanPlan) -> Result<Option<(TableStorage, String)>> {
        let has_bootstrap = plan
            .file_paths_to_be_deleted_per_partition
            .values()
            .flatten()
            .any(|e| e.is_bootstrap_base_file);
        if !has_bootstrap {
            return Ok(None);
        }
        let Some(index) = load_bootstrap_index(self.storage).await? else {
            return Ok(None);
        };
        let storage = TableStorage::new(&index.source_dsn)
            .context("opening bootstrap source storage")?;
        let base = storage_dsn_to_path(&index.source_dsn)?;
        Ok(Some((storage, base)))
    }
}
