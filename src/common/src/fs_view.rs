use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::file_naming::{parse_base_file_name, parse_log_file_name};
use crate::model::{
    BootstrapIndex, CompactionPlan, FileGroup, FileGroupId, FileSlice, Instant, InstantAction,
    InstantState,
};
use crate::storage::{TableStorage, storage_dsn_to_path};
use crate::timeline::{META_FOLDER, Timeline, instant_payload};

/// Path of the bootstrap index under the meta folder
pub const BOOTSTRAP_INDEX_PATH: &str = ".basin/bootstrap/index.json";

/// A point-in-time view of the table's data files, grouped into file
/// groups and slices, joined with the timeline.
///
/// Only committed slices are visible: a slice whose base instant is neither
/// a completed commit nor a pending compaction does not exist as far as
/// retention planning is concerned, so half-written files are never touched.
pub struct FileSystemView {
    partitions: BTreeMap<String, Vec<FileGroup>>,
    pending_compactions: BTreeMap<FileGroupId, String>,
    bootstrap_index: Option<BootstrapIndex>,
}

impl FileSystemView {
    pub async fn load(storage: &TableStorage, timeline: &Timeline) -> Result<Self> {
        let visible = visible_instants(timeline);
        let pending_compactions = load_pending_compactions(storage, timeline).await?;
        let bootstrap_index = load_bootstrap_index(storage).await?;

        let mut groups: BTreeMap<FileGroupId, FileGroup> = BTreeMap::new();
        let paths = storage
            .list_recursive(None)
            .await
            .context("listing table data files")?;
        for path in paths {
            let (partition, name) = match path.rsplit_once('/') {
                Some((dir, name)) => (dir, name),
                None => ("", path.as_str()),
            };
            if partition == META_FOLDER || partition.starts_with(&format!("{META_FOLDER}/")) {
                continue;
            }
            if let Some(base) = parse_base_file_name(name) {
                let group_id = FileGroupId::new(partition, base.file_id.as_str());
                let group = groups
                    .entry(group_id.clone())
                    .or_insert_with(|| FileGroup::new(group_id));
                let slice = group.slice_mut(&base.instant_time);
                slice.base_file = Some(base);
            } else if let Some(log) = parse_log_file_name(name) {
                let group_id = FileGroupId::new(partition, log.file_id.as_str());
                let group = groups
                    .entry(group_id.clone())
                    .or_insert_with(|| FileGroup::new(group_id));
                group.slice_mut(&log.base_instant).log_files.push(log);
            }
        }

        // Drop slices whose base instant never committed, then attach
        // bootstrap sources to the surviving earliest slices.
        let mut partitions: BTreeMap<String, Vec<FileGroup>> = BTreeMap::new();
        for (group_id, group) in groups {
            let mut visible_group = FileGroup::new(group_id.clone());
            for slice in group.slices_oldest_first() {
                if visible.contains(slice.base_instant.as_str()) {
                    let target = visible_group.slice_mut(&slice.base_instant);
                    *target = slice.clone();
                }
            }
            if visible_group.is_empty() {
                continue;
            }
            partitions
                .entry(group_id.partition_path.clone())
                .or_default()
                .push(visible_group);
        }

        let mut view = Self {
            partitions,
            pending_compactions,
            bootstrap_index,
        };
        view.attach_bootstrap_sources()?;
        Ok(view)
    }

    fn attach_bootstrap_sources(&mut self) -> Result<()> {
        let Some(index) = &self.bootstrap_index else {
            return Ok(());
        };
        let source_base = storage_dsn_to_path(&index.source_dsn)?;
        let lookup: BTreeMap<FileGroupId, &str> = index
            .mappings
            .iter()
            .map(|m| {
                (
                    FileGroupId::new(m.partition_path.as_str(), m.file_id.as_str()),
                    m.source_path.as_str(),
                )
            })
            .collect();
        for groups in self.partitions.values_mut() {
            for group in groups {
                let Some(rel) = lookup.get(&group.group_id) else {
                    continue;
                };
                let earliest = group.earliest_slice().map(|s| s.base_instant.clone());
                if let Some(instant) = earliest {
                    let slice = group.slice_mut(&instant);
                    if let Some(base) = &mut slice.base_file {
                        base.bootstrap_source = Some(format!("{source_base}/{rel}"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Partition paths holding at least one visible file group
    pub fn partitions(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    /// Visible file groups in a partition
    pub fn file_groups(&self, partition: &str) -> &[FileGroup] {
        self.partitions
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The newest visible slice of every file group in a partition
    pub fn latest_file_slices(&self, partition: &str) -> Vec<&FileSlice> {
        self.file_groups(partition)
            .iter()
            .filter_map(|g| g.latest_slice())
            .collect()
    }

    /// For each file group, the newest slice with base instant at or before
    /// `instant`. With `include_pending` false, slices claimed by a pending
    /// compaction are passed over in favor of the next older one.
    pub fn latest_file_slices_before_or_on(
        &self,
        partition: &str,
        instant: &str,
        include_pending: bool,
    ) -> Vec<&FileSlice> {
        self.file_groups(partition)
            .iter()
            .filter_map(|group| {
                group.slices_newest_first().find(|slice| {
                    slice.base_instant.as_str() <= instant
                        && (include_pending
                            || !self
                                .pending_compaction_base_instant(&group.group_id)
                                .is_some_and(|claimed| slice.base_instant.as_str() >= claimed))
                })
            })
            .collect()
    }

    /// If a pending compaction claims this file group, the base instant of
    /// the slice it will read. Slices at or after that instant must not be
    /// cleaned.
    pub fn pending_compaction_base_instant(&self, group_id: &FileGroupId) -> Option<&str> {
        self.pending_compactions.get(group_id).map(String::as_str)
    }

    pub fn bootstrap_index(&self) -> Option<&BootstrapIndex> {
        self.bootstrap_index.as_ref()
    }
}

/// Base instants whose files are visible: completed commits and
/// compactions, plus compactions still in progress (their output must not
/// be cleaned out from under them).
fn visible_instants(timeline: &Timeline) -> BTreeSet<String> {
    timeline
        .instants()
        .iter()
        .filter(|i| match i.action {
            InstantAction::Compaction => true,
            action => action.is_write() && i.is_completed(),
        })
        .map(|i| i.timestamp.clone())
        .collect()
}

async fn load_pending_compactions(
    storage: &TableStorage,
    timeline: &Timeline,
) -> Result<BTreeMap<FileGroupId, String>> {
    let mut pending = BTreeMap::new();
    let pending_compactions = timeline.pending_compactions();
    for instant in pending_compactions.instants() {
        let requested = Instant::new(
            instant.timestamp.clone(),
            InstantAction::Compaction,
            InstantState::Requested,
        );
        let bytes = instant_payload(storage, &requested).await?;
        let plan: CompactionPlan = match serde_json::from_slice(&bytes) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    timestamp = %instant.timestamp,
                    error = %e,
                    "skipping unreadable compaction plan"
                );
                continue;
            }
        };
        for op in plan.operations {
            pending.insert(
                FileGroupId::new(op.partition_path, op.file_id),
                op.base_instant_time,
            );
        }
    }
    Ok(pending)
}

/// Read the bootstrap index if the table carries one
pub async fn load_bootstrap_index(storage: &TableStorage) -> Result<Option<BootstrapIndex>> {
    if !storage.exists(BOOTSTRAP_INDEX_PATH).await? {
        return Ok(None);
    }
    let bytes = storage.get(BOOTSTRAP_INDEX_PATH).await?;
    let index = serde_json::from_slice(&bytes).context("parsing bootstrap index")?;
    Ok(Some(index))
}
