//! Table fixtures for unit and integration tests.

use anyhow::Result;

use crate::file_naming::{base_file_name, log_file_name};
use crate::fs_view::BOOTSTRAP_INDEX_PATH;
use crate::model::{
    BootstrapIndex, CommitMetadata, CompactionOperation, CompactionPlan, Instant, InstantAction,
    InstantState, WriteStat,
};
use crate::storage::TableStorage;
use crate::timeline::{TEMP_FOLDER, meta_file_path};

/// Writes table layouts directly to storage, bypassing the write path,
/// so retention behavior can be tested against precise file arrangements.
pub struct TestTable {
    storage: TableStorage,
}

impl TestTable {
    pub fn new(storage: TableStorage) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(TableStorage::new("memory://")?))
    }

    pub fn storage(&self) -> &TableStorage {
        &self.storage
    }

    pub fn unique_file_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Record a completed commit, leaving its requested and inflight meta
    /// files behind the way the write path does
    pub async fn create_commit(&self, ts: &str, metadata: Option<&CommitMetadata>) -> Result<()> {
        self.create_completed(ts, InstantAction::Commit, metadata).await
    }

    /// Record a completed delta commit (log-file write)
    pub async fn create_delta_commit(
        &self,
        ts: &str,
        metadata: Option<&CommitMetadata>,
    ) -> Result<()> {
        self.create_completed(ts, InstantAction::DeltaCommit, metadata)
            .await
    }

    /// Record a completed rollback of a failed write
    pub async fn create_rollback(&self, ts: &str) -> Result<()> {
        let instant = Instant::new(ts, InstantAction::Rollback, InstantState::Completed);
        self.storage
            .put(&meta_file_path(&instant), b"{}".to_vec())
            .await?;
        Ok(())
    }

    async fn create_completed(
        &self,
        ts: &str,
        action: InstantAction,
        metadata: Option<&CommitMetadata>,
    ) -> Result<()> {
        let payload = match metadata {
            Some(m) => serde_json::to_vec(m)?,
            None => b"{}".to_vec(),
        };
        for state in [
            InstantState::Requested,
            InstantState::Inflight,
            InstantState::Completed,
        ] {
            let instant = Instant::new(ts, action, state);
            let bytes = if state == InstantState::Completed {
                payload.clone()
            } else {
                Vec::new()
            };
            self.storage.put(&meta_file_path(&instant), bytes).await?;
        }
        Ok(())
    }

    /// A commit that started but never completed
    pub async fn create_inflight_commit(&self, ts: &str) -> Result<()> {
        for state in [InstantState::Requested, InstantState::Inflight] {
            let instant = Instant::new(ts, InstantAction::Commit, state);
            self.storage
                .put(&meta_file_path(&instant), Vec::new())
                .await?;
        }
        Ok(())
    }

    pub async fn create_data_file(
        &self,
        partition: &str,
        file_id: &str,
        instant: &str,
    ) -> Result<String> {
        let path = data_file_path(partition, file_id, instant);
        self.storage.put(&path, instant.as_bytes().to_vec()).await?;
        Ok(path)
    }

    pub async fn create_log_file(
        &self,
        partition: &str,
        file_id: &str,
        base_instant: &str,
        version: u32,
    ) -> Result<String> {
        let path = log_file_path(partition, file_id, base_instant, version);
        self.storage.put(&path, Vec::new()).await?;
        Ok(path)
    }

    /// Schedule a pending compaction claiming the given file groups. Each
    /// entry is (partition, file_id, base_instant_of_claimed_slice).
    pub async fn create_compaction_requested(
        &self,
        ts: &str,
        operations: &[(&str, &str, &str)],
    ) -> Result<()> {
        let plan = CompactionPlan {
            operations: operations
                .iter()
                .map(|(partition, file_id, base_instant)| CompactionOperation {
                    partition_path: partition.to_string(),
                    file_id: file_id.to_string(),
                    base_instant_time: base_instant.to_string(),
                    data_file_path: None,
                    delta_file_paths: Vec::new(),
                })
                .collect(),
        };
        let instant = Instant::new(ts, InstantAction::Compaction, InstantState::Requested);
        self.storage
            .put(&meta_file_path(&instant), serde_json::to_vec(&plan)?)
            .await?;
        Ok(())
    }

    pub async fn write_bootstrap_index(&self, index: &BootstrapIndex) -> Result<()> {
        self.storage
            .put(BOOTSTRAP_INDEX_PATH, serde_json::to_vec(index)?)
            .await?;
        Ok(())
    }

    pub async fn create_marker_file(&self, instant: &str, name: &str) -> Result<String> {
        let path = format!("{TEMP_FOLDER}/{instant}/{name}");
        self.storage.put(&path, Vec::new()).await?;
        Ok(path)
    }

    /// Leave behind a pending clean whose persisted plan cannot be parsed,
    /// as a crashed writer with a partial meta write would
    pub async fn create_corrupted_pending_clean(&self, ts: &str, inflight: bool) -> Result<()> {
        let requested = Instant::new(ts, InstantAction::Clean, InstantState::Requested);
        self.storage
            .put(&meta_file_path(&requested), Vec::new())
            .await?;
        if inflight {
            let instant = Instant::new(ts, InstantAction::Clean, InstantState::Inflight);
            self.storage
                .put(&meta_file_path(&instant), Vec::new())
                .await?;
        }
        Ok(())
    }

    pub async fn data_file_exists(
        &self,
        partition: &str,
        file_id: &str,
        instant: &str,
    ) -> Result<bool> {
        self.storage
            .exists(&data_file_path(partition, file_id, instant))
            .await
    }

    pub async fn log_file_exists(
        &self,
        partition: &str,
        file_id: &str,
        base_instant: &str,
        version: u32,
    ) -> Result<bool> {
        self.storage
            .exists(&log_file_path(partition, file_id, base_instant, version))
            .await
    }
}

pub fn data_file_path(partition: &str, file_id: &str, instant: &str) -> String {
    join_partition(partition, &base_file_name(file_id, instant))
}

pub fn log_file_path(partition: &str, file_id: &str, base_instant: &str, version: u32) -> String {
    join_partition(partition, &log_file_name(file_id, base_instant, version))
}

fn join_partition(partition: &str, name: &str) -> String {
    if partition.is_empty() {
        name.to_string()
    } else {
        format!("{partition}/{name}")
    }
}

/// Commit metadata naming the partitions and file ids the commit wrote
pub fn commit_metadata(ts: &str, writes: &[(&str, &[&str])]) -> CommitMetadata {
    let mut metadata = CommitMetadata::default();
    for (partition, file_ids) in writes {
        let stats = file_ids
            .iter()
            .map(|file_id| WriteStat {
                file_id: file_id.to_string(),
                path: data_file_path(partition, file_id, ts),
                num_writes: 1,
            })
            .collect();
        metadata
            .partition_to_write_stats
            .insert(partition.to_string(), stats);
    }
    metadata
}
