//! Persisted clean payloads.
//!
//! The plan is written into the requested meta file and the metadata into
//! the completed meta file. Both carry a schema version: version 1 encoded
//! file paths as absolute strings, version 2 encodes them relative to the
//! partition with bootstrap source files marked explicitly (those stay
//! absolute since they live outside the table base path).
//!
//! Collections are `BTreeMap`s and file lists are kept sorted so that
//! re-executing the same plan serializes to identical bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use common::model::{CleaningPolicy, Instant};

pub const CLEAN_PLAN_VERSION_1: u32 = 1;
pub const CLEAN_PLAN_VERSION_2: u32 = 2;
pub const LATEST_CLEAN_PLAN_VERSION: u32 = CLEAN_PLAN_VERSION_2;

pub const CLEAN_METADATA_VERSION_1: u32 = 1;
pub const CLEAN_METADATA_VERSION_2: u32 = 2;
pub const LATEST_CLEAN_METADATA_VERSION: u32 = CLEAN_METADATA_VERSION_2;

fn latest_plan_version() -> u32 {
    LATEST_CLEAN_PLAN_VERSION
}

fn latest_metadata_version() -> u32 {
    LATEST_CLEAN_METADATA_VERSION
}

/// A timeline instant captured inside a payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInstant {
    pub timestamp: String,
    pub action: String,
    pub state: String,
}

impl From<&Instant> for ActionInstant {
    fn from(instant: &Instant) -> Self {
        Self {
            timestamp: instant.timestamp.clone(),
            action: instant.action.suffix().to_string(),
            state: format!("{:?}", instant.state).to_lowercase(),
        }
    }
}

/// One file scheduled for deletion. In version-2 payloads `file_path` is
/// partition-relative, except bootstrap source files which keep their
/// absolute external path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanFileInfo {
    pub file_path: String,
    #[serde(default)]
    pub is_bootstrap_base_file: bool,
}

impl CleanFileInfo {
    pub fn new(file_path: impl Into<String>, is_bootstrap_base_file: bool) -> Self {
        Self {
            file_path: file_path.into(),
            is_bootstrap_base_file,
        }
    }
}

/// The persisted clean plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanPlan {
    #[serde(default = "latest_plan_version")]
    pub version: u32,
    pub policy: CleaningPolicy,
    #[serde(default)]
    pub earliest_instant_to_retain: Option<ActionInstant>,
    /// Version-1 encoding: absolute file paths per partition. Empty in
    /// version-2 plans.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files_to_be_deleted_per_partition: BTreeMap<String, Vec<String>>,
    /// Version-2 encoding: structured entries per partition. Empty in
    /// version-1 plans.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_paths_to_be_deleted_per_partition: BTreeMap<String, Vec<CleanFileInfo>>,
}

impl CleanPlan {
    pub fn is_empty(&self) -> bool {
        self.files_to_be_deleted_per_partition
            .values()
            .all(Vec::is_empty)
            && self
                .file_paths_to_be_deleted_per_partition
                .values()
                .all(Vec::is_empty)
    }

    pub fn partitions(&self) -> Vec<&String> {
        if self.version >= CLEAN_PLAN_VERSION_2 {
            self.file_paths_to_be_deleted_per_partition.keys().collect()
        } else {
            self.files_to_be_deleted_per_partition.keys().collect()
        }
    }
}

/// Per-partition outcome of executing a clean plan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanPartitionMetadata {
    pub partition_path: String,
    pub policy: CleaningPolicy,
    /// The paths the plan asked to delete, in the payload version's encoding
    pub delete_path_patterns: Vec<String>,
    pub success_delete_files: Vec<String>,
    pub failed_delete_files: Vec<String>,
}

/// The persisted result of a completed clean
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanMetadata {
    #[serde(default = "latest_metadata_version")]
    pub version: u32,
    pub start_clean_time: String,
    pub time_taken_in_millis: u64,
    pub total_files_deleted: u64,
    #[serde(default)]
    pub earliest_commit_to_retain: Option<String>,
    #[serde(default)]
    pub partition_metadata: BTreeMap<String, CleanPartitionMetadata>,
    /// Outcomes for external bootstrap source files, keyed by partition.
    /// Paths here are always absolute.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bootstrap_partition_metadata: BTreeMap<String, CleanPartitionMetadata>,
}

/// Accumulates deletion results for one partition during execution
#[derive(Clone, Debug, Default)]
pub struct CleanStat {
    pub partition_path: String,
    pub policy: CleaningPolicy,
    pub delete_path_patterns: Vec<String>,
    pub success_delete_files: Vec<String>,
    pub failed_delete_files: Vec<String>,
    pub bootstrap_delete_path_patterns: Vec<String>,
    pub bootstrap_success_delete_files: Vec<String>,
    pub bootstrap_failed_delete_files: Vec<String>,
}

impl CleanStat {
    pub fn new(partition_path: impl Into<String>, policy: CleaningPolicy) -> Self {
        Self {
            partition_path: partition_path.into(),
            policy,
            ..Default::default()
        }
    }

    fn sorted(mut values: Vec<String>) -> Vec<String> {
        values.sort();
        values
    }

    fn into_partition_metadata(self) -> (CleanPartitionMetadata, Option<CleanPartitionMetadata>) {
        let bootstrap = if self.bootstrap_delete_path_patterns.is_empty() {
            None
        } else {
            Some(CleanPartitionMetadata {
                partition_path: self.partition_path.clone(),
                policy: self.policy,
                delete_path_patterns: Self::sorted(self.bootstrap_delete_path_patterns),
                success_delete_files: Self::sorted(self.bootstrap_success_delete_files),
                failed_delete_files: Self::sorted(self.bootstrap_failed_delete_files),
            })
        };
        let partition = CleanPartitionMetadata {
            partition_path: self.partition_path,
            policy: self.policy,
            delete_path_patterns: Self::sorted(self.delete_path_patterns),
            success_delete_files: Self::sorted(self.success_delete_files),
            failed_delete_files: Self::sorted(self.failed_delete_files),
        };
        (partition, bootstrap)
    }
}

impl CleanMetadata {
    pub fn from_stats(
        stats: Vec<CleanStat>,
        earliest_commit_to_retain: Option<String>,
        start_clean_time: String,
        time_taken_in_millis: u64,
    ) -> Self {
        let mut partition_metadata = BTreeMap::new();
        let mut bootstrap_partition_metadata = BTreeMap::new();
        let mut total_files_deleted = 0u64;
        for stat in stats {
            let (partition, bootstrap) = stat.into_partition_metadata();
            total_files_deleted += partition.success_delete_files.len() as u64;
            if let Some(bootstrap) = bootstrap {
                total_files_deleted += bootstrap.success_delete_files.len() as u64;
                bootstrap_partition_metadata.insert(bootstrap.partition_path.clone(), bootstrap);
            }
            partition_metadata.insert(partition.partition_path.clone(), partition);
        }
        Self {
            version: LATEST_CLEAN_METADATA_VERSION,
            start_clean_time,
            time_taken_in_millis,
            total_files_deleted,
            earliest_commit_to_retain,
            partition_metadata,
            bootstrap_partition_metadata,
        }
    }
}
