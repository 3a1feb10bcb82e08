//! Schema migration for persisted clean payloads.
//!
//! Version 1 encoded every file path as an absolute string. Version 2
//! encodes paths relative to their partition, with bootstrap source files
//! (which live outside the table base path) kept absolute and flagged.
//! Migration composes single-step handlers between adjacent versions, so
//! payloads can be moved to any supported version in either direction.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::plan::{
    CLEAN_METADATA_VERSION_1, CLEAN_METADATA_VERSION_2, CLEAN_PLAN_VERSION_1, CLEAN_PLAN_VERSION_2,
    CleanFileInfo, CleanMetadata, CleanPartitionMetadata, CleanPlan, LATEST_CLEAN_METADATA_VERSION,
    LATEST_CLEAN_PLAN_VERSION,
};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("unsupported clean plan version {0}")]
    UnsupportedPlanVersion(u32),
    #[error("unsupported clean metadata version {0}")]
    UnsupportedMetadataVersion(u32),
}

fn join_path(base_path: &str, partition: &str, file: &str) -> String {
    if partition.is_empty() {
        format!("{base_path}/{file}")
    } else {
        format!("{base_path}/{partition}/{file}")
    }
}

fn partition_prefix(base_path: &str, partition: &str) -> String {
    if partition.is_empty() {
        format!("{base_path}/")
    } else {
        format!("{base_path}/{partition}/")
    }
}

/// Migrates clean plans between schema versions
pub struct CleanPlanMigrator {
    base_path: String,
}

impl CleanPlanMigrator {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn upgrade_to_latest(&self, plan: CleanPlan) -> Result<CleanPlan, MigrationError> {
        self.migrate_to_version(plan, LATEST_CLEAN_PLAN_VERSION)
    }

    pub fn migrate_to_version(
        &self,
        mut plan: CleanPlan,
        target: u32,
    ) -> Result<CleanPlan, MigrationError> {
        for version in [plan.version, target] {
            if !(CLEAN_PLAN_VERSION_1..=LATEST_CLEAN_PLAN_VERSION).contains(&version) {
                return Err(MigrationError::UnsupportedPlanVersion(version));
            }
        }
        while plan.version < target {
            plan = self.upgrade_one(plan);
        }
        while plan.version > target {
            plan = self.downgrade_one(plan);
        }
        Ok(plan)
    }

    /// v1 -> v2: absolute paths become partition-relative entries. Paths
    /// outside the table base path are bootstrap source files.
    fn upgrade_one(&self, mut plan: CleanPlan) -> CleanPlan {
        debug_assert_eq!(plan.version, CLEAN_PLAN_VERSION_1);
        let flat = std::mem::take(&mut plan.files_to_be_deleted_per_partition);
        let mut structured: BTreeMap<String, Vec<CleanFileInfo>> = BTreeMap::new();
        for (partition, paths) in flat {
            let prefix = partition_prefix(&self.base_path, &partition);
            let entries = paths
                .into_iter()
                .map(|path| match path.strip_prefix(&prefix) {
                    Some(relative) => CleanFileInfo::new(relative, false),
                    None => CleanFileInfo::new(path, true),
                })
                .collect();
            structured.insert(partition, entries);
        }
        plan.file_paths_to_be_deleted_per_partition = structured;
        plan.version = CLEAN_PLAN_VERSION_2;
        plan
    }

    /// v2 -> v1: entries flatten back to absolute paths
    fn downgrade_one(&self, mut plan: CleanPlan) -> CleanPlan {
        debug_assert_eq!(plan.version, CLEAN_PLAN_VERSION_2);
        let structured = std::mem::take(&mut plan.file_paths_to_be_deleted_per_partition);
        let mut flat: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (partition, entries) in structured {
            let paths = entries
                .into_iter()
                .map(|info| {
                    if info.is_bootstrap_base_file {
                        info.file_path
                    } else {
                        join_path(&self.base_path, &partition, &info.file_path)
                    }
                })
                .collect();
            flat.insert(partition, paths);
        }
        plan.files_to_be_deleted_per_partition = flat;
        plan.version = CLEAN_PLAN_VERSION_1;
        plan
    }
}

/// Migrates clean metadata between schema versions
pub struct CleanMetadataMigrator {
    base_path: String,
}

impl CleanMetadataMigrator {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn upgrade_to_latest(&self, metadata: CleanMetadata) -> Result<CleanMetadata, MigrationError> {
        self.migrate_to_version(metadata, LATEST_CLEAN_METADATA_VERSION)
    }

    pub fn migrate_to_version(
        &self,
        mut metadata: CleanMetadata,
        target: u32,
    ) -> Result<CleanMetadata, MigrationError> {
        for version in [metadata.version, target] {
            if !(CLEAN_METADATA_VERSION_1..=LATEST_CLEAN_METADATA_VERSION).contains(&version) {
                return Err(MigrationError::UnsupportedMetadataVersion(version));
            }
        }
        while metadata.version < target {
            metadata = self.upgrade_one(metadata);
        }
        while metadata.version > target {
            metadata = self.downgrade_one(metadata);
        }
        Ok(metadata)
    }

    /// v1 -> v2: partition metadata paths become partition-relative. The
    /// bootstrap map is untouched; its paths are absolute in every version.
    fn upgrade_one(&self, mut metadata: CleanMetadata) -> CleanMetadata {
        debug_assert_eq!(metadata.version, CLEAN_METADATA_VERSION_1);
        for (partition, pm) in metadata.partition_metadata.iter_mut() {
            let prefix = partition_prefix(&self.base_path, partition);
            map_paths(pm, |path| {
                path.strip_prefix(&prefix)
                    .map(str::to_string)
                    .unwrap_or(path)
            });
        }
        metadata.version = CLEAN_METADATA_VERSION_2;
        metadata
    }

    /// v2 -> v1: partition metadata paths flatten to absolute
    fn downgrade_one(&self, mut metadata: CleanMetadata) -> CleanMetadata {
        debug_assert_eq!(metadata.version, CLEAN_METADATA_VERSION_2);
        for (partition, pm) in metadata.partition_metadata.iter_mut() {
            map_paths(pm, |path| join_path(&self.base_path, partition, &path));
        }
        metadata.version = CLEAN_METADATA_VERSION_1;
        metadata
    }
}

fn map_paths(pm: &mut CleanPartitionMetadata, f: impl Fn(String) -> String) {
    for list in [
        &mut pm.delete_path_patterns,
        &mut pm.success_delete_files,
        &mut pm.failed_delete_files,
    ] {
        for path in list.iter_mut() {
            *path = f(std::mem::take(path));
        }
    }
}
