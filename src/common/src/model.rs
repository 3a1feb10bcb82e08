use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Actions recorded on the timeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantAction {
    Commit,
    /// Log-file-only write on a merge-on-read table
    DeltaCommit,
    Clean,
    Compaction,
    Rollback,
}

impl InstantAction {
    /// Meta-file suffix for completed instants of this action
    pub fn suffix(&self) -> &'static str {
        match self {
            InstantAction::Commit => "commit",
            InstantAction::DeltaCommit => "deltacommit",
            InstantAction::Clean => "clean",
            InstantAction::Compaction => "compaction",
            InstantAction::Rollback => "rollback",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "commit" => Some(InstantAction::Commit),
            "deltacommit" => Some(InstantAction::DeltaCommit),
            "clean" => Some(InstantAction::Clean),
            "compaction" => Some(InstantAction::Compaction),
            "rollback" => Some(InstantAction::Rollback),
            _ => None,
        }
    }

    /// Whether completing this action publishes data files
    pub fn is_write(&self) -> bool {
        matches!(self, InstantAction::Commit | InstantAction::DeltaCommit)
    }
}

/// Lifecycle states of a timeline instant. Ordering matters: an instant's
/// effective state is the maximum state among its meta files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantState {
    Requested,
    Inflight,
    Completed,
}

/// One action at one timestamp on the timeline
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    pub timestamp: String,
    pub action: InstantAction,
    pub state: InstantState,
}

impl Instant {
    pub fn new(timestamp: impl Into<String>, action: InstantAction, state: InstantState) -> Self {
        Self {
            timestamp: timestamp.into(),
            action,
            state,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == InstantState::Completed
    }

    /// Meta-file name for this instant in its current state
    pub fn file_name(&self) -> String {
        match self.state {
            InstantState::Requested => {
                format!("{}.{}.requested", self.timestamp, self.action.suffix())
            }
            InstantState::Inflight => {
                format!("{}.{}.inflight", self.timestamp, self.action.suffix())
            }
            InstantState::Completed => format!("{}.{}", self.timestamp, self.action.suffix()),
        }
    }

    /// Parse a meta-file name like `20200315.commit` or `003.clean.requested`.
    /// Unrecognized names return `None` so foreign files in the meta folder
    /// are ignored.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let (timestamp, rest) = name.split_once('.')?;
        if timestamp.is_empty() {
            return None;
        }
        let (action_suffix, state) = match rest.rsplit_once('.') {
            Some((action, "requested")) => (action, InstantState::Requested),
            Some((action, "inflight")) => (action, InstantState::Inflight),
            _ => (rest, InstantState::Completed),
        };
        let action = InstantAction::from_suffix(action_suffix)?;
        Some(Instant::new(timestamp, action, state))
    }
}

/// Identifies a file group within a partition
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileGroupId {
    pub partition_path: String,
    pub file_id: String,
}

impl FileGroupId {
    pub fn new(partition_path: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            partition_path: partition_path.into(),
            file_id: file_id.into(),
        }
    }
}

/// A columnar base file written by one commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseFile {
    pub file_name: String,
    pub file_id: String,
    pub instant_time: String,
    /// Absolute path of the external source file this base file was
    /// bootstrapped from, when the table was created over pre-existing data
    pub bootstrap_source: Option<String>,
}

/// A row-oriented delta log file attached to a file slice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFile {
    pub file_name: String,
    pub file_id: String,
    pub base_instant: String,
    pub version: u32,
}

/// All files in a file group sharing one base instant time. A slice may
/// have log files but no base file (deltas written before compaction).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSlice {
    pub group_id: FileGroupId,
    pub base_instant: String,
    pub base_file: Option<BaseFile>,
    pub log_files: Vec<LogFile>,
}

impl FileSlice {
    pub fn new(group_id: FileGroupId, base_instant: impl Into<String>) -> Self {
        Self {
            group_id,
            base_instant: base_instant.into(),
            base_file: None,
            log_files: Vec::new(),
        }
    }

    /// Partition-relative paths of every file in the slice, base first
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(1 + self.log_files.len());
        if let Some(base) = &self.base_file {
            names.push(base.file_name.clone());
        }
        names.extend(self.log_files.iter().map(|l| l.file_name.clone()));
        names
    }
}

/// All versions of one file group, newest slice first
#[derive(Clone, Debug)]
pub struct FileGroup {
    pub group_id: FileGroupId,
    slices: BTreeMap<String, FileSlice>,
}

impl FileGroup {
    pub fn new(group_id: FileGroupId) -> Self {
        Self {
            group_id,
            slices: BTreeMap::new(),
        }
    }

    pub fn slice_mut(&mut self, base_instant: &str) -> &mut FileSlice {
        let group_id = self.group_id.clone();
        self.slices
            .entry(base_instant.to_string())
            .or_insert_with(|| FileSlice::new(group_id, base_instant))
    }

    /// Slices ordered newest base instant first
    pub fn slices_newest_first(&self) -> impl Iterator<Item = &FileSlice> {
        self.slices.values().rev()
    }

    /// Slices ordered oldest base instant first
    pub fn slices_oldest_first(&self) -> impl Iterator<Item = &FileSlice> {
        self.slices.values()
    }

    pub fn latest_slice(&self) -> Option<&FileSlice> {
        self.slices.values().next_back()
    }

    pub fn earliest_slice(&self) -> Option<&FileSlice> {
        self.slices.values().next()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Retention policy selecting which file slices survive a clean
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleaningPolicy {
    /// Retain a fixed number of slices per file group
    KeepLatestFileVersions,
    /// Retain every slice a query against the last N commits could read
    #[default]
    KeepLatestCommits,
}

/// Per-file statistics recorded in commit metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteStat {
    pub file_id: String,
    pub path: String,
    #[serde(default)]
    pub num_writes: u64,
}

/// Payload of a completed commit: which partitions and files it touched
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitMetadata {
    #[serde(default)]
    pub partition_to_write_stats: BTreeMap<String, Vec<WriteStat>>,
}

impl CommitMetadata {
    pub fn partitions(&self) -> impl Iterator<Item = &String> {
        self.partition_to_write_stats.keys()
    }
}

/// One file-group merge scheduled by a compaction plan
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionOperation {
    pub partition_path: String,
    pub file_id: String,
    /// Base instant of the slice the compaction will read
    pub base_instant_time: String,
    #[serde(default)]
    pub data_file_path: Option<String>,
    #[serde(default)]
    pub delta_file_paths: Vec<String>,
}

/// Payload of a requested compaction instant
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactionPlan {
    #[serde(default)]
    pub operations: Vec<CompactionOperation>,
}

/// Maps a bootstrapped file group to its external source file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapFileMapping {
    pub partition_path: String,
    pub file_id: String,
    /// Path of the source file relative to the bootstrap source base
    pub source_path: String,
}

/// Index of externally-located source files the table was bootstrapped over
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootstrapIndex {
    /// DSN of the storage holding the source files
    pub source_dsn: String,
    #[serde(default)]
    pub mappings: Vec<BootstrapFileMapping>,
}
