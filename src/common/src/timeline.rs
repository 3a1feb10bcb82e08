use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::{Instant, InstantAction, InstantState};
use crate::storage::TableStorage;

/// Folder under the table base path holding timeline meta files
pub const META_FOLDER: &str = ".basin";
/// Folder holding per-instant marker files for in-progress writes
pub const TEMP_FOLDER: &str = ".basin/.temp";

pub fn meta_file_path(instant: &Instant) -> String {
    format!("{META_FOLDER}/{}", instant.file_name())
}

/// An ordered view of the timeline meta folder.
///
/// Each (timestamp, action) pair appears once, at the highest lifecycle
/// state found on storage. A completed instant usually leaves its earlier
/// requested/inflight files behind; resolution collapses them.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    instants: Vec<Instant>,
}

impl Timeline {
    /// Read the meta folder and build the resolved timeline
    pub async fn load(storage: &TableStorage) -> Result<Self> {
        let names = storage
            .list_dir(META_FOLDER)
            .await
            .context("listing timeline meta folder")?;

        let mut resolved: BTreeMap<(String, InstantAction), InstantState> = BTreeMap::new();
        for name in names {
            let Some(instant) = Instant::parse_file_name(&name) else {
                continue;
            };
            let entry = resolved
                .entry((instant.timestamp, instant.action))
                .or_insert(instant.state);
            if instant.state > *entry {
                *entry = instant.state;
            }
        }

        let instants = resolved
            .into_iter()
            .map(|((timestamp, action), state)| Instant {
                timestamp,
                action,
                state,
            })
            .collect();
        Ok(Self { instants })
    }

    pub fn instants(&self) -> &[Instant] {
        &self.instants
    }

    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    /// Sub-view restricted by a predicate, preserving order
    pub fn filter(&self, predicate: impl Fn(&Instant) -> bool) -> Timeline {
        Timeline {
            instants: self
                .instants
                .iter()
                .filter(|i| predicate(i))
                .cloned()
                .collect(),
        }
    }

    /// Completed commits and delta commits, oldest first
    pub fn completed_commits(&self) -> Timeline {
        self.filter(|i| i.action.is_write() && i.is_completed())
    }

    /// Completed cleans, oldest first
    pub fn completed_cleans(&self) -> Timeline {
        self.filter(|i| i.action == InstantAction::Clean && i.is_completed())
    }

    /// Clean instants still in requested or inflight state
    pub fn pending_cleans(&self) -> Timeline {
        self.filter(|i| i.action == InstantAction::Clean && !i.is_completed())
    }

    /// Compaction instants not yet completed
    pub fn pending_compactions(&self) -> Timeline {
        self.filter(|i| i.action == InstantAction::Compaction && !i.is_completed())
    }

    pub fn latest(&self) -> Option<&Instant> {
        self.instants.last()
    }

    /// The instant `n` positions back from the latest; `nth_from_last(0)`
    /// is the latest instant itself
    pub fn nth_from_last(&self, n: usize) -> Option<&Instant> {
        let len = self.instants.len();
        if n >= len {
            return None;
        }
        self.instants.get(len - 1 - n)
    }

    /// Instants with `timestamp >= start`
    pub fn find_after_or_equal(&self, start: &str) -> Timeline {
        self.filter(|i| i.timestamp.as_str() >= start)
    }

    pub fn contains(&self, timestamp: &str) -> bool {
        self.instants.iter().any(|i| i.timestamp == timestamp)
    }

    pub fn len(&self) -> usize {
        self.instants.len()
    }
}

/// Timeline mutations. Kept separate from the read view so callers holding
/// a loaded `Timeline` snapshot do not mutate through it.
pub struct TimelineWriter<'a> {
    storage: &'a TableStorage,
}

impl<'a> TimelineWriter<'a> {
    pub fn new(storage: &'a TableStorage) -> Self {
        Self { storage }
    }

    /// Create a requested instant carrying `payload` in its meta file
    pub async fn create_requested(
        &self,
        timestamp: &str,
        action: InstantAction,
        payload: Vec<u8>,
    ) -> Result<Instant> {
        let instant = Instant::new(timestamp, action, InstantState::Requested);
        self.storage
            .put(&meta_file_path(&instant), payload)
            .await
            .with_context(|| format!("writing requested meta file for {timestamp}"))?;
        debug!(timestamp, action = ?action, "created requested instant");
        Ok(instant)
    }

    /// Mark a requested instant inflight with an empty marker meta file.
    /// The requested file stays in place; it holds the plan.
    pub async fn transition_requested_to_inflight(&self, instant: &Instant) -> Result<Instant> {
        let inflight = Instant::new(
            instant.timestamp.clone(),
            instant.action,
            InstantState::Inflight,
        );
        self.storage
            .put(&meta_file_path(&inflight), Vec::new())
            .await
            .with_context(|| format!("writing inflight meta file for {}", instant.timestamp))?;
        Ok(inflight)
    }

    /// Complete an instant, writing `payload` into the completed meta file
    pub async fn save_as_complete(&self, instant: &Instant, payload: Vec<u8>) -> Result<Instant> {
        let completed = Instant::new(
            instant.timestamp.clone(),
            instant.action,
            InstantState::Completed,
        );
        self.storage
            .put(&meta_file_path(&completed), payload)
            .await
            .with_context(|| format!("writing completed meta file for {}", instant.timestamp))?;
        debug!(timestamp = %instant.timestamp, action = ?instant.action, "completed instant");
        Ok(completed)
    }

    /// Schedule a compaction by writing its plan as a requested instant
    pub async fn save_compaction_requested(
        &self,
        timestamp: &str,
        payload: Vec<u8>,
    ) -> Result<Instant> {
        self.create_requested(timestamp, InstantAction::Compaction, payload)
            .await
    }

    /// Move a completed instant back to inflight by deleting only its
    /// completed meta file. The requested and inflight files remain, so a
    /// later attempt can resume from the persisted plan.
    pub async fn revert_to_inflight(&self, instant: &Instant) -> Result<Instant> {
        let completed = Instant::new(
            instant.timestamp.clone(),
            instant.action,
            InstantState::Completed,
        );
        self.storage
            .delete(&meta_file_path(&completed))
            .await
            .with_context(|| format!("deleting completed meta file for {}", instant.timestamp))?;
        Ok(Instant::new(
            instant.timestamp.clone(),
            instant.action,
            InstantState::Inflight,
        ))
    }
}

/// Read the payload bytes stored in an instant's meta file
pub async fn instant_payload(storage: &TableStorage, instant: &Instant) -> Result<Vec<u8>> {
    let bytes = storage
        .get(&meta_file_path(instant))
        .await
        .with_context(|| format!("reading meta file {}", instant.file_name()))?;
    Ok(bytes.to_vec())
}
