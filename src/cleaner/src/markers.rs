//! Marker directory cleanup.
//!
//! Writers drop a marker file under `.basin/.temp/{instant}` for every
//! data file they start, so a rollback can find files the crashed write
//! left behind without listing every partition. Once an instant is
//! committed or rolled back its marker directory is garbage.

use anyhow::Result;
use futures::StreamExt;
use tracing::info;

use common::storage::TableStorage;
use common::timeline::TEMP_FOLDER;

pub struct MarkerCleaner<'a> {
    storage: &'a TableStorage,
    parallelism: usize,
}

impl<'a> MarkerCleaner<'a> {
    pub fn new(storage: &'a TableStorage, parallelism: usize) -> Self {
        Self {
            storage,
            parallelism,
        }
    }

    /// Delete every marker belonging to an instant. Returns the number of
    /// marker files removed; an absent directory counts as zero.
    pub async fn delete_marker_dir(&self, instant_time: &str) -> Result<usize> {
        let prefix = format!("{TEMP_FOLDER}/{instant_time}");
        let markers = self.storage.list_recursive(Some(&prefix)).await?;
        if markers.is_empty() {
            return Ok(0);
        }

        let deleted = markers.len();
        let mut results = futures::stream::iter(
            markers
                .into_iter()
                .map(|path| async move { self.storage.delete(&path).await }),
        )
        .buffer_unordered(self.parallelism.max(1));
        while let Some(result) = results.next().await {
            result?;
        }

        info!(instant = instant_time, markers = deleted, "deleted marker directory");
        Ok(deleted)
    }
}
