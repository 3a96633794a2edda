use crate::store::{ObjectStore, StoreError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

/// Deletes are issued in slices of this size to stay under provider rate
/// limits.
const DELETE_BATCH_SIZE: usize = 50;
const INTER_BATCH_PAUSE_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("could not list bucket contents: {0}")]
    List(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed_batches: usize,
}

/// Bounds bucket usage by evicting the oldest objects. Blunt by design:
/// deletions are global, not per seller, and nothing reference-counts a URL
/// that a historical earnings row may still point at.
pub struct StorageRetentionSweeper<O> {
    sink: O,
}

impl<O: ObjectStore> StorageRetentionSweeper<O> {
    pub fn new(sink: O) -> Self {
        Self { sink }
    }

    /// Deletes up to `max_items` of the oldest objects. A bucket smaller than
    /// `max_items` is drained without error; a failed batch is logged and the
    /// sweep moves on to the next one.
    pub async fn sweep(&self, max_items: usize) -> Result<SweepReport, SweepError> {
        if max_items == 0 {
            return Ok(SweepReport {
                deleted: 0,
                failed_batches: 0,
            });
        }

        // Over-fetch to tolerate the listing shifting under us.
        let listed = self
            .sink
            .list_oldest(max_items.saturating_mul(2))
            .await
            .map_err(SweepError::List)?;
        let keys: Vec<String> = listed
            .into_iter()
            .take(max_items)
            .map(|object| object.key)
            .collect();

        let mut deleted = 0;
        let mut failed_batches = 0;
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            match self.sink.delete_objects(batch).await {
                Ok(()) => deleted += batch.len(),
                Err(err) => {
                    failed_batches += 1;
                    warn!(
                        target = "relove.retention",
                        batch_size = batch.len(),
                        error = %err,
                        "delete batch failed, continuing sweep"
                    );
                }
            }
            if batch.len() == DELETE_BATCH_SIZE {
                sleep(Duration::from_millis(INTER_BATCH_PAUSE_MS)).await;
            }
        }

        info!(
            target = "relove.retention",
            deleted, failed_batches, "retention sweep finished"
        );
        Ok(SweepReport {
            deleted,
            failed_batches,
        })
    }
}
