use crate::retention::StorageRetentionSweeper;
use crate::store::ObjectStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Spawns the periodic retention sweep when `RETENTION_INTERVAL_SECS` is set.
/// Each tick is best-effort; a failed sweep only logs and waits for the next
/// interval.
pub fn spawn_retention_sweeper<O>(sweeper: StorageRetentionSweeper<O>) -> Option<JoinHandle<()>>
where
    O: ObjectStore + Send + Sync + 'static,
{
    let interval_secs = interval_from_env()?;
    let max_items = max_delete_from_env();
    info!(
        target = "relove.jobs",
        interval_secs, max_items, "retention sweeper scheduled"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweeper.sweep(max_items).await {
                Ok(report) => {
                    if report.deleted > 0 || report.failed_batches > 0 {
                        info!(
                            target = "relove.jobs",
                            deleted = report.deleted,
                            failed_batches = report.failed_batches,
                            "scheduled sweep ran"
                        );
                    }
                }
                Err(err) => {
                    warn!(target = "relove.jobs", error = %err, "scheduled sweep failed");
                }
            }
        }
    }))
}

fn interval_from_env() -> Option<u64> {
    std::env::var("RETENTION_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
}

fn max_delete_from_env() -> usize {
    std::env::var("RETENTION_MAX_DELETE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(100)
}
