//! Background retention task for processed blocks.
//!
//! Spawns a tokio task that periodically scans the processed stage and deletes
//! blocks older than the configured lifetime. Age comes from each block's
//! `created_at.txt`, never from file modification times.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::blocks::lifecycle::{LifecycleController, ReapDecision};
use crate::blocks::stage::Stage;
use crate::error::BlockResult;

/// Tally of one reaper cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub reaped: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run one retention cycle at `now` (seconds since epoch).
///
/// Per-block problems are logged and counted; only failing to enumerate the
/// processed stage aborts the cycle.
pub fn reap_expired(
    controller: &LifecycleController,
    lifetime_secs: u64,
    now: i64,
) -> BlockResult<ReapReport> {
    let mut report = ReapReport::default();

    for block_id in controller.list(Stage::Processed)? {
        report.scanned += 1;
        match controller.reap(&block_id, lifetime_secs, now) {
            Ok(ReapDecision::Reaped { age_secs }) => {
                tracing::info!("Reaped processed block {} (age {}s)", block_id, age_secs);
                report.reaped += 1;
            }
            Ok(ReapDecision::Kept { .. }) => {}
            Ok(ReapDecision::Skipped(reason)) => {
                tracing::warn!("Skipping processed block {}: {}", block_id, reason);
                report.skipped += 1;
            }
            Err(e) => {
                tracing::error!("Failed to reap processed block {}: {}", block_id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Spawn a background task that purges expired processed blocks.
///
/// Runs [`reap_expired`] every `interval` on the blocking pool. The task lives as
/// long as the runtime; in-flight deletions are simply abandoned on shutdown.
pub fn spawn_reaper(
    controller: Arc<LifecycleController>,
    interval: Duration,
    lifetime_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let controller = controller.clone();
            let now = Utc::now().timestamp();

            match tokio::task::spawn_blocking(move || {
                reap_expired(&controller, lifetime_secs, now)
            })
            .await
            {
                Ok(Ok(report)) => {
                    if report.reaped > 0 || report.failed > 0 {
                        tracing::info!(
                            "Retention cycle: scanned {}, reaped {}, skipped {}, failed {}",
                            report.scanned,
                            report.reaped,
                            report.skipped,
                            report.failed
                        );
                    } else {
                        tracing::debug!(
                            "Retention cycle: nothing expired among {} blocks",
                            report.scanned
                        );
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Retention cycle error: {}", e);
                }
                Err(e) => {
                    tracing::error!("Retention cycle task join error: {}", e);
                }
            }
        }
    })
}
