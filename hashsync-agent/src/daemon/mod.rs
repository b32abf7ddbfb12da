//! Sync cycles: run every configured target once, or repeatedly until shutdown.

pub mod shutdown;

use crate::config::SyncTarget;
use crate::executor::{Executor, SyncReport};
use crate::utils::errors::SyncError;
use shutdown::ShutdownCoordinator;
use std::time::Duration;
use tracing::{info, warn};

/// Results of one pass over the targets.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub reports: Vec<SyncReport>,
    pub failures: Vec<(String, SyncError)>,
}

impl CycleSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run each target in order. A failing target does not stop the others;
/// cancellation does.
pub async fn run_cycle(executor: &Executor, targets: &[SyncTarget]) -> CycleSummary {
    let mut summary = CycleSummary::default();

    for target in targets {
        match executor.process(target).await {
            Ok(report) => summary.reports.push(report),
            Err(SyncError::Cancelled) => {
                summary.failures.push((target.id.clone(), SyncError::Cancelled));
                break;
            }
            Err(e) => summary.failures.push((target.id.clone(), e)),
        }
    }

    summary
}

/// Run cycles every `interval` until the coordinator's token is cancelled.
pub async fn run_daemon(
    executor: &Executor,
    targets: &[SyncTarget],
    interval: Duration,
    shutdown: &ShutdownCoordinator,
) {
    let mut cycle = 0u64;

    info!(
        "Daemon started: {} targets every {}s",
        targets.len(),
        interval.as_secs()
    );

    while !shutdown.is_shutting_down() {
        cycle += 1;
        let summary = run_cycle(executor, targets).await;
        if summary.is_success() {
            info!("Cycle {} complete: {} targets synced", cycle, summary.reports.len());
        } else {
            warn!(
                "Cycle {} complete: {} synced, {} failed",
                cycle,
                summary.reports.len(),
                summary.failures.len()
            );
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Daemon stopped after {} cycles", cycle);
}
