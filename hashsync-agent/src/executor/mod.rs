//! Sync executor - runs one sync target to completion.
//!
//! [`Executor::process`] dispatches a target to the upload or download engine.
//! Both engines fan work out to a bounded pool of per-file tasks and report
//! through a shared [`ProgressTracker`](crate::transfer::progress::ProgressTracker).

pub mod cleanup;
pub mod download;
pub mod lineage;
pub mod manifest;
pub mod marker;
pub mod upload;

use crate::config::{Direction, SyncTarget};
use crate::store::ObjectStore;
use crate::transfer::progress::{format_bytes, format_speed, ProgressSnapshot};
use crate::utils::errors::{Result, SyncError};
use cleanup::CleanupReport;
use download::DownloadEngine;
use futures_util::stream::{FuturesUnordered, StreamExt};
use marker::StatePaths;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use upload::UploadEngine;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A manifest was written (upload) or applied (download)
    Synced { manifest_id: u64, version: u64 },

    /// Upload found nothing to change; the existing manifest stands
    Unchanged { manifest_id: u64 },

    /// Download found the resolved manifest already applied locally
    UpToDate { manifest_id: u64 },
}

impl Outcome {
    pub fn manifest_id(&self) -> u64 {
        match self {
            Outcome::Synced { manifest_id, .. }
            | Outcome::Unchanged { manifest_id }
            | Outcome::UpToDate { manifest_id } => *manifest_id,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Synced { manifest_id, version } => {
                write!(f, "synced manifest {} (version {})", manifest_id, version)
            }
            Outcome::Unchanged { manifest_id } => write!(f, "unchanged, manifest {}", manifest_id),
            Outcome::UpToDate { manifest_id } => write!(f, "up to date with manifest {}", manifest_id),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub target_id: String,
    pub direction: Direction,
    pub outcome: Outcome,
    pub progress: ProgressSnapshot,

    /// Obsolete-manifest cleanup, when an upload ran one
    pub cleanup: Option<CleanupReport>,
}

/// Sync executor
pub struct Executor {
    store: Arc<dyn ObjectStore>,
    state_dir: PathBuf,
    scratch_dir: PathBuf,
    cancel_token: CancellationToken,
}

impl Executor {
    /// Create a new executor (no cancellation support)
    pub fn new(store: Arc<dyn ObjectStore>, state_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::with_cancel(store, state_dir, scratch_dir, CancellationToken::new())
    }

    /// Create a new executor whose runs stop when `cancel_token` fires
    pub fn with_cancel(
        store: Arc<dyn ObjectStore>,
        state_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            state_dir: state_dir.into(),
            scratch_dir: scratch_dir.into(),
            cancel_token,
        }
    }

    /// Run one target to completion.
    pub async fn process(&self, target: &SyncTarget) -> Result<SyncReport> {
        info!(
            "Starting {} sync for target {}: {} -> {}",
            target.direction, target.id, target.source, target.destination
        );

        let paths = StatePaths::new(&self.state_dir, &target.id);
        let result = match target.direction {
            Direction::Upload => {
                async {
                    UploadEngine::new(
                        Arc::clone(&self.store),
                        target.clone(),
                        self.scratch_dir.clone(),
                        paths,
                    )?
                    .run(&self.cancel_token)
                    .await
                }
                .await
            }
            Direction::Download => {
                async {
                    DownloadEngine::new(Arc::clone(&self.store), target.clone(), paths)?
                        .run(&self.cancel_token)
                        .await
                }
                .await
            }
        };

        match &result {
            Ok(report) => info!(
                "Target {} {}: {} of {} transferred in {} files, {}",
                report.target_id,
                report.outcome,
                format_bytes(report.progress.transferred),
                format_bytes(report.progress.total),
                report.progress.files_transferred,
                format_speed(report.progress.speed)
            ),
            Err(SyncError::Cancelled) => info!("Target {} cancelled", target.id),
            Err(e) => error!("Target {} failed: {}", target.id, e),
        }

        result
    }
}

/// Attach the location being worked on, leaving cancellation recognisable.
pub(crate) fn located(err: SyncError, location: &impl fmt::Display) -> SyncError {
    match err {
        SyncError::Cancelled => err,
        other => other.context(location.to_string()),
    }
}

pub(crate) fn join_error(err: JoinError) -> SyncError {
    SyncError::Io(std::io::Error::other(format!("worker task failed: {}", err)))
}

/// Run `work` for every item with at most `workers` in flight.
///
/// The first failure cancels everything still queued or running. The error
/// returned is the first one that is not itself a cancellation.
pub(crate) async fn run_workers<T, F, Fut>(
    items: Vec<T>,
    workers: usize,
    cancel: &CancellationToken,
    work: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let abort = cancel.child_token();
    let mut tasks = FuturesUnordered::new();

    for item in items {
        let sem = Arc::clone(&semaphore);
        let token = abort.clone();
        let job = work(item);

        tasks.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                permit = sem.acquire_owned() => permit.map_err(|_| SyncError::Cancelled)?,
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => Err(SyncError::Cancelled),
                result = job => result,
            }
        }));
    }

    let mut first_error: Option<SyncError> = None;
    while let Some(joined) = tasks.next().await {
        let result = joined.unwrap_or_else(|e| Err(join_error(e)));

        if let Err(e) = result {
            abort.cancel();
            let replace = match &first_error {
                None => true,
                Some(SyncError::Cancelled) => !matches!(e, SyncError::Cancelled),
                Some(_) => false,
            };
            if replace {
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
