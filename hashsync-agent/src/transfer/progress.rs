//! Byte-level progress tracking for sync runs.
//!
//! One [`ProgressTracker`] exists per run and is shared by every worker. It
//! owns the run's single lock: byte counters, the engine's own ledger (file
//! records, the in-progress flag) and periodic writes of the progress file
//! all happen while holding it.

use crate::config::Direction;
use crate::fs::state::write_json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Progress information persisted for external polling. Not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: String,
    pub direction: Direction,

    /// Unix seconds
    pub start: i64,
    pub stop: i64,

    /// Raw bytes of every file in the run
    pub total: u64,

    /// Raw bytes of files already handled, transferred or not
    pub processed: u64,

    /// Bytes actually moved to or from the store
    pub transferred: u64,

    /// Percentage complete (0-100)
    pub progress: f64,

    /// Bytes per second over the whole run
    pub speed: f64,

    /// Stored bytes over raw bytes for transferred files (1.0 = no saving)
    pub compression: f64,

    pub files_total: usize,
    pub files_processed: usize,
    pub files_transferred: usize,

    pub success: bool,
}

impl ProgressSnapshot {
    pub fn new(id: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            direction,
            start: Utc::now().timestamp(),
            stop: 0,
            total: 0,
            processed: 0,
            transferred: 0,
            progress: 0.0,
            speed: 0.0,
            compression: 1.0,
            files_total: 0,
            files_processed: 0,
            files_transferred: 0,
            success: false,
        }
    }
}

/// Lock-protected run state: counters plus the engine's ledger `L`.
#[derive(Debug)]
pub struct Tracked<L> {
    snapshot: ProgressSnapshot,
    raw_transferred: u64,
    started: Instant,
    last_persist: Option<Instant>,
    pub ledger: L,
}

impl<L> Tracked<L> {
    /// A file has been handled, whether or not it moved any bytes.
    pub fn add_processed(&mut self, bytes: u64) {
        self.snapshot.processed += bytes;
        self.snapshot.files_processed += 1;
        self.refresh();
    }

    /// `raw` bytes of content were moved as `stored` bytes on the wire.
    pub fn add_transferred(&mut self, raw: u64, stored: u64) {
        self.raw_transferred += raw;
        self.snapshot.transferred += stored;
        self.snapshot.files_transferred += 1;
        self.refresh();
    }

    fn refresh(&mut self) {
        let s = &mut self.snapshot;
        s.progress = if s.total > 0 {
            ((s.processed as f64 / s.total as f64) * 100.0).min(100.0)
        } else if s.files_processed >= s.files_total {
            100.0
        } else {
            0.0
        };

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        s.speed = s.transferred as f64 / elapsed;
        s.compression = if self.raw_transferred > 0 {
            s.transferred as f64 / self.raw_transferred as f64
        } else {
            1.0
        };
    }
}

pub struct ProgressTracker<L = ()> {
    state: Mutex<Tracked<L>>,
    info_path: Option<PathBuf>,
    persist_every: Duration,
}

impl<L> ProgressTracker<L> {
    /// Create a tracker. `info_path`, when set, receives the progress JSON.
    pub fn new(id: impl Into<String>, direction: Direction, ledger: L, info_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(Tracked {
                snapshot: ProgressSnapshot::new(id, direction),
                raw_transferred: 0,
                started: Instant::now(),
                last_persist: None,
                ledger,
            }),
            info_path,
            persist_every: Duration::from_secs(1),
        }
    }

    pub fn with_persist_interval(mut self, every: Duration) -> Self {
        self.persist_every = every;
        self
    }

    /// Take the run lock.
    pub async fn lock(&self) -> MutexGuard<'_, Tracked<L>> {
        self.state.lock().await
    }

    pub async fn set_totals(&self, bytes: u64, files: usize) {
        let mut state = self.lock().await;
        state.snapshot.total = bytes;
        state.snapshot.files_total = files;
        state.refresh();
    }

    pub async fn record_transfer(&self, raw: u64, stored: u64) {
        self.lock().await.add_transferred(raw, stored);
    }

    /// Mark a file as handled and write the progress file if one is due.
    pub async fn file_done(&self, bytes: u64) {
        let mut state = self.lock().await;
        state.add_processed(bytes);
        self.persist_locked(&mut state, false).await;
    }

    /// Stamp the stop time and success flag, persist, and return the final snapshot.
    pub async fn finish(&self, success: bool) -> ProgressSnapshot {
        let mut state = self.lock().await;
        state.refresh();
        state.snapshot.stop = Utc::now().timestamp();
        state.snapshot.success = success;
        if success {
            state.snapshot.progress = 100.0;
        }
        self.persist_locked(&mut state, true).await;
        state.snapshot.clone()
    }

    async fn persist_locked(&self, state: &mut Tracked<L>, force: bool) {
        let Some(path) = self.info_path.as_ref() else {
            return;
        };

        let due = state
            .last_persist
            .map_or(true, |at| at.elapsed() >= self.persist_every);
        if !force && !due {
            return;
        }

        if let Err(e) = write_json(path, &state.snapshot).await {
            warn!("Failed to write progress file {}: {}", path.display(), e);
        }
        state.last_persist = Some(Instant::now());
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}
