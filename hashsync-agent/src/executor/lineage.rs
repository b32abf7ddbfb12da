//! Manifest lineage management.
//!
//! A lineage is the ordered set of manifest snapshots under one status
//! location. This module finds the authoritative snapshot for readers, picks
//! or creates the working snapshot for the single writer, and decides which
//! old snapshots have fallen out of the rotation.

use super::manifest::{snapshot_id, Manifest, STATUS_FILE_PREFIX};
use crate::config::Location;
use crate::store::ObjectStore;
use crate::transfer::retry::RetryPolicy;
use crate::utils::errors::{Result, ResultExt};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A snapshot key together with the id parsed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub key: String,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Finalized,
    InProgress,
    /// Missing or failed to deserialize
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub key: String,
    pub id: u64,
    pub state: SnapshotState,
}

/// The manifest an upload run works on.
#[derive(Debug, Clone)]
pub struct WriteSlot {
    pub manifest: Manifest,

    /// No reusable snapshot existed, `manifest` has not been stored yet
    pub is_new: bool,

    /// The snapshot this run continues from: the reused one itself, or the one being superseded
    pub previous: Option<Manifest>,

    /// The lineage as listed before the slot was chosen, oldest first
    pub lineage: Vec<Snapshot>,
}

pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    location: Location,
    policy: RetryPolicy,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn ObjectStore>, location: Location, policy: RetryPolicy) -> Self {
        Self { store, location, policy }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Key prefix shared by every snapshot of this lineage.
    pub fn lineage_prefix(&self) -> String {
        self.location.key(STATUS_FILE_PREFIX)
    }

    /// All snapshots, oldest first. Keys whose id does not parse, or does not
    /// fit a millisecond timestamp, sort as 0.
    pub async fn list_lineage(&self) -> Result<Vec<Snapshot>> {
        let prefix = self.lineage_prefix();
        let what = format!("list {}/{}", self.location.bucket, prefix);
        let entries = self
            .policy
            .run(&what, || self.store.list(&self.location.bucket, &prefix))
            .await
            .with_context(|| format!("listing lineage {}", self.location))?;

        let mut snapshots: Vec<Snapshot> = entries
            .into_iter()
            .filter(|e| e.key.ends_with(".json"))
            .map(|e| Snapshot {
                id: snapshot_id(&prefix, &e.key),
                key: e.key,
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.key.cmp(&b.key)));

        Ok(snapshots)
    }

    /// Fetch and parse one snapshot. Missing or unparseable snapshots yield `None`.
    pub async fn load(&self, key: &str) -> Result<Option<Manifest>> {
        let what = format!("{}/{}", self.location.bucket, key);
        let body = self
            .policy
            .run(&what, || self.store.get(&self.location.bucket, key))
            .await
            .with_context(|| format!("reading manifest {}", what))?;

        let Some(body) = body else {
            debug!("Manifest {} disappeared before it could be read", what);
            return Ok(None);
        };

        match Manifest::from_slice(&body) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!("Skipping unreadable manifest {}: {}", what, e);
                Ok(None)
            }
        }
    }

    /// Newest finalized manifest whose id lies within `[min_ts, max_ts]`.
    pub async fn resolve_for_read(&self, min_ts: i64, max_ts: i64) -> Result<Option<Manifest>> {
        let lineage = self.list_lineage().await?;

        for snapshot in lineage.iter().rev() {
            let id = snapshot.id as i64;
            if id < min_ts || id > max_ts {
                continue;
            }

            match self.load(&snapshot.key).await? {
                Some(manifest) if manifest.finalized => {
                    debug!("Resolved manifest {} for reading", snapshot.key);
                    return Ok(Some(manifest));
                }
                Some(_) => debug!("Skipping in-progress manifest {}", snapshot.key),
                None => {}
            }
        }

        Ok(None)
    }

    /// Pick the manifest an upload should work on.
    ///
    /// The newest snapshot is reused unless it is absent, unreadable, or
    /// finalized and older than `retention_secs`; in those cases a fresh,
    /// non-finalized manifest is created (but not yet stored).
    pub async fn resolve_or_create_for_write(&self, retention_secs: u64) -> Result<WriteSlot> {
        let lineage = self.list_lineage().await?;
        let now_ms = Utc::now().timestamp_millis();

        let newest = match lineage.last() {
            Some(snapshot) => Some((snapshot.id, self.load(&snapshot.key).await?)),
            None => None,
        };

        let (manifest, is_new, previous) = match newest {
            None => (self.fresh(now_ms, 0), true, None),
            Some((newest_id, None)) => {
                warn!("Newest manifest in {} is unreadable, starting a new one", self.location);
                (self.fresh(now_ms, newest_id), true, None)
            }
            Some((newest_id, Some(existing))) => {
                if existing.finalized && existing.is_expired(retention_secs, now_ms) {
                    info!(
                        "Manifest {} is {}s old (retention {}s), superseding it",
                        existing.location(),
                        existing.age_secs(now_ms),
                        retention_secs
                    );
                    (self.fresh(now_ms, newest_id), true, Some(existing))
                } else {
                    if !existing.finalized {
                        info!("Resuming in-progress manifest {}", existing.location());
                    }
                    (existing.clone(), false, Some(existing))
                }
            }
        };

        Ok(WriteSlot {
            manifest,
            is_new,
            previous,
            lineage,
        })
    }

    /// Load the state of every snapshot, newest first, for obsolete computation.
    pub async fn snapshot_states(&self, lineage: &[Snapshot]) -> Result<Vec<SnapshotInfo>> {
        let mut states = Vec::with_capacity(lineage.len());
        for snapshot in lineage.iter().rev() {
            let state = match self.load(&snapshot.key).await {
                Ok(Some(m)) if m.finalized => SnapshotState::Finalized,
                Ok(Some(_)) => SnapshotState::InProgress,
                Ok(None) => SnapshotState::Unreadable,
                Err(e) => {
                    warn!("Could not inspect manifest {}: {}", snapshot.key, e);
                    SnapshotState::Unreadable
                }
            };
            states.push(SnapshotInfo {
                key: snapshot.key.clone(),
                id: snapshot.id,
                state,
            });
        }
        Ok(states)
    }

    /// Obsolete snapshot keys of `lineage`, keeping `rotation` besides `current_id`.
    pub async fn find_obsoletes(&self, lineage: &[Snapshot], rotation: usize, current_id: u64) -> Result<Vec<String>> {
        let others = lineage.iter().filter(|s| s.id != current_id).count();
        if rotation == 0 || others <= rotation {
            return Ok(Vec::new());
        }

        let states = self.snapshot_states(lineage).await?;
        Ok(compute_obsoletes(&states, rotation, current_id))
    }

    /// Store `manifest` at its key, replacing any previous content.
    pub async fn write(&self, manifest: &Manifest) -> Result<()> {
        let body = Bytes::from(manifest.to_vec()?);
        let what = manifest.location();
        self.policy
            .run(&what, || self.store.put(&manifest.bucket, &manifest.key, body.clone()))
            .await
            .with_context(|| format!("writing manifest {}", what))?;
        Ok(())
    }

    fn fresh(&self, now_ms: i64, newest_id: u64) -> Manifest {
        // Ids must keep increasing even if the clock lags the newest snapshot.
        let id = (now_ms.max(0) as u64).max(newest_id.saturating_add(1));
        Manifest::new(&self.location, id, Utc::now().timestamp())
    }
}

/// Decide which snapshots have fallen out of the rotation.
///
/// `snapshots` must be ordered newest first. Walking that order and skipping
/// `current_id`, in-progress snapshots and finalized snapshots with a
/// positive id count towards the `rotation` kept; once that many have been
/// kept, every older snapshot is obsolete. Unreadable snapshots seen before
/// the cutoff are neither counted nor marked. A rotation of zero keeps
/// everything.
pub fn compute_obsoletes(snapshots: &[SnapshotInfo], rotation: usize, current_id: u64) -> Vec<String> {
    if rotation == 0 {
        return Vec::new();
    }

    let mut kept = 0usize;
    let mut obsoletes = Vec::new();

    for snapshot in snapshots {
        if snapshot.id == current_id {
            continue;
        }

        if kept >= rotation {
            obsoletes.push(snapshot.key.clone());
            continue;
        }

        let valid = match snapshot.state {
            SnapshotState::InProgress => true,
            SnapshotState::Finalized => snapshot.id > 0,
            SnapshotState::Unreadable => false,
        };
        if valid {
            kept += 1;
        }
    }

    obsoletes
}
