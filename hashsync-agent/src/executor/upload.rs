//! Upload engine: local tree to content-addressed objects plus a finalized manifest.
//!
//! Every regular file below the source root is fingerprinted and stored once
//! under `<destination>/<md5>`. Files whose length and last-write time match
//! the previous manifest are not re-read. Content already present in the store
//! (found with a head request) is never transferred again, and files with equal
//! content inside one run share a single transfer.
//!
//! Bodies are streamed from disk, never buffered whole. A file whose bytes
//! stop matching its fingerprint mid-upload is fingerprinted again, within
//! the target's retry budget.

use super::cleanup::RetentionCleaner;
use super::lineage::ManifestStore;
use super::manifest::{DirectoryRecord, FileRecord, Manifest};
use super::marker::StatePaths;
use super::{join_error, located, run_workers, Outcome, SyncReport};
use crate::config::{Direction, Location, SyncTarget};
use crate::fs::metadata::modified_millis;
use crate::fs::walker::{depth_for, walk_directory, FileInfo, WalkOptions};
use crate::store::{reader_stream, ObjectStore};
use crate::sync::compress::{compress_file, scratch_path, worth_keeping, Encoding, Packed};
use crate::sync::fingerprint::{fingerprint_bytes, fingerprint_file_sized, object_key};
use crate::transfer::digest_stream::DigestStream;
use crate::transfer::progress::{format_bytes, ProgressTracker};
use crate::transfer::retry::RetryPolicy;
use crate::utils::errors::{Result, ResultExt, SyncError};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Encoding of content stored (or being stored) during this run, per fingerprint.
type InFlight = Arc<Mutex<Option<Encoding>>>;

/// Run state kept behind the tracker's lock.
#[derive(Debug, Default)]
struct UploadLedger {
    records: Vec<FileRecord>,

    /// Version written with the in-progress sentinel, once it exists
    in_progress_version: Option<u64>,

    in_flight: HashMap<String, InFlight>,

    transfers: usize,
}

pub struct UploadEngine {
    store: Arc<dyn ObjectStore>,
    target: SyncTarget,
    remote: Location,
    status: Location,
    manifests: ManifestStore,
    policy: RetryPolicy,
    scratch_dir: PathBuf,
    paths: StatePaths,
}

impl UploadEngine {
    /// Parse the target's locations. Bad locations fail here, before any work.
    pub fn new(store: Arc<dyn ObjectStore>, target: SyncTarget, scratch_dir: PathBuf, paths: StatePaths) -> Result<Self> {
        let remote = target.remote_location()?;
        let status = target.status_location()?;
        let policy = RetryPolicy::from_target(&target);
        let manifests = ManifestStore::new(Arc::clone(&store), status.clone(), policy);

        Ok(Self {
            store,
            target,
            remote,
            status,
            manifests,
            policy,
            scratch_dir,
            paths,
        })
    }

    pub async fn run(self, cancel: &CancellationToken) -> Result<SyncReport> {
        let source_root = self.target.local_root().to_path_buf();
        if !source_root.is_dir() {
            return Err(SyncError::Config(format!(
                "source directory {} does not exist",
                source_root.display()
            )));
        }

        // A missing destination bucket must surface before anything is read or written.
        let empty_key = object_key(&self.remote, &fingerprint_bytes(b""));
        self.policy
            .run(&format!("{}/{}", self.remote.bucket, empty_key), || {
                self.store.head(&self.remote.bucket, &empty_key)
            })
            .await
            .map_err(|e| located(e, &self.remote))?;

        let options = WalkOptions {
            max_depth: depth_for(self.target.recursive),
            exclude_patterns: self.target.exclude.clone(),
        };
        let root = source_root.clone();
        let tree = tokio::task::spawn_blocking(move || walk_directory(&root, &options))
            .await
            .map_err(join_error)??;

        info!(
            "Scanned {}: {} files, {} directories, {}",
            source_root.display(),
            tree.files.len(),
            tree.directories.len(),
            format_bytes(tree.total_bytes())
        );

        let slot = self
            .manifests
            .resolve_or_create_for_write(self.target.retention_secs)
            .await
            .map_err(|e| located(e, &self.status))?;

        let tracker = ProgressTracker::new(
            self.target.id.clone(),
            Direction::Upload,
            UploadLedger::default(),
            Some(self.paths.info_path()),
        );
        tracker.set_totals(tree.total_bytes(), tree.files.len()).await;

        if !slot.is_new && slot.manifest.finalized {
            info!(
                "Manifest {} is finalized and within retention, nothing to upload",
                slot.manifest.location()
            );
            return Ok(SyncReport {
                target_id: self.target.id.clone(),
                direction: Direction::Upload,
                outcome: Outcome::Unchanged {
                    manifest_id: slot.manifest.id,
                },
                progress: tracker.finish(true).await,
                cleanup: None,
            });
        }

        let reuse: HashMap<String, FileRecord> = slot
            .previous
            .as_ref()
            .map(|p| p.files.iter().map(|f| (f.path.clone(), f.clone())).collect())
            .unwrap_or_default();

        let run = Arc::new(UploadRun {
            store: Arc::clone(&self.store),
            remote: self.remote.clone(),
            manifests: self.manifests,
            policy: self.policy,
            compression: self
                .target
                .compress
                .then_some(self.target.compression_level),
            scratch_dir: self.scratch_dir.clone(),
            working: slot.manifest.clone(),
            started: Utc::now().timestamp(),
            source: self.target.source.clone(),
            destination: self.target.destination.clone(),
            reuse,
            tracker,
        });

        info!(
            "Uploading {} files to {} with {} workers",
            tree.files.len(),
            self.remote,
            self.target.workers()
        );

        let worker_run = Arc::clone(&run);
        let result = run_workers(tree.files, self.target.workers(), cancel, move |file: FileInfo| {
            let run = Arc::clone(&worker_run);
            async move {
                let relative = file.relative_path.clone();
                run.upload_file(file).await.with_context(|| relative)
            }
        })
        .await;

        if let Err(e) = result {
            run.tracker.finish(false).await;
            return Err(located(e, &self.remote));
        }

        let (mut records, transfers, in_progress_version) = {
            let mut state = run.tracker.lock().await;
            (
                std::mem::take(&mut state.ledger.records),
                state.ledger.transfers,
                state.ledger.in_progress_version,
            )
        };
        records.sort_by(|a, b| a.path.cmp(&b.path));

        let mut directories: Vec<DirectoryRecord> = tree
            .directories
            .into_iter()
            .map(|path| DirectoryRecord { path })
            .collect();
        directories.sort();

        let changed = transfers > 0
            || match &slot.previous {
                None => true,
                Some(previous) => !previous.finalized || !previous.same_content(&records, &directories),
            };

        let current_id = match (&slot.previous, changed) {
            (Some(previous), false) => previous.id,
            _ => run.working.id,
        };

        let obsoletes = if self.target.rotation == 0 {
            Vec::new()
        } else {
            match run
                .manifests
                .find_obsoletes(&slot.lineage, self.target.rotation, current_id)
                .await
            {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Could not compute obsolete manifests for {}: {}", self.status, e);
                    Vec::new()
                }
            }
        };

        let outcome = if changed {
            let mut manifest = run.working.clone();
            manifest.version = in_progress_version.unwrap_or(manifest.version + 1);
            manifest.finalized = true;
            manifest.timestamp = Utc::now().timestamp();
            manifest.files = records;
            manifest.directories = directories;
            manifest.obsoletes = obsoletes.clone();
            manifest.source = Some(run.source.clone());
            manifest.destination = Some(run.destination.clone());

            if let Err(e) = run.manifests.write(&manifest).await {
                run.tracker.finish(false).await;
                return Err(located(e, &self.status));
            }

            info!(
                "Finalized manifest {} (version {}, {} files, {} transferred)",
                manifest.location(),
                manifest.version,
                manifest.files.len(),
                transfers
            );
            Outcome::Synced {
                manifest_id: manifest.id,
                version: manifest.version,
            }
        } else {
            info!("No changes since manifest {}, leaving it in place", current_id);
            Outcome::Unchanged { manifest_id: current_id }
        };

        let cleanup = if self.target.cleanup && !obsoletes.is_empty() {
            let cleaner = RetentionCleaner::new(Arc::clone(&self.store), self.status.bucket.clone(), self.policy);
            Some(cleaner.run(&obsoletes).await)
        } else {
            None
        };

        Ok(SyncReport {
            target_id: self.target.id.clone(),
            direction: Direction::Upload,
            outcome,
            progress: run.tracker.finish(true).await,
            cleanup,
        })
    }
}

/// State shared by every worker of one upload run.
struct UploadRun {
    store: Arc<dyn ObjectStore>,
    remote: Location,
    manifests: ManifestStore,
    policy: RetryPolicy,

    /// zstd level, when compression is enabled
    compression: Option<i32>,

    scratch_dir: PathBuf,
    working: Manifest,

    /// Unix seconds
    started: i64,

    source: String,
    destination: String,

    /// Records of the previous manifest, by path
    reuse: HashMap<String, FileRecord>,

    tracker: ProgressTracker<UploadLedger>,
}

impl UploadRun {
    async fn upload_file(&self, file: FileInfo) -> Result<()> {
        let previous = self.reuse.get(&file.relative_path);

        if let Some(prev) = previous {
            if prev.length == file.size && prev.last_write_time == file.modified {
                debug!("Unchanged: {}", file.relative_path);
                return self.finish_file(prev.clone(), file.size).await;
            }
        }

        let attempts = self.policy.retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.upload_content(&file, previous).await {
                Ok(record) => return self.finish_file(record, file.size).await,
                Err(e) if matches!(e.root(), SyncError::ContentChanged(_)) => {
                    debug!(
                        "{} changed while being uploaded (attempt {}/{}): {}",
                        file.relative_path, attempt, attempts, e
                    );
                    if attempt < attempts && !self.policy.delay.is_zero() {
                        tokio::time::sleep(self.policy.delay * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match previous {
            Some(prev) => {
                warn!(
                    "{} kept changing during upload, keeping the version from the previous manifest",
                    file.relative_path
                );
                self.finish_file(prev.clone(), file.size).await
            }
            None => {
                warn!(
                    "{} kept changing during upload, leaving it out of this manifest",
                    file.relative_path
                );
                self.tracker.file_done(file.size).await;
                Ok(())
            }
        }
    }

    /// Fingerprint the file as it is now and make sure its content is stored.
    async fn upload_content(&self, file: &FileInfo, previous: Option<&FileRecord>) -> Result<FileRecord> {
        let metadata = tokio::fs::metadata(&file.path)
            .await
            .map_err(|e| SyncError::Transient(format!("reading {}: {}", file.path.display(), e)))?;

        let path = file.path.clone();
        let (fingerprint, length) = tokio::task::spawn_blocking(move || fingerprint_file_sized(&path))
            .await
            .map_err(join_error)??;

        let mut record = FileRecord::new(&file.relative_path, length, &fingerprint, modified_millis(&metadata));

        match previous.filter(|prev| prev.md5 == fingerprint) {
            Some(prev) => {
                debug!("Touched but identical: {}", file.relative_path);
                record.properties = prev.properties.clone();
            }
            None => {
                let encoding = self.store_content(file, &fingerprint, length).await?;
                encoding.apply(&mut record.properties);
            }
        }

        Ok(record)
    }

    /// Make sure the object for `fingerprint` exists, transferring it if needed.
    async fn store_content(&self, file: &FileInfo, fingerprint: &str, length: u64) -> Result<Encoding> {
        let cell = {
            let mut state = self.tracker.lock().await;
            Arc::clone(state.ledger.in_flight.entry(fingerprint.to_string()).or_default())
        };

        // Held for the whole head check and transfer so equal content is only sent once.
        let mut stored = cell.lock().await;
        if let Some(encoding) = *stored {
            debug!("Content of {} already handled in this run", file.relative_path);
            return Ok(encoding);
        }

        let key = object_key(&self.remote, fingerprint);
        let what = format!("{}/{}", self.remote.bucket, key);

        let existing = self
            .policy
            .run(&what, || self.store.head(&self.remote.bucket, &key))
            .await?;

        let encoding = match existing {
            Some(stored_len) => {
                debug!("Object {} already stored, skipping {}", what, file.relative_path);
                Encoding::infer(length, stored_len)
            }
            None => self.transfer(file, fingerprint, &key, &what).await?,
        };

        *stored = Some(encoding);
        Ok(encoding)
    }

    async fn transfer(&self, file: &FileInfo, fingerprint: &str, key: &str, what: &str) -> Result<Encoding> {
        let packed = match self.compression {
            Some(level) => self.pack(file, fingerprint, level).await?,
            None => None,
        };

        let sent = async {
            self.mark_in_progress().await?;
            match &packed {
                Some((scratch, _)) => self.put_file(scratch, None, key, what).await,
                None => self.put_file(&file.path, Some(fingerprint), key, what).await,
            }
        }
        .await;

        if let Some((scratch, _)) = &packed {
            remove_scratch(scratch).await;
        }
        let stored_len = sent?;

        let (encoding, raw_len) = match &packed {
            Some((_, packed)) => (Encoding::Zstd, packed.raw_len),
            None => (Encoding::Raw, stored_len),
        };

        info!(
            "Uploaded {} to {} ({} as {})",
            file.relative_path,
            what,
            format_bytes(raw_len),
            encoding.as_str()
        );

        let mut state = self.tracker.lock().await;
        state.ledger.transfers += 1;
        state.add_transferred(raw_len, stored_len);
        Ok(encoding)
    }

    /// zstd-encode the file into scratch space. `None` when the copy would not
    /// save enough to be worth storing.
    async fn pack(&self, file: &FileInfo, fingerprint: &str, level: i32) -> Result<Option<(PathBuf, Packed)>> {
        let scratch = scratch_path(&self.scratch_dir, fingerprint);
        let (source, dest) = (file.path.clone(), scratch.clone());
        let packed = tokio::task::spawn_blocking(move || compress_file(&source, &dest, level))
            .await
            .map_err(join_error)?;

        let packed = match packed {
            Ok(packed) if packed.fingerprint == fingerprint => packed,
            Ok(packed) => {
                remove_scratch(&scratch).await;
                debug!("{} now fingerprints as {}", file.relative_path, packed.fingerprint);
                return Err(changed(&file.path, fingerprint));
            }
            Err(e) => {
                remove_scratch(&scratch).await;
                return Err(e);
            }
        };

        if !worth_keeping(packed.raw_len, packed.packed_len) {
            remove_scratch(&scratch).await;
            return Ok(None);
        }
        Ok(Some((scratch, packed)))
    }

    /// Stream `path` to `key`, returning the bytes sent.
    ///
    /// With `expected` set, content that no longer matches that fingerprint is
    /// refused before the store keeps anything.
    async fn put_file(&self, path: &Path, expected: Option<&str>, key: &str, what: &str) -> Result<u64> {
        let store = &self.store;
        let bucket = self.remote.bucket.as_str();

        self.policy
            .run(what, move || async move {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| SyncError::Transient(format!("reading {}: {}", path.display(), e)))?;
                let (body, check) = DigestStream::new(reader_stream(file), expected.map(str::to_string));

                match store.put_stream(bucket, key, Box::pin(body)).await {
                    Ok(_) => Ok(check.bytes()),
                    Err(_) if check.mismatched() => Err(changed(path, expected.unwrap_or_default())),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Write the in-progress sentinel once per run, before the first transfer.
    async fn mark_in_progress(&self) -> Result<()> {
        let mut state = self.tracker.lock().await;
        if state.ledger.in_progress_version.is_some() {
            return Ok(());
        }

        let mut sentinel = self.working.clone();
        sentinel.finalized = false;
        sentinel.version += 1;
        sentinel.timestamp = self.started;
        sentinel.source = Some(self.source.clone());
        sentinel.destination = Some(self.destination.clone());

        self.manifests.write(&sentinel).await?;
        info!("Manifest {} marked in progress", sentinel.location());

        state.ledger.in_progress_version = Some(sentinel.version);
        Ok(())
    }

    async fn finish_file(&self, record: FileRecord, bytes: u64) -> Result<()> {
        self.tracker.lock().await.ledger.records.push(record);
        self.tracker.file_done(bytes).await;
        Ok(())
    }
}

fn changed(path: &Path, fingerprint: &str) -> SyncError {
    SyncError::ContentChanged(format!("{} no longer matches fingerprint {}", path.display(), fingerprint))
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove scratch file {}: {}", path.display(), e);
    }
}
