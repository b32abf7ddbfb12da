//! Download engine: rebuild a local tree from the newest finalized manifest.
//!
//! The manifest is resolved within the target's visibility window. A local
//! resumption marker records which manifest was last applied, so a finished
//! download is not repeated and an interrupted one is picked up again.
//!
//! With `wipe` set, stray local directories go before any file is fetched,
//! so nothing local can sit where a manifest file belongs; stray files go
//! once every manifest file is in place.

use super::lineage::ManifestStore;
use super::manifest::{FileRecord, Manifest};
use super::marker::{ResumptionMarker, StatePaths};
use super::{join_error, located, run_workers, Outcome, SyncReport};
use crate::config::{Direction, Location, SyncTarget};
use crate::fs::metadata::{parent_keys, resolve_relative};
use crate::fs::walker::list_local_entries;
use crate::store::ObjectStore;
use crate::sync::compress::{write_object, Encoding};
use crate::sync::fingerprint::{fingerprint_file, object_key};
use crate::transfer::progress::{format_bytes, ProgressTracker};
use crate::transfer::retry::RetryPolicy;
use crate::utils::errors::{Result, ResultExt, SyncError};
use chrono::Utc;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DownloadEngine {
    store: Arc<dyn ObjectStore>,
    target: SyncTarget,
    remote: Location,
    status: Location,
    manifests: ManifestStore,
    policy: RetryPolicy,
    paths: StatePaths,
}

impl DownloadEngine {
    /// Parse the target's locations. Bad locations fail here, before any work.
    pub fn new(store: Arc<dyn ObjectStore>, target: SyncTarget, paths: StatePaths) -> Result<Self> {
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
            paths,
        })
    }

    pub async fn run(self, cancel: &CancellationToken) -> Result<SyncReport> {
        let root = self.target.local_root().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SyncError::Config(format!("cannot create destination {}: {}", root.display(), e))
        })?;

        let manifest = self
            .manifests
            .resolve_for_read(self.target.min_timestamp, self.target.max_timestamp)
            .await
            .map_err(|e| located(e, &self.status))?
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "no finalized manifest in {} between {} and {}",
                    self.status, self.target.min_timestamp, self.target.max_timestamp
                ))
            })?;

        let tracker = ProgressTracker::new(
            self.target.id.clone(),
            Direction::Download,
            (),
            Some(self.paths.info_path()),
        );
        tracker.set_totals(manifest.total_bytes(), manifest.files.len()).await;

        let marker = self.paths.read_marker().await;
        if marker.is_complete_for(manifest.id) {
            info!(
                "Manifest {} already applied to {}, nothing to download",
                manifest.location(),
                root.display()
            );
            return Ok(SyncReport {
                target_id: self.target.id.clone(),
                direction: Direction::Download,
                outcome: Outcome::UpToDate {
                    manifest_id: manifest.id,
                },
                progress: tracker.finish(true).await,
                cleanup: None,
            });
        }

        self.paths
            .write_marker(&ResumptionMarker {
                id: manifest.id,
                version: manifest.version,
                finalized: false,
                timestamp: Utc::now().timestamp(),
            })
            .await?;

        info!(
            "Applying manifest {} (version {}, {} files, {}) to {}",
            manifest.location(),
            manifest.version,
            manifest.files.len(),
            format_bytes(manifest.total_bytes()),
            root.display()
        );

        let run = Arc::new(DownloadRun {
            store: Arc::clone(&self.store),
            remote: self.remote.clone(),
            policy: self.policy,
            verify: self.target.verify,
            root: root.clone(),
            tracker,
        });

        let result = self.apply(&run, &manifest, cancel).await;
        if let Err(e) = result {
            run.tracker.finish(false).await;
            return Err(e);
        }

        if self.target.wipe {
            if let Err(e) = wipe_files(&root, &manifest, self.target.recursive).await {
                run.tracker.finish(false).await;
                return Err(e);
            }
        }

        self.paths
            .write_marker(&ResumptionMarker {
                id: manifest.id,
                version: manifest.version,
                finalized: true,
                timestamp: Utc::now().timestamp(),
            })
            .await?;

        Ok(SyncReport {
            target_id: self.target.id.clone(),
            direction: Direction::Download,
            outcome: Outcome::Synced {
                manifest_id: manifest.id,
                version: manifest.version,
            },
            progress: run.tracker.finish(true).await,
            cleanup: None,
        })
    }

    async fn apply(&self, run: &Arc<DownloadRun>, manifest: &Manifest, cancel: &CancellationToken) -> Result<()> {
        if self.target.wipe {
            wipe_directories(&run.root, manifest, self.target.recursive).await?;
        }

        for directory in &manifest.directories {
            let path = resolve_relative(&run.root, &directory.path).ok_or_else(|| escaping(&directory.path))?;
            tokio::fs::create_dir_all(&path).await?;
        }

        let worker_run = Arc::clone(run);
        run_workers(
            manifest.files.clone(),
            self.target.workers(),
            cancel,
            move |record: FileRecord| {
                let run = Arc::clone(&worker_run);
                async move {
                    let relative = record.path.clone();
                    run.download_file(record).await.with_context(|| relative)
                }
            },
        )
        .await
        .map_err(|e| located(e, &self.remote))
    }
}

/// State shared by every worker of one download run.
struct DownloadRun {
    store: Arc<dyn ObjectStore>,
    remote: Location,
    policy: RetryPolicy,
    verify: bool,
    root: PathBuf,
    tracker: ProgressTracker,
}

impl DownloadRun {
    async fn download_file(&self, record: FileRecord) -> Result<()> {
        let path = resolve_relative(&self.root, &record.path).ok_or_else(|| escaping(&record.path))?;

        if local_matches(&path, &record).await? {
            debug!("Up to date: {}", record.path);
            self.tracker.file_done(record.length).await;
            return Ok(());
        }

        let encoding = Encoding::from_properties(&record.properties)?;
        let key = object_key(&self.remote, &record.md5);
        let what = format!("{}/{}", self.remote.bucket, key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_if_present(&path).await?;

        let store = &self.store;
        let bucket = self.remote.bucket.as_str();
        let (key, target) = (key.as_str(), path.as_path());
        let written = self
            .policy
            .run(&what, move || async move {
                let body = store
                    .get_stream(bucket, key)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("object {}/{}", bucket, key)))?;
                write_object(body, encoding, target).await
            })
            .await?;

        if written.raw != record.length {
            warn!(
                "{} is {} bytes on disk, manifest says {}",
                record.path, written.raw, record.length
            );
        }

        if self.verify {
            let actual = fingerprint_of(&path).await?;
            if actual != record.md5 {
                return Err(SyncError::Integrity(format!(
                    "{} has fingerprint {} after download, expected {}",
                    record.path, actual, record.md5
                )));
            }
        }

        debug!("Downloaded {} from {} ({})", record.path, what, encoding.as_str());
        self.tracker.record_transfer(written.raw, written.stored).await;
        self.tracker.file_done(record.length).await;
        Ok(())
    }
}

/// True when the local file already holds the record's content.
async fn local_matches(path: &Path, record: &FileRecord) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == record.length => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    Ok(fingerprint_of(path).await? == record.md5)
}

async fn fingerprint_of(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await
        .map_err(join_error)?
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn escaping(key: &str) -> SyncError {
    SyncError::Integrity(format!("manifest path '{}' escapes the destination", key))
}

/// Directories a manifest accounts for: the listed ones plus every parent of a listed file.
fn kept_directories(manifest: &Manifest) -> HashSet<&str> {
    let mut keep: HashSet<&str> = manifest.directories.iter().map(|d| d.path.as_str()).collect();
    for file in &manifest.files {
        keep.extend(parent_keys(&file.path));
    }
    keep
}

async fn scan_local(root: &Path, recursive: bool) -> Result<(Vec<String>, Vec<String>)> {
    let scan_root = root.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || list_local_entries(&scan_root, recursive))
        .await
        .map_err(join_error)??;
    Ok(entries)
}

/// Delete local directories the manifest does not account for, along with
/// any local file sitting where the manifest expects a directory.
async fn wipe_directories(root: &Path, manifest: &Manifest, recursive: bool) -> Result<()> {
    let keep = kept_directories(manifest);
    let (files, mut directories) = scan_local(root, recursive).await?;

    let mut removed = 0usize;
    for file in files.iter().filter(|f| keep.contains(f.as_str())) {
        debug!("Wiping file {} in the way of a directory", file);
        remove_if_present(&root.join(file)).await?;
        removed += 1;
    }

    // Shallowest first; removing a parent takes its children with it.
    directories.sort_by_key(|d| d.matches('/').count());
    for dir in directories.iter().filter(|d| !keep.contains(d.as_str())) {
        match tokio::fs::remove_dir_all(root.join(dir)).await {
            Ok(()) => {
                debug!("Wiped directory {}", dir);
                removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if removed > 0 {
        info!("Wiped {} extraneous directories from {}", removed, root.display());
    }
    Ok(())
}

/// Delete local files the manifest does not list.
async fn wipe_files(root: &Path, manifest: &Manifest, recursive: bool) -> Result<()> {
    let keep: HashSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    let (files, _) = scan_local(root, recursive).await?;

    let mut removed = 0usize;
    for file in files.iter().filter(|f| !keep.contains(f.as_str())) {
        debug!("Wiping file {}", file);
        remove_if_present(&root.join(file)).await?;
        removed += 1;
    }

    if removed > 0 {
        info!("Wiped {} extraneous files from {}", removed, root.display());
    }
    Ok(())
}
