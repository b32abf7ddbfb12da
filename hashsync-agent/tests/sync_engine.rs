use hashsync_agent::config::{Direction, SyncTarget};
use hashsync_agent::executor::manifest::Manifest;
use hashsync_agent::fs::walker::list_local_entries;
use hashsync_agent::store::{ByteStream, DeleteOutcome, LocalStore, MemoryStore, ObjectEntry, ObjectStore};
use hashsync_agent::sync::fingerprint::fingerprint_bytes;
use hashsync_agent::{Executor, Outcome, Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    source: PathBuf,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let source = root.join("source");
        std::fs::create_dir_all(&source).unwrap();

        Self {
            _temp: temp,
            root,
            source,
            store: Arc::new(MemoryStore::with_buckets(&["data"])),
        }
    }

    fn write(&self, relative: &str, content: &[u8]) {
        let path = self.source.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn dest(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn executor(&self) -> Executor {
        Executor::new(self.store.clone(), self.root.join("state"), self.root.join("scratch"))
    }

    fn upload(&self) -> SyncTarget {
        let mut target = SyncTarget::new(
            "up",
            Direction::Upload,
            self.source.to_string_lossy(),
            "data/objects",
            "data/status",
        );
        target.retry = 0;
        target.retry_delay_ms = 0;
        target.timeout_ms = 5_000;
        target
    }

    fn download(&self, id: &str, dest: &Path) -> SyncTarget {
        let mut target = SyncTarget::new(
            id,
            Direction::Download,
            "data/objects",
            dest.to_string_lossy(),
            "data/status",
        );
        target.retry = 0;
        target.retry_delay_ms = 0;
        target.timeout_ms = 5_000;
        target
    }

    fn object_keys(&self) -> Vec<String> {
        self.store.keys("data", "objects/")
    }

    fn status_keys(&self) -> Vec<String> {
        self.store.keys("data", "status/")
    }

    /// Every stored manifest, oldest first.
    async fn manifests(&self) -> Vec<Manifest> {
        let mut manifests = Vec::new();
        for key in self.status_keys() {
            if let Some(body) = self.store.get("data", &key).await.unwrap() {
                manifests.push(Manifest::from_slice(&body).unwrap());
            }
        }
        manifests.sort_by_key(|m| m.id);
        manifests
    }

    async fn latest(&self) -> Manifest {
        self.manifests().await.pop().expect("at least one manifest")
    }
}

/// Relative file paths with their content, plus relative directory paths.
fn snapshot_tree(root: &Path) -> (Vec<(String, Vec<u8>)>, Vec<String>) {
    let (files, dirs) = list_local_entries(root, true).unwrap();
    let files = files
        .into_iter()
        .map(|f| {
            let content = std::fs::read(root.join(&f)).unwrap();
            (f, content)
        })
        .collect();
    (files, dirs)
}

#[tokio::test]
async fn test_identical_files_share_one_object() {
    let fx = Fixture::new();
    fx.write("a.txt", b"hello world");
    fx.write("b.txt", b"hello world");

    let report = fx.executor().process(&fx.upload()).await.unwrap();
    assert!(matches!(report.outcome, Outcome::Synced { .. }));

    let md5 = fingerprint_bytes(b"hello world");
    assert_eq!(fx.object_keys(), vec![format!("objects/{}", md5)]);

    let object_puts = fx
        .store
        .put_log()
        .into_iter()
        .filter(|k| k.starts_with("objects/"))
        .count();
    assert_eq!(object_puts, 1);

    let manifest = fx.latest().await;
    assert!(manifest.finalized);
    assert_eq!(manifest.files.len(), 2);
    assert!(manifest.files.iter().all(|f| f.md5 == md5));
    assert_eq!(report.progress.files_transferred, 1);
}

#[tokio::test]
async fn test_every_record_points_at_a_stored_object() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    fx.write("dir/b.txt", b"two");
    fx.write("dir/deeper/c.txt", b"three");

    fx.executor().process(&fx.upload()).await.unwrap();

    let manifest = fx.latest().await;
    let objects = fx.object_keys();
    for record in &manifest.files {
        assert!(objects.contains(&format!("objects/{}", record.md5)), "{}", record.path);
    }
    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "dir/b.txt", "dir/deeper/c.txt"]);
}

#[tokio::test]
async fn test_upload_twice_is_idempotent() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write("nested/b.txt", b"beta");
    let executor = fx.executor();

    let first = executor.process(&fx.upload()).await.unwrap();
    let before = fx.latest().await;
    fx.store.clear_put_log();

    let second = executor.process(&fx.upload()).await.unwrap();
    let after = fx.latest().await;

    assert_eq!(second.outcome, Outcome::Unchanged { manifest_id: first.outcome.manifest_id() });
    assert_eq!(before.id, after.id);
    assert_eq!(before.version, after.version);
    assert!(fx.store.put_log().is_empty());
}

#[tokio::test]
async fn test_unchanged_tree_after_retention_writes_nothing() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;

    let first = executor.process(&target).await.unwrap();
    fx.store.clear_put_log();

    let second = executor.process(&target).await.unwrap();

    assert_eq!(second.outcome, Outcome::Unchanged { manifest_id: first.outcome.manifest_id() });
    assert!(fx.store.put_log().is_empty());
    assert_eq!(fx.status_keys().len(), 1);
}

#[tokio::test]
async fn test_round_trip() {
    let fx = Fixture::new();
    fx.write("readme.md", b"# title\n");
    fx.write("src/main.rs", b"fn main() {}\n");
    fx.write("src/copy.rs", b"fn main() {}\n");
    fx.write("assets/big.txt", "line of text\n".repeat(2000).as_bytes());
    fx.write("zero.bin", b"");
    std::fs::create_dir_all(fx.source.join("empty/inner")).unwrap();

    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let dest = fx.dest("restore");
    let report = executor.process(&fx.download("down", &dest)).await.unwrap();
    assert!(matches!(report.outcome, Outcome::Synced { .. }));
    assert!(report.progress.success);

    assert_eq!(snapshot_tree(&fx.source), snapshot_tree(&dest));
}

#[tokio::test]
async fn test_round_trip_with_compression() {
    let fx = Fixture::new();
    let big = "compressible content, compressible content\n".repeat(1000);
    fx.write("big.txt", big.as_bytes());
    fx.write("small.txt", b"tiny");

    let mut target = fx.upload();
    target.compress = true;
    let executor = fx.executor();
    let report = executor.process(&target).await.unwrap();
    assert!(report.progress.transferred < report.progress.total);

    let manifest = fx.latest().await;
    let big_record = manifest.files.iter().find(|f| f.path == "big.txt").unwrap();
    let small_record = manifest.files.iter().find(|f| f.path == "small.txt").unwrap();
    assert_eq!(big_record.properties.get("compress").map(String::as_str), Some("zstd"));
    assert!(small_record.properties.is_empty());

    let stored = fx
        .store
        .head("data", &format!("objects/{}", big_record.md5))
        .await
        .unwrap()
        .unwrap();
    assert!(stored < big.len() as u64);

    let dest = fx.dest("restore");
    executor.process(&fx.download("down", &dest)).await.unwrap();
    assert_eq!(std::fs::read_to_string(dest.join("big.txt")).unwrap(), big);
    assert_eq!(std::fs::read(dest.join("small.txt")).unwrap(), b"tiny");
}

#[tokio::test]
async fn test_interrupted_upload_resumes_without_resending() {
    let fx = Fixture::new();
    fx.write("a.txt", b"first file");
    fx.write("b.txt", b"second file");
    fx.write("c.txt", b"third file");
    let executor = fx.executor();

    // The in-progress manifest and one object get through.
    fx.store.fail_puts_after(2);
    let err = executor.process(&fx.upload()).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Transient(_)));

    let interrupted = fx.latest().await;
    assert!(!interrupted.finalized);
    let stored_before = fx.object_keys();
    assert_eq!(stored_before.len(), 1);

    fx.store.clear_faults();
    fx.store.clear_put_log();
    let report = executor.process(&fx.upload()).await.unwrap();

    let resent: Vec<String> = fx
        .store
        .put_log()
        .into_iter()
        .filter(|k| stored_before.contains(k))
        .collect();
    assert!(resent.is_empty(), "re-sent {:?}", resent);

    let manifest = fx.latest().await;
    assert!(manifest.finalized);
    assert_eq!(manifest.id, interrupted.id);
    assert_eq!(report.outcome.manifest_id(), interrupted.id);
    assert_eq!(manifest.files.len(), 3);
    assert_eq!(fx.object_keys().len(), 3);
}

#[tokio::test]
async fn test_rotation_bounds_the_lineage() {
    let fx = Fixture::new();
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;
    target.rotation = 2;

    for i in 0..6 {
        // A different length each round so the file always counts as changed.
        fx.write("v.txt", "x".repeat(i + 1).as_bytes());
        executor.process(&target).await.unwrap();
        assert!(fx.status_keys().len() <= target.rotation + 1);
    }

    let manifests = fx.manifests().await;
    assert_eq!(manifests.len(), 3);
    assert!(manifests.iter().all(|m| m.finalized));
    assert!(!manifests[2].obsoletes.is_empty());
}

#[tokio::test]
async fn test_cleanup_failures_do_not_fail_the_upload() {
    let fx = Fixture::new();
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;
    target.rotation = 1;

    fx.write("v.txt", b"1");
    executor.process(&target).await.unwrap();
    let oldest = fx.status_keys()[0].clone();
    fx.store.fail_delete_of(&oldest);

    fx.write("v.txt", b"22");
    executor.process(&target).await.unwrap();
    fx.write("v.txt", b"333");
    let report = executor.process(&target).await.unwrap();

    let cleanup = report.cleanup.expect("cleanup ran");
    assert!(cleanup.failed.iter().any(|f| f.starts_with(&oldest)));
    assert!(fx.status_keys().contains(&oldest));
}

#[tokio::test]
async fn test_download_window_selects_manifest() {
    let fx = Fixture::new();
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;
    target.rotation = 0;

    fx.write("a.txt", b"old");
    let first = executor.process(&target).await.unwrap().outcome.manifest_id();
    fx.write("a.txt", b"newer");
    let second = executor.process(&target).await.unwrap().outcome.manifest_id();
    assert!(second > first);

    let old_dest = fx.dest("old");
    let mut old_target = fx.download("old", &old_dest);
    old_target.max_timestamp = first as i64;
    let report = executor.process(&old_target).await.unwrap();
    assert_eq!(report.outcome.manifest_id(), first);
    assert_eq!(std::fs::read(old_dest.join("a.txt")).unwrap(), b"old");

    let new_dest = fx.dest("new");
    let mut new_target = fx.download("new", &new_dest);
    new_target.min_timestamp = first as i64 + 1;
    let report = executor.process(&new_target).await.unwrap();
    assert_eq!(report.outcome.manifest_id(), second);
    assert_eq!(std::fs::read(new_dest.join("a.txt")).unwrap(), b"newer");

    let mut empty_window = fx.download("none", &fx.dest("none"));
    empty_window.min_timestamp = second as i64 + 1;
    let err = executor.process(&empty_window).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_download_ignores_in_progress_manifest() {
    let fx = Fixture::new();
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;

    fx.write("a.txt", b"published");
    executor.process(&target).await.unwrap();

    // Interrupt the next upload after its in-progress manifest is written.
    fx.write("a.txt", b"half-way there");
    fx.store.fail_puts_after(1);
    assert!(executor.process(&target).await.is_err());
    fx.store.clear_faults();
    assert!(!fx.latest().await.finalized);

    let dest = fx.dest("restore");
    executor.process(&fx.download("down", &dest)).await.unwrap();
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"published");
}

#[tokio::test]
async fn test_empty_source_publishes_empty_manifest() {
    let fx = Fixture::new();

    let report = fx.executor().process(&fx.upload()).await.unwrap();
    assert!(matches!(report.outcome, Outcome::Synced { .. }));

    let manifest = fx.latest().await;
    assert!(manifest.finalized);
    assert!(manifest.files.is_empty());
    assert!(manifest.directories.is_empty());
    assert!(fx.object_keys().is_empty());
}

#[tokio::test]
async fn test_wipe_removes_extraneous_local_files() {
    let fx = Fixture::new();
    fx.write("a.txt", b"keep me");
    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let dest = fx.dest("restore");
    std::fs::create_dir_all(dest.join("stray")).unwrap();
    std::fs::write(dest.join("c.txt"), b"leftover").unwrap();

    let mut plain = fx.download("plain", &dest);
    plain.wipe = false;
    executor.process(&plain).await.unwrap();
    assert!(dest.join("c.txt").exists());

    let mut wiping = fx.download("wiping", &dest);
    wiping.wipe = true;
    executor.process(&wiping).await.unwrap();

    assert!(!dest.join("c.txt").exists());
    assert!(!dest.join("stray").exists());
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"keep me");
}

#[tokio::test]
async fn test_second_download_is_up_to_date() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    let executor = fx.executor();
    let uploaded = executor.process(&fx.upload()).await.unwrap();

    let dest = fx.dest("restore");
    let target = fx.download("down", &dest);
    executor.process(&target).await.unwrap();
    fx.store.clear_put_log();

    let report = executor.process(&target).await.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::UpToDate { manifest_id: uploaded.outcome.manifest_id() }
    );
    assert!(fx.root.join("state/down/sync.json").exists());
    assert!(fx.root.join("state/down/info.json").exists());
}

#[tokio::test]
async fn test_download_skips_files_already_present() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write("b.txt", b"beta");
    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let dest = fx.dest("restore");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("a.txt"), b"alpha").unwrap();

    let report = executor.process(&fx.download("down", &dest)).await.unwrap();
    assert_eq!(report.progress.files_transferred, 1);
    assert_eq!(report.progress.files_processed, 2);
}

#[tokio::test]
async fn test_verify_detects_corrupt_object() {
    let fx = Fixture::new();
    fx.write("a.txt", b"genuine");
    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let key = format!("objects/{}", fingerprint_bytes(b"genuine"));
    fx.store
        .put("data", &key, Bytes::from_static(b"tampered"))
        .await
        .unwrap();

    let mut checked = fx.download("checked", &fx.dest("checked"));
    checked.verify = true;
    let err = executor.process(&checked).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Integrity(_)));

    let unchecked = fx.download("unchecked", &fx.dest("unchecked"));
    executor.process(&unchecked).await.unwrap();
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let fx = Fixture::new();
    fx.write("a.txt", b"soon gone");
    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let key = format!("objects/{}", fingerprint_bytes(b"soon gone"));
    fx.store.delete_many("data", &[key]).await.unwrap();

    let err = executor
        .process(&fx.download("down", &fx.dest("restore")))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_touched_file_with_same_content_is_not_resent() {
    let fx = Fixture::new();
    fx.write("a.txt", b"stable");
    fx.write("b.txt", b"will change");
    let executor = fx.executor();
    let mut target = fx.upload();
    target.retention_secs = 0;

    executor.process(&target).await.unwrap();
    let first = fx.latest().await;
    fx.store.clear_put_log();

    // Rewrite a.txt with identical bytes and a newer mtime, change b.txt.
    let a = fx.source.join("a.txt");
    let file = std::fs::OpenOptions::new().write(true).open(&a).unwrap();
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
    file.set_modified(later).unwrap();
    fx.write("b.txt", b"has changed!");

    executor.process(&target).await.unwrap();

    let object_puts: Vec<String> = fx
        .store
        .put_log()
        .into_iter()
        .filter(|k| k.starts_with("objects/"))
        .collect();
    assert_eq!(object_puts, vec![format!("objects/{}", fingerprint_bytes(b"has changed!"))]);

    let second = fx.latest().await;
    assert!(second.id > first.id);
    let a_before = first.files.iter().find(|f| f.path == "a.txt").unwrap();
    let a_after = second.files.iter().find(|f| f.path == "a.txt").unwrap();
    assert_eq!(a_before.md5, a_after.md5);
    assert!(a_after.last_write_time > a_before.last_write_time);
}

#[tokio::test]
async fn test_missing_bucket_is_configuration_error() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    let executor = fx.executor();

    let mut bad_destination = fx.upload();
    bad_destination.destination = "nope/objects".to_string();
    let err = executor.process(&bad_destination).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Config(_)));

    let mut bad_status = fx.upload();
    bad_status.status = "nope/status".to_string();
    let err = executor.process(&bad_status).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Config(_)));

    let mut bad_location = fx.upload();
    bad_location.destination = String::new();
    let err = executor.process(&bad_location).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Config(_)));

    let mut bad_download = fx.download("down", &fx.dest("restore"));
    bad_download.source = "nope/objects".to_string();
    bad_download.status = "nope/status".to_string();
    let err = executor.process(&bad_download).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Config(_)));

    assert!(fx.store.put_log().is_empty());
}

#[tokio::test]
async fn test_missing_source_is_configuration_error() {
    let fx = Fixture::new();
    let mut target = fx.upload();
    target.source = fx.root.join("does-not-exist").to_string_lossy().into_owned();

    let err = fx.executor().process(&target).await.unwrap_err();
    assert!(matches!(err.root(), SyncError::Config(_)));
}

#[tokio::test]
async fn test_cancelled_upload_leaves_nothing_finalized() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let executor = Executor::with_cancel(
        fx.store.clone(),
        fx.root.join("state"),
        fx.root.join("scratch"),
        cancel,
    );

    let err = executor.process(&fx.upload()).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(fx.manifests().await.iter().all(|m| !m.finalized));
}

#[tokio::test]
async fn test_wipe_clears_directory_where_a_file_belongs() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    let executor = fx.executor();
    executor.process(&fx.upload()).await.unwrap();

    let dest = fx.dest("restore");
    std::fs::create_dir_all(dest.join("a.txt/junk")).unwrap();

    let mut target = fx.download("down", &dest);
    target.wipe = true;
    let report = executor.process(&target).await.unwrap();

    assert!(matches!(report.outcome, Outcome::Synced { .. }));
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"alpha");
}

#[tokio::test]
async fn test_non_recursive_upload_covers_top_level_only() {
    let fx = Fixture::new();
    fx.write("top.txt", b"top");
    fx.write("sub/nested.txt", b"nested");

    let mut target = fx.upload();
    target.recursive = false;
    fx.executor().process(&target).await.unwrap();

    let manifest = fx.latest().await;
    let files: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    let dirs: Vec<&str> = manifest.directories.iter().map(|d| d.path.as_str()).collect();
    assert_eq!(files, vec!["top.txt"]);
    assert_eq!(dirs, vec!["sub"]);
    assert_eq!(fx.object_keys(), vec![format!("objects/{}", fingerprint_bytes(b"top"))]);
}

#[tokio::test]
async fn test_upload_survives_out_of_range_lineage_key() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.store
        .put("data", &format!("status/sync-file-upload-{}.json", u64::MAX), Bytes::from_static(b"{"))
        .await
        .unwrap();

    let report = fx.executor().process(&fx.upload()).await.unwrap();
    assert!(matches!(report.outcome, Outcome::Synced { .. }));
    assert!(report.outcome.manifest_id() < i64::MAX as u64);
}

#[tokio::test]
async fn test_local_store_round_trip_streams_large_files() {
    let fx = Fixture::new();
    let objects = fx.root.join("objects");
    std::fs::create_dir_all(objects.join("data")).unwrap();
    let scratch = fx.root.join("scratch");
    let executor = Executor::new(Arc::new(LocalStore::new(&objects)), fx.root.join("state"), &scratch);

    // Several read buffers' worth, and compressible
    let big: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
    fx.write("big.bin", &big);
    fx.write("small.txt", b"small");

    let mut upload = fx.upload();
    upload.compress = true;
    let report = executor.process(&upload).await.unwrap();
    assert!(report.progress.transferred < big.len() as u64);

    let dest = fx.dest("restore");
    let mut download = fx.download("down", &dest);
    download.verify = true;
    executor.process(&download).await.unwrap();

    assert_eq!(std::fs::read(dest.join("big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(dest.join("small.txt")).unwrap(), b"small");
    let leftovers = std::fs::read_dir(&scratch)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

/// Content written by the n-th rewrite of a churning file.
fn revision(n: usize) -> Vec<u8> {
    format!("revision {}\n", n).repeat(200).into_bytes()
}

/// Store that rewrites one source file each time an object is checked with head, which
/// lands between the engine fingerprinting a file and reading it to upload.
struct ChurningStore {
    inner: Arc<MemoryStore>,
    file: PathBuf,
    ignored_key: String,
    rewrites_left: AtomicUsize,
    rewrites_done: AtomicUsize,
}

impl ChurningStore {
    fn new(inner: Arc<MemoryStore>, file: PathBuf, rewrites: usize) -> Self {
        Self {
            inner,
            file,
            // The bucket check heads the empty-content key
            ignored_key: format!("objects/{}", fingerprint_bytes(b"")),
            rewrites_left: AtomicUsize::new(rewrites),
            rewrites_done: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for ChurningStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<String> {
        self.inner.put(bucket, key, body).await
    }

    async fn put_stream(&self, bucket: &str, key: &str, body: ByteStream) -> Result<String> {
        self.inner.put_stream(bucket, key, body).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(bucket, key).await
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<Option<ByteStream>> {
        self.inner.get_stream(bucket, key).await
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        let rewrite = key != self.ignored_key
            && self
                .rewrites_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if rewrite {
            let n = self.rewrites_done.fetch_add(1, Ordering::SeqCst) + 1;
            std::fs::write(&self.file, revision(n))?;
        }
        self.inner.head(bucket, key).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
        self.inner.list(bucket, prefix).await
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteOutcome>> {
        self.inner.delete_many(bucket, keys).await
    }
}

#[tokio::test]
async fn test_file_changed_after_fingerprint_is_fingerprinted_again() {
    for compress in [false, true] {
        let fx = Fixture::new();
        fx.write("app.log", &revision(0));
        let store = Arc::new(ChurningStore::new(fx.store.clone(), fx.source.join("app.log"), 1));
        let executor = Executor::new(store, fx.root.join("state"), fx.root.join("scratch"));

        let mut target = fx.upload();
        target.retry = 2;
        target.compress = compress;
        let report = executor.process(&target).await.unwrap();
        assert!(matches!(report.outcome, Outcome::Synced { .. }));

        let manifest = fx.latest().await;
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].md5, fingerprint_bytes(&revision(1)));
        assert_eq!(manifest.files[0].length, revision(1).len() as u64);
        assert_eq!(fx.object_keys(), vec![format!("objects/{}", fingerprint_bytes(&revision(1)))]);
    }
}

#[tokio::test]
async fn test_file_that_keeps_changing_is_left_out() {
    let fx = Fixture::new();
    fx.write("app.log", &revision(0));
    let store = Arc::new(ChurningStore::new(fx.store.clone(), fx.source.join("app.log"), usize::MAX));
    let executor = Executor::new(store.clone(), fx.root.join("state"), fx.root.join("scratch"));

    let mut target = fx.upload();
    target.retry = 2;
    let report = executor.process(&target).await.unwrap();

    assert!(matches!(report.outcome, Outcome::Synced { .. }));
    assert_eq!(store.rewrites_done.load(Ordering::SeqCst), 3);
    assert!(fx.latest().await.files.is_empty());
    assert!(fx.object_keys().is_empty());
}
