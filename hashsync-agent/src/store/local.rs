//! Filesystem-backed object store.
//!
//! `root/<bucket>/<key>` holds each object. Buckets are plain directories and
//! must exist before the store is used; they are never created implicitly.

use super::{bytes_stream, reader_stream, ByteStream, DeleteOutcome, ObjectEntry, ObjectStore};
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Distinguishes concurrent partial writes of the same key.
static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.root.join(bucket);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) | Err(_) => Err(SyncError::Config(format!(
                "bucket '{}' does not exist under {}",
                bucket,
                self.root.display()
            ))),
        }
    }

    async fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let dir = self.bucket_dir(bucket).await?;
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(SyncError::Config(format!("invalid object key '{}'", key)));
        }
        Ok(dir.join(relative))
    }
}

/// Local I/O failures look like service failures to the engine.
fn transient(op: &str, key: &str, err: std::io::Error) -> SyncError {
    SyncError::Transient(format!("{} '{}': {}", op, key, err))
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<String> {
        self.put_stream(bucket, key, bytes_stream(body)).await
    }

    async fn put_stream(&self, bucket: &str, key: &str, mut body: ByteStream) -> Result<String> {
        let path = self.object_path(bucket, key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transient("put", key, e))?;
        }

        // Write next to the target and rename so readers never see a partial object.
        let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
        let partial = path.with_extension(format!("partial-{}-{}", std::process::id(), seq));
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| transient("put", key, e))?;
        let mut digest = md5::Context::new();

        let written: std::io::Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(transient("put", key, e));
        }

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| transient("put", key, e))?;

        Ok(format!("{:x}", digest.compute()))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(bucket, key).await?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transient("get", key, e)),
        }
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<Option<ByteStream>> {
        let path = self.object_path(bucket, key).await?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(reader_stream(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transient("get", key, e)),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        let path = self.object_path(bucket, key).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transient("head", key, e)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let dir = self.bucket_dir(bucket).await?;
        let prefix_owned = prefix.to_string();

        let entries = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<ObjectEntry>> {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&dir) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(&prefix_owned) || key.contains(".partial-") {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                entries.push(ObjectEntry {
                    key,
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|e| SyncError::Transient(format!("list task failed: {}", e)))?
        .map_err(|e| transient("list", prefix, e))?;

        Ok(entries)
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteOutcome>> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let path = match self.object_path(bucket, key).await {
                Ok(path) => path,
                Err(e) => {
                    outcomes.push(DeleteOutcome::failed(key, e.to_string()));
                    continue;
                }
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => outcomes.push(DeleteOutcome::ok(key)),
                Err(e) if e.kind() == ErrorKind::NotFound => outcomes.push(DeleteOutcome::ok(key)),
                Err(e) => outcomes.push(DeleteOutcome::failed(key, e.to_string())),
            }
        }
        Ok(outcomes)
    }
}
