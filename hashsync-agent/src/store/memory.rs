//! In-memory object store with fault injection, used by tests.

use super::{bytes_stream, content_tag, ByteStream, DeleteOutcome, ObjectEntry, ObjectStore};
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Successful puts left before every further put fails
    puts_before_failure: Option<usize>,
    /// Keys whose deletion always fails
    undeletable: HashSet<String>,
    /// Artificial latency applied to every get
    get_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    put_log: Vec<String>,
    faults: Faults,
}

/// Thread-safe in-memory store. Buckets must be created before use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the given buckets already created.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let store = Self::new();
        for bucket in buckets {
            store.create_bucket(bucket);
        }
        store
    }

    pub fn create_bucket(&self, bucket: &str) {
        let mut inner = self.lock();
        inner.buckets.entry(bucket.to_string()).or_default();
    }

    /// Every key written by `put`, in order, including overwrites.
    pub fn put_log(&self) -> Vec<String> {
        self.lock().put_log.clone()
    }

    pub fn clear_put_log(&self) {
        self.lock().put_log.clear();
    }

    /// Keys currently stored under `prefix`.
    pub fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        let inner = self.lock();
        inner
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Allow `n` more successful puts, then fail every put with a transient error.
    pub fn fail_puts_after(&self, n: usize) {
        self.lock().faults.puts_before_failure = Some(n);
    }

    pub fn fail_delete_of(&self, key: &str) {
        self.lock().faults.undeletable.insert(key.to_string());
    }

    pub fn delay_gets(&self, delay: Duration) {
        self.lock().faults.get_delay = Some(delay);
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn missing_bucket(bucket: &str) -> SyncError {
    SyncError::Config(format!("bucket '{}' does not exist", bucket))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<String> {
        let mut inner = self.lock();

        if let Some(remaining) = inner.faults.puts_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(SyncError::Transient(format!("injected put failure for '{}'", key)));
            }
            *remaining -= 1;
        }

        let tag = content_tag(&body);
        let objects = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| missing_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                last_modified: Utc::now(),
            },
        );
        inner.put_log.push(key.to_string());
        Ok(tag)
    }

    async fn put_stream(&self, bucket: &str, key: &str, mut body: ByteStream) -> Result<String> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SyncError::Transient(format!("reading body for '{}': {}", key, e)))?;
            buffer.extend_from_slice(&chunk);
        }
        self.put(bucket, key, buffer.freeze()).await
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<Option<ByteStream>> {
        Ok(self.get(bucket, key).await?.map(bytes_stream))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let delay = self.lock().faults.get_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.lock();
        let objects = inner.buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(objects.get(key).map(|o| o.body.clone()))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        let inner = self.lock();
        let objects = inner.buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(objects.get(key).map(|o| o.body.len() as u64))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let inner = self.lock();
        let objects = inner.buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectEntry {
                key: k.clone(),
                last_modified: o.last_modified,
            })
            .collect())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteOutcome>> {
        let mut inner = self.lock();
        let undeletable = inner.faults.undeletable.clone();
        let objects = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| missing_bucket(bucket))?;

        Ok(keys
            .iter()
            .map(|key| {
                if undeletable.contains(key) {
                    DeleteOutcome::failed(key, "access denied")
                } else {
                    objects.remove(key);
                    DeleteOutcome::ok(key)
                }
            })
            .collect())
    }
}
