//! Object store collaborator.
//!
//! The engine only ever talks to a store through [`ObjectStore`]. Two
//! implementations ship with the crate: [`MemoryStore`] for tests and
//! [`LocalStore`], which lays buckets out as directories on disk.

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// An object body delivered in chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Outcome of deleting a single key in [`ObjectStore::delete_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub key: String,
    pub error: Option<String>,
}

impl DeleteOutcome {
    pub fn ok(key: impl Into<String>) -> Self {
        Self { key: key.into(), error: None }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: Some(error.into()),
        }
    }
}

/// The primitives the sync engine consumes.
///
/// A missing bucket is a configuration error; a missing object is reported
/// as `None`, never as an error. Manifests travel as whole buffers, file
/// content as streams.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` at `bucket/key`, returning the content tag.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<String>;

    /// Store a streamed body. An error item aborts the put and nothing is stored.
    async fn put_stream(&self, bucket: &str, key: &str, body: ByteStream) -> Result<String>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<Option<ByteStream>>;

    /// Stored length of the object, if present.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>>;

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>>;

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteOutcome>>;
}

/// Stream anything readable, chunk by chunk.
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::new(reader))
}

/// A single-chunk stream over an in-memory body.
pub fn bytes_stream(body: Bytes) -> ByteStream {
    Box::pin(futures_util::stream::once(async move { Ok(body) }))
}

/// Content tag for a stored body: the hex MD5, as S3 reports for single-part uploads.
pub fn content_tag(body: &[u8]) -> String {
    format!("{:x}", md5::compute(body))
}
