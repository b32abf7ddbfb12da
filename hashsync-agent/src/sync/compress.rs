//! Stored representations of file content.
//!
//! Uploads may store a zstd-encoded copy of a file when that saves more than
//! [`COMPRESSION_OVERHEAD`] bytes. The choice is recorded on the file record as
//! the property `compress=zstd`.

use super::fingerprint::DigestReader;
use crate::store::ByteStream;
use crate::utils::errors::{Result, SyncError};
use async_compression::tokio::bufread::ZstdDecoder;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

/// Property key on a file record describing the stored representation.
pub const COMPRESS_PROPERTY: &str = "compress";

/// A compressed copy must beat the raw size by more than this to be kept.
pub const COMPRESSION_OVERHEAD: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Zstd,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Zstd => "zstd",
        }
    }

    /// Read the encoding off a record's properties.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        match properties.get(COMPRESS_PROPERTY).map(String::as_str) {
            None => Ok(Encoding::Raw),
            Some("zstd") => Ok(Encoding::Zstd),
            Some(other) => Err(SyncError::Integrity(format!(
                "unsupported stored encoding '{}'",
                other
            ))),
        }
    }

    /// Record this encoding on a record's properties.
    pub fn apply(&self, properties: &mut BTreeMap<String, String>) {
        match self {
            Encoding::Raw => {
                properties.remove(COMPRESS_PROPERTY);
            }
            Encoding::Zstd => {
                properties.insert(COMPRESS_PROPERTY.to_string(), self.as_str().to_string());
            }
        }
    }

    /// Guess the encoding of an already stored object from its length alone.
    ///
    /// Raw objects are exactly as long as the file; a zstd copy is only ever
    /// kept when it is more than the overhead smaller.
    pub fn infer(raw_len: u64, stored_len: u64) -> Self {
        if stored_len + COMPRESSION_OVERHEAD < raw_len {
            Encoding::Zstd
        } else {
            Encoding::Raw
        }
    }
}

pub fn worth_keeping(raw_len: u64, compressed_len: u64) -> bool {
    compressed_len + COMPRESSION_OVERHEAD < raw_len
}

/// Scratch path for the compressed copy of `fingerprint`. Unique per content.
pub fn scratch_path(scratch_dir: &Path, fingerprint: &str) -> PathBuf {
    scratch_dir.join(format!("{}.zst", fingerprint))
}

/// A zstd copy of a file in scratch space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed {
    /// Fingerprint of the raw bytes that went into the encoder
    pub fingerprint: String,
    pub raw_len: u64,
    pub packed_len: u64,
}

/// zstd-encode `source` into `dest`, fingerprinting the raw bytes on the way.
///
/// Failures reading `source` are transient, like any other read of a file
/// that may be changing underneath us.
pub fn compress_file(source: &Path, dest: &Path, level: i32) -> Result<Packed> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let input = File::open(source)
        .map_err(|e| SyncError::Transient(format!("reading {}: {}", source.display(), e)))?;
    let mut reader = DigestReader::new(BufReader::new(input));
    let mut writer = BufWriter::new(File::create(dest)?);
    zstd::stream::copy_encode(&mut reader, &mut writer, level)
        .map_err(|e| SyncError::Transient(format!("compressing {}: {}", source.display(), e)))?;
    writer.flush()?;
    drop(writer);

    let (fingerprint, raw_len) = reader.finish();
    Ok(Packed {
        fingerprint,
        raw_len,
        packed_len: std::fs::metadata(dest)?.len(),
    })
}

/// Bytes moved by [`write_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    /// Bytes written to disk
    pub raw: u64,
    /// Bytes read from the store
    pub stored: u64,
}

/// Stream a stored object to `dest`, decoding it on the way when needed.
///
/// A body that fails mid-stream is transient; a body that does not decode
/// is an integrity error.
pub async fn write_object(body: ByteStream, encoding: Encoding, dest: &Path) -> Result<Written> {
    let stored = Arc::new(AtomicU64::new(0));
    let body_failed = Arc::new(AtomicBool::new(false));

    let counted = {
        let stored = Arc::clone(&stored);
        let body_failed = Arc::clone(&body_failed);
        body.inspect(move |chunk| match chunk {
            Ok(bytes) => {
                stored.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            Err(_) => body_failed.store(true, Ordering::Relaxed),
        })
    };
    let mut reader = StreamReader::new(counted);
    let mut file = tokio::fs::File::create(dest).await?;

    let copied = match encoding {
        Encoding::Raw => tokio::io::copy(&mut reader, &mut file).await,
        Encoding::Zstd => tokio::io::copy(&mut ZstdDecoder::new(reader), &mut file).await,
    };

    let raw = match copied {
        Ok(n) => n,
        Err(e) if body_failed.load(Ordering::Relaxed) => {
            return Err(SyncError::Transient(format!("reading object for {}: {}", dest.display(), e)));
        }
        Err(e) if encoding == Encoding::Zstd => {
            return Err(SyncError::Integrity(format!("decoding {}: {}", dest.display(), e)));
        }
        Err(e) => return Err(e.into()),
    };

    file.flush().await?;
    file.sync_all().await?;
    Ok(Written {
        raw,
        stored: stored.load(Ordering::Relaxed),
    })
}
