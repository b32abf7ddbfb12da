//! Manifest ("status file") schema.
//!
//! A manifest is one snapshot of a sync lineage: every file and directory
//! known to be stored, keyed by relative path. It is serialized as JSON at
//! `<status prefix>/sync-file-upload-<id>.json`.
//!
//! Schema policy: `schema` is bumped whenever a field changes meaning.
//! Documents without it are read as schema 1 with missing or `null`
//! collections defaulted. Documents from a newer schema are rejected and
//! treated as unreadable by the lineage.

use crate::config::Location;
use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const MANIFEST_SCHEMA: u32 = 1;

/// Key prefix of every manifest in a lineage, below the status location.
pub const STATUS_FILE_PREFIX: &str = "sync-file-upload-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "legacy_schema")]
    pub schema: u32,

    /// Creation time in Unix milliseconds; also the key suffix
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: u64,

    pub bucket: String,
    pub key: String,

    /// Unix seconds of the last write
    #[serde(default)]
    pub timestamp: i64,

    /// Incremented once per run that writes the manifest
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub finalized: bool,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<FileRecord>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub directories: Vec<DirectoryRecord>,

    /// Keys of snapshots superseded when this one was written
    #[serde(default, deserialize_with = "null_as_empty")]
    pub obsoletes: Vec<String>,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub destination: Option<String>,
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path, `/`-separated
    pub path: String,

    pub length: u64,

    /// Hex content fingerprint; also the stored object's key suffix
    pub md5: String,

    /// Unix milliseconds
    pub last_write_time: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, length: u64, md5: impl Into<String>, last_write_time: i64) -> Self {
        Self {
            path: path.into(),
            length,
            md5: md5.into(),
            last_write_time,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub path: String,
}

impl Manifest {
    /// A fresh, non-finalized manifest for the lineage at `location`.
    pub fn new(location: &Location, id: u64, timestamp: i64) -> Self {
        Self {
            schema: MANIFEST_SCHEMA,
            id,
            bucket: location.bucket.clone(),
            key: snapshot_key(location, id),
            timestamp,
            version: 0,
            finalized: false,
            files: Vec::new(),
            directories: Vec::new(),
            obsoletes: Vec::new(),
            source: None,
            destination: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        if manifest.schema > MANIFEST_SCHEMA {
            return Err(SyncError::Integrity(format!(
                "manifest {} uses schema {}, newest understood is {}",
                manifest.key, manifest.schema, MANIFEST_SCHEMA
            )));
        }
        Ok(manifest)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Full `bucket/key` location of this manifest, for logs.
    pub fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Whether a finalized manifest is old enough to be superseded.
    ///
    /// A retention of zero supersedes any finalized manifest.
    pub fn is_expired(&self, retention_secs: u64, now_millis: i64) -> bool {
        // Ids may run ahead of the clock when runs land in the same millisecond.
        if retention_secs == 0 {
            return true;
        }
        let age_ms = now_millis.saturating_sub(self.id as i64);
        age_ms >= (retention_secs as i64).saturating_mul(1000)
    }

    /// Seconds since the manifest was created.
    pub fn age_secs(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.id as i64) / 1000
    }

    pub fn file_index(&self) -> HashMap<&str, &FileRecord> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }

    /// True when both record sets match this manifest exactly, ignoring order.
    pub fn same_content(&self, files: &[FileRecord], directories: &[DirectoryRecord]) -> bool {
        fn sorted_files(records: &[FileRecord]) -> Vec<&FileRecord> {
            let mut v: Vec<&FileRecord> = records.iter().collect();
            v.sort_by(|a, b| a.path.cmp(&b.path));
            v
        }
        fn sorted_dirs(records: &[DirectoryRecord]) -> Vec<&DirectoryRecord> {
            let mut v: Vec<&DirectoryRecord> = records.iter().collect();
            v.sort();
            v
        }

        sorted_files(&self.files) == sorted_files(files)
            && sorted_dirs(&self.directories) == sorted_dirs(directories)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

/// Key of the snapshot with `id` in the lineage at `location`.
pub fn snapshot_key(location: &Location, id: u64) -> String {
    location.key(&format!("{}{}.json", STATUS_FILE_PREFIX, id))
}

/// Id embedded in a snapshot key; 0 when the suffix does not parse.
pub fn snapshot_id(lineage_prefix: &str, key: &str) -> u64 {
    key.strip_prefix(lineage_prefix)
        .and_then(|rest| rest.strip_suffix(".json"))
        .and_then(|id| id.parse::<u64>().ok())
        .filter(|id| i64::try_from(*id).is_ok())
        .unwrap_or(0)
}

fn legacy_schema() -> u32 {
    1
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Older manifests stored the id as a string.
fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => Ok(n),
        RawId::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
