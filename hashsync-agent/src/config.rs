//! Configuration management for the sync agent.
//!
//! Loads configuration from a TOML file. Every sync target is a `[[targets]]`
//! table; knobs left out fall back to the defaults below.

use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub targets: Vec<SyncTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identifier, reported in logs
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Resumption markers and progress files live here, one directory per target
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Scratch space for compressed representations
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the local object store; each bucket is a subdirectory
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sync cycles in daemon mode
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// One sync target. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTarget {
    pub id: String,

    pub direction: Direction,

    /// Local directory (upload) or `bucket/prefix` location (download)
    pub source: String,

    /// `bucket/prefix` location (upload) or local directory (download)
    pub destination: String,

    /// `bucket/prefix` location of the manifest lineage
    pub status: String,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Extra attempts after the first one for every remote operation
    #[serde(default = "default_retry")]
    pub retry: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Budget for a single remote operation attempt
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub compress: bool,

    /// zstd level used when `compress` is set
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Re-hash downloaded files and fail on mismatch
    #[serde(default)]
    pub verify: bool,

    /// Delete local files and directories the manifest does not list
    #[serde(default)]
    pub wipe: bool,

    /// Delete obsolete manifests after an upload
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Minimum number of older snapshots kept besides the current one (0 disables rotation)
    #[serde(default = "default_rotation")]
    pub rotation: usize,

    /// Age after which a finalized manifest is superseded by a new one
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Download visibility window over manifest ids (Unix milliseconds)
    #[serde(default)]
    pub min_timestamp: i64,

    #[serde(default = "default_max_timestamp")]
    pub max_timestamp: i64,

    /// Exact file or directory names skipped while scanning the source tree
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Descend below the local root when scanning (upload) or wiping (download)
    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl SyncTarget {
    /// A target with every knob at its default.
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        source: impl Into<String>,
        destination: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            source: source.into(),
            destination: destination.into(),
            status: status.into(),
            parallelism: default_parallelism(),
            retry: default_retry(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            compress: false,
            compression_level: default_compression_level(),
            verify: false,
            wipe: false,
            cleanup: default_true(),
            rotation: default_rotation(),
            retention_secs: default_retention_secs(),
            min_timestamp: 0,
            max_timestamp: default_max_timestamp(),
            exclude: Vec::new(),
            recursive: default_true(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Worker count, never zero.
    pub fn workers(&self) -> usize {
        self.parallelism.max(1)
    }

    pub fn status_location(&self) -> Result<Location> {
        Location::parse(&self.status)
    }

    /// The remote side of the target, whichever field holds it.
    pub fn remote_location(&self) -> Result<Location> {
        match self.direction {
            Direction::Upload => Location::parse(&self.destination),
            Direction::Download => Location::parse(&self.source),
        }
    }

    /// The local side of the target, whichever field holds it.
    pub fn local_root(&self) -> &Path {
        match self.direction {
            Direction::Upload => Path::new(&self.source),
            Direction::Download => Path::new(&self.destination),
        }
    }
}

/// A `bucket/key-prefix` pair, split on the first `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub bucket: String,
    pub prefix: String,
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().trim_start_matches('/');
        let (bucket, prefix) = match raw.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (raw, ""),
        };

        if bucket.is_empty() {
            return Err(SyncError::Config(format!(
                "location '{}' does not contain a bucket name",
                raw
            )));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Join a relative key onto this location's prefix.
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.prefix)
        }
    }
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "hashsync-agent-01".to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/hashsync-agent")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("hashsync-agent")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_parallelism() -> usize {
    4
}

fn default_retry() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_compression_level() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_rotation() -> usize {
    5
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_timestamp() -> i64 {
    i64::MAX
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            state_dir: default_state_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate target ids and malformed locations up front.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.id.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }
            target.status_location()?;
            target.remote_location()?;
        }
        Ok(())
    }
}
