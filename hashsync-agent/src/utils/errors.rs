//! Error types for the sync engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Unparseable location, missing bucket, missing source directory.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Post-transfer fingerprint mismatch or an unreadable stored representation.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Network/service failure. Retried by the bounded operation wrapper.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A file's bytes no longer match the fingerprint taken moments earlier.
    /// Handled by re-fingerprinting the file, never by the bounded retry.
    #[error("Content changed: {0}")]
    ContentChanged(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("{} of {} operations failed: {}", failed.len(), attempted, failed.join("; "))]
    AggregateFailure { attempted: usize, failed: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Transient and timeout failures may be retried; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(_) | SyncError::Timeout { .. } => true,
            SyncError::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The innermost error, with any context layers peeled off.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap the error with the location or key being worked on.
    pub fn context(self, context: impl Into<String>) -> Self {
        SyncError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Attach context to a fallible result, in the manner of `anyhow::Context`.
pub trait ResultExt<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}
