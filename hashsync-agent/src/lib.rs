//! Hashsync Agent Library
//!
//! Content-addressed, resumable directory sync against an object store.
//! Uploads deduplicate by content fingerprint and publish a manifest per
//! snapshot; downloads rebuild a local tree from the newest finalized one.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{Executor, Outcome, SyncReport};
pub use utils::errors::{Result, SyncError};
