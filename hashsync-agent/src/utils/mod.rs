//! Utility modules for the sync agent.

pub mod errors;
pub mod logger;

pub use errors::{Result, ResultExt, SyncError};
