//! Deletion of obsolete manifest snapshots.

use crate::store::ObjectStore;
use crate::transfer::retry::RetryPolicy;
use crate::utils::errors::SyncError;
use std::sync::Arc;
use tracing::{info, warn};

/// Keys per `delete_many` call, the S3 DeleteObjects limit.
const DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// `key: reason` for every key that could not be deleted
    pub failed: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RetentionCleaner {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    policy: RetryPolicy,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            policy,
        }
    }

    /// Delete `keys`. Failures are logged and reported, never returned.
    pub async fn run(&self, keys: &[String]) -> CleanupReport {
        let mut report = CleanupReport::default();
        if keys.is_empty() {
            return report;
        }

        for batch in keys.chunks(DELETE_BATCH) {
            let what = format!("delete {} keys from {}", batch.len(), self.bucket);
            match self
                .policy
                .run(&what, || self.store.delete_many(&self.bucket, batch))
                .await
            {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome.error {
                            None => report.removed.push(outcome.key),
                            Some(reason) => report.failed.push(format!("{}: {}", outcome.key, reason)),
                        }
                    }
                }
                Err(e) => {
                    report
                        .failed
                        .extend(batch.iter().map(|key| format!("{}: {}", key, e)));
                }
            }
        }

        if report.is_clean() {
            info!("Removed {} obsolete manifests from {}", report.removed.len(), self.bucket);
        } else {
            let err = SyncError::AggregateFailure {
                attempted: keys.len(),
                failed: report.failed.clone(),
            };
            warn!("Cleanup of {} incomplete: {}", self.bucket, err);
        }

        report
    }
}
