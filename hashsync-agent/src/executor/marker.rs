//! Local per-target state: the download resumption marker and the progress file.

use crate::fs::state::{read_json, write_json};
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What the last download of a target applied locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionMarker {
    /// Id of the manifest being (or last) applied
    pub id: u64,
    pub version: u64,
    pub finalized: bool,
    /// Unix seconds
    pub timestamp: i64,
}

impl ResumptionMarker {
    /// True when the manifest with `id` was already fully applied.
    pub fn is_complete_for(&self, id: u64) -> bool {
        self.finalized && self.id == id
    }
}

/// `<state_dir>/<target id>/`
#[derive(Debug, Clone)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: &Path, target_id: &str) -> Self {
        Self {
            dir: state_dir.join(target_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join("sync.json")
    }

    pub fn info_path(&self) -> PathBuf {
        self.dir.join("info.json")
    }

    /// Read the marker. A missing or corrupt marker means nothing was applied.
    pub async fn read_marker(&self) -> ResumptionMarker {
        let path = self.marker_path();
        match read_json(&path).await {
            Ok(Some(marker)) => marker,
            Ok(None) => ResumptionMarker::default(),
            Err(e) => {
                warn!("Ignoring unreadable marker {}: {}", path.display(), e);
                ResumptionMarker::default()
            }
        }
    }

    pub async fn write_marker(&self, marker: &ResumptionMarker) -> Result<()> {
        write_json(&self.marker_path(), marker).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_marker_round_trip() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = StatePaths::new(temp_dir.path(), "photos");
        assert_eq!(paths.read_marker().await, ResumptionMarker::default());

        let marker = ResumptionMarker {
            id: 42,
            version: 3,
            finalized: true,
            timestamp: 1700000000,
        };
        paths.write_marker(&marker).await.unwrap();

        assert_eq!(paths.read_marker().await, marker);
        assert!(paths.marker_path().ends_with("photos/sync.json"));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_marker_reads_as_default() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = StatePaths::new(temp_dir.path(), "t");
        std::fs::create_dir_all(paths.dir())?;
        std::fs::write(paths.marker_path(), b"{ not json")?;

        assert_eq!(paths.read_marker().await, ResumptionMarker::default());
        Ok(())
    }

    #[test]
    fn test_complete_requires_finalized_and_same_id() {
        let marker = ResumptionMarker {
            id: 7,
            version: 1,
            finalized: false,
            timestamp: 0,
        };
        assert!(!marker.is_complete_for(7));

        let marker = ResumptionMarker { finalized: true, ..marker };
        assert!(marker.is_complete_for(7));
        assert!(!marker.is_complete_for(8));
    }
}
