//! Directory traversal for sync operations.
//!
//! A walk yields every regular file (with size and last-write time) and every
//! directory below the root, both keyed by their `/`-separated relative path.

use super::metadata::{modified_millis, relative_key};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited, 1 = direct children of the root only)
    pub max_depth: Option<usize>,

    /// Exact entry names to skip, along with everything below them
    pub exclude_patterns: Vec<String>,
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Last write time in Unix milliseconds
    pub modified: i64,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let metadata = if raw_metadata.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                // Broken symlink
                Err(_) => return Ok(None),
            }
        } else {
            raw_metadata
        };

        Ok(Some(Self {
            relative_path: relative_key(&path, root),
            size: metadata.len(),
            modified: modified_millis(&metadata),
            path,
        }))
    }
}

/// Everything found below a source root.
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    pub files: Vec<FileInfo>,

    /// Relative paths of all directories, excluding the root itself
    pub directories: Vec<String>,
}

impl SourceTree {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk a directory tree and collect its files and directories.
///
/// # Example
/// ```no_run
/// use hashsync_agent::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let tree = walk_directory(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} files in {} directories", tree.files.len(), tree.directories.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<SourceTree> {
    let mut tree = SourceTree::default();

    let mut walker = WalkDir::new(root).sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let walker = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, &options.exclude_patterns));

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_dir() {
            if entry.depth() > 0 {
                tree.directories.push(relative_key(entry.path(), root));
            }
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            tree.files.push(file_info);
        }
    }

    Ok(tree)
}

/// Walk options for a target's `recursive` setting.
pub fn depth_for(recursive: bool) -> Option<usize> {
    if recursive {
        None
    } else {
        Some(1)
    }
}

/// Relative paths of every file and every directory below `root`, for wiping.
///
/// Only the direct children of `root` are listed when `recursive` is false.
pub fn list_local_entries(root: &Path, recursive: bool) -> std::io::Result<(Vec<String>, Vec<String>)> {
    let mut files = Vec::new();
    let mut directories = Vec::new();

    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    if let Some(max_depth) = depth_for(recursive) {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;
        let key = relative_key(entry.path(), root);
        if entry.file_type().is_dir() {
            directories.push(key);
        } else {
            files.push(key);
        }
    }

    Ok((files, directories))
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name == pattern.as_str())
}
