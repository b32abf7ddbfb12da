//! File metadata helpers shared by the walker and the engines.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Last write time of a file in Unix milliseconds, 0 when unavailable.
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Relative path of `path` under `root`, `/`-separated regardless of platform.
pub fn relative_key(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a manifest-relative key under a local root.
///
/// Returns None for keys that would escape the root (absolute paths, `..`).
pub fn resolve_relative(root: &Path, key: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut depth = 0usize;
    for part in key.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => {
                if Path::new(part).is_absolute() || part.contains('\\') {
                    return None;
                }
                path.push(part);
                depth += 1;
            }
        }
    }
    if depth == 0 {
        return None;
    }
    Some(path)
}

/// Every ancestor directory key of a relative file key, nearest first.
pub fn parent_keys(key: &str) -> impl Iterator<Item = &str> {
    key.char_indices()
        .rev()
        .filter(|(_, c)| *c == '/')
        .map(move |(i, _)| &key[..i])
}
