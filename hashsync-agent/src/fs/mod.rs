//! Local file system access: tree walking, metadata and state files.

pub mod metadata;
pub mod state;
pub mod walker;
