//! Shared path-safety helper used by both the watcher and the scanner.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Resolve `path` (following symlinks) and ensure it lies beneath `root`
/// (also resolved). Used by `Watcher::add_root` and `Scanner::scan_file` to
/// enforce the same escape boundary.
pub fn resolve_under_root(path: &Path, root: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(path).map_err(|_| Error::InvalidPath(path.to_path_buf()))?;
    let root = std::fs::canonicalize(root).map_err(|_| Error::InvalidPath(root.to_path_buf()))?;
    if !resolved.starts_with(&root) {
        return Err(Error::PathEscape(resolved));
    }
    Ok(resolved)
}
