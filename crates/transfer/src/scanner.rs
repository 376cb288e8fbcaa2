//! Directory scanning for upload.
//!
//! Recursively walks a build output directory and produces file entries
//! with relative paths normalized to forward slashes.
//!
//! Only regular files are transferred. Symbolic links are not followed and
//! are skipped with a warning, as are sockets, FIFOs and device nodes.
//! Empty directories carry no file entry and so do not reach the receiver.

use std::path::{Path, PathBuf};

use crate::TransferError;

/// A file found under an upload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

/// Scans `root` recursively, sorted by relative path.
pub fn scan_directory(root: &Path) -> Result<Vec<ScannedFile>, TransferError> {
    let mut files = Vec::new();
    walk_dir(root, root, &mut files)?;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn walk_dir(root: &Path, current: &Path, files: &mut Vec<ScannedFile>) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, files)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let relative_path = rel_path.to_string_lossy().replace('\\', "/");

            files.push(ScannedFile {
                relative_path,
                absolute_path: path,
                size: metadata.len(),
            });
        } else if metadata.file_type().is_symlink() {
            tracing::warn!(path = %path.display(), "symlink skipped");
        } else {
            tracing::warn!(path = %path.display(), "special file skipped");
        }
    }
    Ok(())
}
