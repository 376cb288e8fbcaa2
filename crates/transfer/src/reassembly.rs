//! Receiving side: rebuild files from fragments.
//!
//! One [`Reassembler`] owns every in-flight file under a receive root. Each
//! file is tracked by its key (`directory/relative_path`) together with the
//! next byte offset it expects, so fragments of different files may
//! interleave freely while fragments of one file must arrive in order.
//!
//! The first fragment of an upload clears its directory, so a finished
//! upload holds exactly the files its summary lists.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use buildfarm_protocol::{FileFragment, UploadSummary};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::{TransferError, file_checksum, scan_directory, validate_directory_name, validate_upload_path};

/// A file that has started but not finished arriving.
struct TransferPacket {
    file: tokio::fs::File,
    path: PathBuf,
    total_length: u64,
    next_offset: u64,
    last_activity: Instant,
}

/// Files of one upload directory that already arrived in full.
#[derive(Default)]
struct UploadSession {
    completed: HashSet<String>,
}

/// What applying one fragment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Bytes were appended; more are expected.
    Written { key: String, next_offset: u64 },
    /// The fragment repeated bytes already written and was skipped.
    Duplicate { key: String },
    /// The file is complete and closed.
    Completed { key: String, path: PathBuf, size: u64 },
}

/// Pending-transfer map plus the directory files are written into.
pub struct Reassembler {
    root: PathBuf,
    pending: HashMap<String, TransferPacket>,
    uploads: HashMap<String, UploadSession>,
}

impl Reassembler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: HashMap::new(),
            uploads: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files currently in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if `key` has an unfinished transfer.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Applies one fragment.
    ///
    /// A fragment starting below the expected offset is a duplicate: bytes
    /// already written are skipped, any new tail is appended. Fragments of a
    /// file that already completed in this upload are duplicates too. A
    /// fragment starting above the expected offset is a gap: the file is
    /// aborted and its partial data removed.
    pub async fn apply(&mut self, fragment: FileFragment) -> Result<FragmentOutcome, TransferError> {
        validate_directory_name(&fragment.directory)?;
        validate_upload_path(&fragment.relative_path)?;
        let key = fragment.key();

        if !self.uploads.contains_key(&fragment.directory) {
            self.start_upload(&fragment.directory).await?;
        }

        if !self.pending.contains_key(&key) {
            let completed = self
                .uploads
                .get(&fragment.directory)
                .is_some_and(|u| u.completed.contains(&fragment.relative_path));
            if completed {
                tracing::debug!(%key, offset = fragment.offset, "fragment of completed file skipped");
                return Ok(FragmentOutcome::Duplicate { key });
            }
            if fragment.offset != 0 {
                return Err(TransferError::OutOfOrder {
                    key,
                    expected: 0,
                    got: fragment.offset,
                });
            }
            let path = self.root.join(&fragment.directory).join(&fragment.relative_path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(&path).await?;
            tracing::debug!(%key, total = fragment.total_length, "transfer started");
            self.pending.insert(
                key.clone(),
                TransferPacket {
                    file,
                    path,
                    total_length: fragment.total_length,
                    next_offset: 0,
                    last_activity: Instant::now(),
                },
            );
        }

        let Some(packet) = self.pending.get_mut(&key) else {
            return Err(TransferError::Incomplete(key));
        };

        if packet.total_length != fragment.total_length {
            let expected = packet.total_length;
            self.abort(&key).await;
            return Err(TransferError::LengthMismatch {
                key,
                expected,
                got: fragment.total_length,
            });
        }

        if fragment.offset > packet.next_offset {
            let expected = packet.next_offset;
            self.abort(&key).await;
            return Err(TransferError::OutOfOrder {
                key,
                expected,
                got: fragment.offset,
            });
        }

        let end = fragment.offset + fragment.data.len() as u64;
        let is_empty_file = packet.total_length == 0;
        if end <= packet.next_offset && !is_empty_file {
            packet.last_activity = Instant::now();
            tracing::debug!(%key, offset = fragment.offset, "duplicate fragment skipped");
            return Ok(FragmentOutcome::Duplicate { key });
        }

        let skip = (packet.next_offset - fragment.offset) as usize;
        packet.file.write_all(&fragment.data[skip..]).await?;
        packet.next_offset = end;
        packet.last_activity = Instant::now();

        if packet.next_offset < packet.total_length {
            return Ok(FragmentOutcome::Written {
                key,
                next_offset: packet.next_offset,
            });
        }

        let Some(mut packet) = self.pending.remove(&key) else {
            return Err(TransferError::Incomplete(key));
        };
        packet.file.flush().await?;
        if let Some(upload) = self.uploads.get_mut(&fragment.directory) {
            upload.completed.insert(fragment.relative_path);
        }
        let size = packet.total_length;
        tracing::debug!(%key, bytes = size, "transfer completed");
        Ok(FragmentOutcome::Completed {
            key,
            path: packet.path,
            size,
        })
    }

    /// Opens an upload session for `directory`, removing what an earlier
    /// upload left there.
    async fn start_upload(&mut self, directory: &str) -> Result<(), TransferError> {
        clear_directory(&self.root.join(directory)).await?;
        tracing::debug!(%directory, "upload started");
        self.uploads.insert(directory.to_string(), UploadSession::default());
        Ok(())
    }

    /// Drops an in-flight file and deletes its partial data.
    pub async fn abort(&mut self, key: &str) -> bool {
        let Some(packet) = self.pending.remove(key) else {
            return false;
        };
        drop(packet.file);
        if let Err(e) = tokio::fs::remove_file(&packet.path).await {
            tracing::warn!(%key, "failed to remove partial file: {e}");
        }
        tracing::info!(%key, received = packet.next_offset, total = packet.total_length, "transfer aborted");
        true
    }

    /// Aborts every in-flight file under `directory` and ends its upload.
    pub async fn abort_directory(&mut self, directory: &str) -> usize {
        self.uploads.remove(directory);
        let prefix = format!("{directory}/");
        let keys: Vec<String> = self
            .pending
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.abort(key).await;
        }
        keys.len()
    }

    /// Evicts files that saw no fragment for longer than `max_idle`.
    ///
    /// Returns the evicted keys.
    pub async fn evict_stale(&mut self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_activity) > max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            tracing::warn!(%key, "evicting stale transfer");
            self.abort(key).await;
        }
        stale
    }

    /// Ends the upload `summary` describes and returns its local directory.
    ///
    /// Fails while any of its files is still arriving. The next fragment for
    /// the directory starts a fresh upload. Contents are checked separately
    /// with [`verify_upload`], which needs no access to the reassembler.
    pub async fn finish_upload(&mut self, summary: &UploadSummary) -> Result<PathBuf, TransferError> {
        validate_directory_name(&summary.directory_name)?;
        let dir = self.root.join(&summary.directory_name);

        for entry in &summary.files {
            validate_upload_path(&entry.path)?;
            let key = format!("{}/{}", summary.directory_name, entry.path);
            if self.pending.contains_key(&key) {
                return Err(TransferError::Incomplete(key));
            }
        }

        let session = self.uploads.remove(&summary.directory_name);
        if session.is_none() && summary.files.is_empty() {
            // Nothing was sent, so nothing of an earlier upload may remain.
            clear_directory(&dir).await?;
        }
        if summary.files.is_empty() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(dir)
    }

    /// [`finish_upload`](Self::finish_upload) followed by [`verify_upload`].
    pub async fn verify(&mut self, summary: &UploadSummary) -> Result<PathBuf, TransferError> {
        let dir = self.finish_upload(summary).await?;
        verify_upload(&dir, summary).await?;
        Ok(dir)
    }
}

/// Checks that `dir` holds exactly the files in `summary`, with matching
/// sizes and SHA-256 digests.
pub async fn verify_upload(dir: &Path, summary: &UploadSummary) -> Result<(), TransferError> {
    let mut listed = HashSet::with_capacity(summary.files.len());
    for entry in &summary.files {
        validate_upload_path(&entry.path)?;
        let path = dir.join(&entry.path);
        let actual = tokio::fs::metadata(&path).await?.len();
        if actual != entry.size {
            return Err(TransferError::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual,
            });
        }
        if !file_checksum(&path).await?.eq_ignore_ascii_case(&entry.sha256) {
            return Err(TransferError::ChecksumMismatch(entry.path.clone()));
        }
        listed.insert(entry.path.as_str());
    }

    let root = dir.to_path_buf();
    let on_disk = tokio::task::spawn_blocking(move || scan_directory(&root))
        .await
        .map_err(std::io::Error::other)??;
    if let Some(extra) = on_disk.iter().find(|f| !listed.contains(f.relative_path.as_str())) {
        return Err(TransferError::UnexpectedFile(extra.relative_path.clone()));
    }
    Ok(())
}

async fn clear_directory(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
