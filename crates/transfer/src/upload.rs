//! Sending side: stream a directory as fragments, then its summary.

use std::path::Path;

use buildfarm_protocol::{FileFragment, UploadSummary, UploadedFile};
use buildfarm_socket::ServiceSender;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::scanner::{ScannedFile, scan_directory};
use crate::{DEFAULT_FRAGMENT_SIZE, TransferError};

/// Uploads every file under `root` as `directory_name`, then sends the
/// [`UploadSummary`] as JSON on the same service.
///
/// Files are sent one after another; fragments of different files never
/// interleave. The returned summary is what the peer received.
pub async fn upload_directory(
    sender: &ServiceSender,
    directory_name: &str,
    root: &Path,
    fragment_size: usize,
    job_id: Option<String>,
) -> Result<UploadSummary, TransferError> {
    crate::validate_directory_name(directory_name)?;

    let scan_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || scan_directory(&scan_root))
        .await
        .map_err(std::io::Error::other)??;

    tracing::info!(
        directory = directory_name,
        files = files.len(),
        bytes = files.iter().map(|f| f.size).sum::<u64>(),
        "starting upload"
    );

    let mut uploaded = Vec::with_capacity(files.len());
    for file in &files {
        uploaded.push(upload_file(sender, directory_name, file, fragment_size).await?);
    }

    let summary = UploadSummary {
        job_id,
        directory_name: directory_name.to_string(),
        files: uploaded,
    };
    sender.send_json(&summary).await?;

    tracing::info!(
        directory = directory_name,
        bytes = summary.total_bytes(),
        "upload complete"
    );
    Ok(summary)
}

/// Streams one file as fragments of at most `fragment_size` bytes.
///
/// An empty file is sent as a single zero-length fragment so the receiver
/// still creates it.
pub async fn upload_file(
    sender: &ServiceSender,
    directory_name: &str,
    file: &ScannedFile,
    fragment_size: usize,
) -> Result<UploadedFile, TransferError> {
    let fragment_size = if fragment_size == 0 {
        DEFAULT_FRAGMENT_SIZE
    } else {
        fragment_size
    };

    let mut handle = tokio::fs::File::open(&file.absolute_path).await?;
    let total_length = handle.metadata().await?.len();
    let mut hasher = Sha256::new();
    let mut offset = 0u64;

    loop {
        let want = fragment_size.min((total_length - offset) as usize);
        let mut data = vec![0u8; want];
        handle.read_exact(&mut data).await?;
        hasher.update(&data);

        let frag = FileFragment {
            directory: directory_name.to_string(),
            relative_path: file.relative_path.clone(),
            total_length,
            offset,
            data,
        };
        offset += want as u64;
        sender.send_binary(frag.encode()?).await?;

        if offset >= total_length {
            break;
        }
    }

    tracing::debug!(path = %file.relative_path, bytes = total_length, "file sent");
    Ok(UploadedFile {
        path: file.relative_path.clone(),
        size: total_length,
        sha256: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_protocol::{Frame, FrameKind};
    use buildfarm_socket::FrameSender;
    use tempfile::TempDir;

    use crate::{FragmentOutcome, Reassembler};

    fn build_output() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("Game.exe"), vec![0x4d; 2500]).unwrap();
        std::fs::write(root.join("empty.cfg"), b"").unwrap();
        std::fs::create_dir_all(root.join("Game_Data")).unwrap();
        std::fs::write(root.join("Game_Data/level0"), b"level zero").unwrap();
        dir
    }

    async fn drain(rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn upload_streams_fragments_then_summary() {
        let src = build_output();
        let (frames, mut rx) = FrameSender::detached(1, 1024);
        let sender = frames.service("file-transfer");

        let summary = upload_directory(&sender, "P/Windows64", src.path(), 1000, Some("j1".into()))
            .await
            .unwrap();
        assert_eq!(summary.files.len(), 3);
        assert_eq!(summary.total_bytes(), 2510);
        assert_eq!(summary.job_id.as_deref(), Some("j1"));

        let sent = drain(&mut rx).await;
        // Game.exe: 3 fragments, Game_Data/level0: 1, empty.cfg: 1, summary: 1.
        assert_eq!(sent.len(), 6);
        assert!(sent[..5].iter().all(|f| f.kind == FrameKind::Binary));
        let last = sent.last().unwrap();
        assert_eq!(last.kind, FrameKind::Json);
        assert_eq!(last.parse_json::<UploadSummary>().unwrap(), summary);
    }

    #[tokio::test]
    async fn uploaded_tree_reassembles_byte_for_byte() {
        let src = build_output();
        let dst = TempDir::new().unwrap();
        let (frames, mut rx) = FrameSender::detached(1, 1024);
        let sender = frames.service("file-transfer");

        let summary = upload_directory(&sender, "P/OSX", src.path(), 7, None)
            .await
            .unwrap();

        let mut reassembler = Reassembler::new(dst.path());
        let mut completed = 0;
        for frame in drain(&mut rx).await {
            if frame.kind != FrameKind::Binary {
                continue;
            }
            let fragment = FileFragment::decode(&frame.payload).unwrap();
            if let FragmentOutcome::Completed { .. } = reassembler.apply(fragment).await.unwrap() {
                completed += 1;
            }
        }
        assert_eq!(completed, 3);

        let root = reassembler.verify(&summary).await.unwrap();
        for file in &summary.files {
            assert_eq!(
                std::fs::read(root.join(&file.path)).unwrap(),
                std::fs::read(src.path().join(&file.path)).unwrap(),
            );
        }
    }

    #[tokio::test]
    async fn upload_fails_when_peer_is_gone() {
        let src = build_output();
        let (frames, rx) = FrameSender::detached(1, 8);
        drop(rx);
        let sender = frames.service("file-transfer");

        let err = upload_directory(&sender, "P/Linux64", src.path(), 1000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Send(_)));
    }

    #[tokio::test]
    async fn upload_rejects_unsafe_directory_name() {
        let src = build_output();
        let (frames, _rx) = FrameSender::detached(1, 8);
        let sender = frames.service("file-transfer");

        let err = upload_directory(&sender, "../P", src.path(), 1000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
    }
}
