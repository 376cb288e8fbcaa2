//! Artifact transfer between runners and the master.
//!
//! The sending side splits files into fixed-size fragments and streams them
//! over the file-transfer service followed by an [`UploadSummary`]; the
//! receiving side reassembles fragments per file and verifies the summary.
//!
//! [`UploadSummary`]: buildfarm_protocol::UploadSummary

mod checksum;
mod fragment;
mod reassembly;
mod scanner;
mod upload;
mod validation;

pub use checksum::{checksum_bytes, file_checksum};
pub use fragment::fragment;
pub use reassembly::{FragmentOutcome, Reassembler, verify_upload};
pub use scanner::{ScannedFile, scan_directory};
pub use upload::{upload_directory, upload_file};
pub use validation::{validate_directory_name, validate_upload_path};

pub use buildfarm_protocol::constants::DEFAULT_FRAGMENT_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] buildfarm_protocol::ProtocolError),

    #[error("send failed: {0}")]
    Send(#[from] buildfarm_socket::SendError),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("out-of-order fragment for {key}: expected offset {expected}, got {got}")]
    OutOfOrder { key: String, expected: u64, got: u64 },

    #[error("length changed mid-transfer for {key}: {expected} then {got}")]
    LengthMismatch { key: String, expected: u64, got: u64 },

    #[error("transfer still pending: {0}")]
    Incomplete(String),

    #[error("size mismatch for {path}: expected {expected}, found {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("unexpected file in upload: {0}")]
    UnexpectedFile(String),
}
