//! Wire protocol for buildfarm master/runner communication.
//!
//! Three layers share one TCP connection:
//!
//! - [`frame`]: length-prefixed frames scoped to a named service
//! - [`fragment`]: binary payload carrying one slice of an artifact file
//! - [`messages`]: JSON payloads for jobs, status reports and build requests

pub mod constants;
pub mod fragment;
pub mod frame;
pub mod messages;

pub use fragment::FileFragment;
pub use frame::{Frame, FrameDecoder, FrameKind, FrameReader, decode_frame, encode_frame, write_frame};
pub use messages::{
    BuildJob, BuildRequest, BuildRequestResponse, BuildStatus, BuildStatusMessage, OsFamily,
    RunnerInfo, UploadSummary, UploadedFile, VersionBump,
};

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("service name too long: {len} bytes (max {max})")]
    ServiceNameTooLong { len: usize, max: usize },

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("connection closed mid-frame")]
    UnexpectedEof,
}
