use std::time::Duration;

/// Service carrying build requests from clients to the master.
pub const SERVICE_BUILD: &str = "build";

/// Service carrying jobs to runners and status reports back.
pub const SERVICE_BUILD_RUNNER: &str = "build-runner";

/// Service a runner uses to identify itself after the handshake.
pub const SERVICE_RUNNER_INFO: &str = "runner-info";

/// Service carrying artifact fragments and upload summaries.
pub const SERVICE_FILE_TRANSFER: &str = "file-transfer";

/// Longest accepted service name in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 256;

/// Largest accepted frame payload (64 MiB).
///
/// Checked against the declared length before anything is allocated.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// Default artifact fragment size (1 MiB).
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024 * 1024;

/// Largest fragment data size that still fits a frame once the fragment
/// header and service name are added.
pub const MAX_FRAGMENT_SIZE: usize = MAX_FRAME_PAYLOAD - 256 * 1024;

/// Socket read buffer size (256 KB).
pub const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Outbound frame queue depth per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Timeout for the TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a client waits for the `Connection` frame after dialing.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
