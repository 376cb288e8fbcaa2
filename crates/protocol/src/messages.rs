use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Runner identification
// ---------------------------------------------------------------------------

/// Operating-system family a runner builds for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsFamily {
    Windows,
    #[serde(rename = "macOS")]
    MacOs,
    Linux,
}

impl OsFamily {
    /// Family of the machine this binary runs on.
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(OsFamily::Windows)
        } else if cfg!(target_os = "macos") {
            Some(OsFamily::MacOs)
        } else if cfg!(target_os = "linux") {
            Some(OsFamily::Linux)
        } else {
            None
        }
    }

    /// Infers which family builds a target from its conventional name.
    ///
    /// Apple targets need a macOS host; desktop Windows and Linux targets
    /// build on their own OS. Returns `None` for names that carry no hint.
    pub fn infer_from_target(target_name: &str) -> Option<Self> {
        let name = target_name.to_ascii_lowercase();
        if name.starts_with("win") || name.starts_with("uwp") {
            Some(OsFamily::Windows)
        } else if ["osx", "mac", "ios", "tvos", "visionos"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            Some(OsFamily::MacOs)
        } else if name.starts_with("linux") {
            Some(OsFamily::Linux)
        } else {
            None
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OsFamily::Windows => "Windows",
            OsFamily::MacOs => "macOS",
            OsFamily::Linux => "Linux",
        })
    }
}

/// Sent by a runner on the runner-info service right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerInfo {
    pub name: String,
    pub os: OsFamily,
    /// Build targets this runner has configuration for.
    #[serde(default)]
    pub targets: Vec<String>,
}

// ---------------------------------------------------------------------------
// Jobs and status
// ---------------------------------------------------------------------------

/// A build job sent from the master to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildJob {
    pub job_id: String,
    pub project_id: String,
    pub target_name: String,
    pub branch: String,
}

impl BuildJob {
    /// Upload directory name for this job's artifacts.
    pub fn upload_directory(&self) -> String {
        format!("{}/{}", self.project_id, self.target_name)
    }
}

/// Lifecycle of a job as reported by its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Queued,
    Building,
    Complete,
    Error,
}

/// Status report for one target, sent runner → master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildStatusMessage {
    pub target_name: String,
    pub status: BuildStatus,
    /// Elapsed build time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Diagnostic text (build output tail on `Error`, queue position on `Queued`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BuildStatusMessage {
    /// Creates a status message tied to `job`.
    pub fn for_job(job: &BuildJob, status: BuildStatus) -> Self {
        Self {
            target_name: job.target_name.clone(),
            status,
            time: None,
            job_id: Some(job.job_id.clone()),
            project_id: Some(job.project_id.clone()),
            message: None,
        }
    }

    pub fn with_time(mut self, millis: i64) -> Self {
        self.time = Some(millis);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Artifact upload
// ---------------------------------------------------------------------------

/// One file listed in an [`UploadSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadedFile {
    pub path: String,
    pub size: u64,
    /// SHA-256 hex digest of the file contents.
    pub sha256: String,
}

/// Sent on the file-transfer service after the last fragment of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub directory_name: String,
    pub files: Vec<UploadedFile>,
}

impl UploadSummary {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

// ---------------------------------------------------------------------------
// Build requests
// ---------------------------------------------------------------------------

/// Which version components to increment before building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionBump {
    #[serde(default)]
    pub major: bool,
    #[serde(default)]
    pub minor: bool,
    #[serde(default)]
    pub patch: bool,
    #[serde(default)]
    pub build: bool,
}

/// A client's request to run the pipeline for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildRequest {
    pub project_id: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub version_bump: VersionBump,
}

fn default_branch() -> String {
    "main".into()
}

/// Immediate answer to a [`BuildRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildRequestResponse {
    pub accepted: bool,
    pub message: String,
}
