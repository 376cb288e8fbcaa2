//! Master configuration, read from TOML.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use buildfarm_pipeline::DeployTier;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "master.toml";

/// One external deploy step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerConfig {
    pub name: String,
    #[serde(default)]
    pub tier: DeployTier,
    pub program: String,
    /// Arguments; `{project}`, `{version}`, `{target}` and `{artifact}` are
    /// substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Targets to deploy; empty means all.
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Log the rendered report when a pipeline ends.
    #[serde(default = "default_true")]
    pub log: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self { log: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Where uploaded artifacts are written.
    #[serde(default = "default_receive_root")]
    pub receive_root: PathBuf,

    /// Where project checkouts live, one directory per project id.
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    /// Partial uploads idle this long are discarded.
    #[serde(default = "default_fragment_stale_after")]
    pub fragment_stale_after_secs: u64,

    #[serde(default = "default_stale_sweep_interval")]
    pub stale_sweep_interval_secs: u64,

    /// Longest a single target may take before it is failed.
    #[serde(default = "default_target_timeout")]
    pub target_timeout_secs: u64,

    #[serde(default)]
    pub deployers: Vec<DeployerConfig>,

    #[serde(default)]
    pub hooks: HooksConfig,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9000
}

fn default_receive_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_fragment_stale_after() -> u64 {
    300
}

fn default_stale_sweep_interval() -> u64 {
    30
}

fn default_target_timeout() -> u64 {
    2 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            receive_root: default_receive_root(),
            projects_root: default_projects_root(),
            fragment_stale_after_secs: default_fragment_stale_after(),
            stale_sweep_interval_secs: default_stale_sweep_interval(),
            target_timeout_secs: default_target_timeout(),
            deployers: Vec::new(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Config {
    /// Reads `path`, or falls back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn fragment_stale_after(&self) -> Duration {
        Duration::from_secs(self.fragment_stale_after_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs.max(1))
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }
}
