//! Runner configuration, read from TOML.

use std::path::{Path, PathBuf};

use buildfarm_protocol::OsFamily;
use buildfarm_protocol::constants::{DEFAULT_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE};
use buildfarm_runner::TargetConfig;
use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectConfig;

pub const DEFAULT_CONFIG_FILE: &str = "runner.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name announced to the master.
    #[serde(default = "default_name")]
    pub name: String,

    /// Overrides the detected OS family.
    #[serde(default)]
    pub os: Option<OsFamily>,

    /// `host:port` of the master.
    #[serde(default = "default_master_address")]
    pub master_address: String,

    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    #[serde(default)]
    pub unity_path: Option<PathBuf>,

    #[serde(default)]
    pub godot_path: Option<PathBuf>,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "runner".into())
}

fn default_master_address() -> String {
    "127.0.0.1:9000".into()
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_fragment_size() -> usize {
    DEFAULT_FRAGMENT_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            os: None,
            master_address: default_master_address(),
            projects_root: default_projects_root(),
            fragment_size: default_fragment_size(),
            unity_path: None,
            godot_path: None,
            targets: Vec::new(),
            reconnect: ReconnectConfig::default(),
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
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_FRAGMENT_SIZE).contains(&self.fragment_size),
            "fragment_size must be between 1 and {MAX_FRAGMENT_SIZE} bytes, got {}",
            self.fragment_size
        );
        Ok(())
    }
}
