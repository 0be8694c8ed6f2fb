//! Configuration management for the connprobe orchestrator
//!
//! Loads configuration from a YAML file with environment variable
//! overrides, same cascade idiom as the agent this project grew out of.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::labels::PROJECT_NAMESPACE;

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Image used for the per-node runner DaemonSet.
    #[serde(default = "default_runner_image")]
    pub runner_image: String,

    /// Image used for synthetic target pods created to satisfy a
    /// `ClusterHost`/`GenericClusterHost` with no existing match.
    #[serde(default = "default_target_image")]
    pub target_image: String,

    /// Namespace connprobe creates its own RBAC/DaemonSet/ConfigMap
    /// objects in.
    #[serde(default = "default_project_namespace")]
    pub project_namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How long to wait for the runner DaemonSet to become ready before
    /// giving up (`OrchestratorError::DaemonNotReady`).
    #[serde(default = "default_daemon_ready_timeout_secs")]
    pub daemon_ready_timeout_secs: u64,

    /// Poll interval while waiting for the DaemonSet to become ready.
    #[serde(default = "default_daemon_ready_poll_interval_secs")]
    pub daemon_ready_poll_interval_secs: u64,

    /// How long to wait for all expected result ConfigMaps to appear.
    #[serde(default = "default_result_collect_timeout_secs")]
    pub result_collect_timeout_secs: u64,

    /// Poll interval while waiting for result ConfigMaps.
    #[serde(default = "default_result_collect_poll_interval_secs")]
    pub result_collect_poll_interval_secs: u64,

    /// Path to state directory (run history, cached snapshots).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Path where config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_runner_image() -> String {
    "ghcr.io/connprobe/runner:latest".to_string()
}

fn default_target_image() -> String {
    "docker.io/library/nginx:stable-alpine".to_string()
}

fn default_project_namespace() -> String {
    PROJECT_NAMESPACE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_daemon_ready_timeout_secs() -> u64 {
    120
}

fn default_daemon_ready_poll_interval_secs() -> u64 {
    5
}

fn default_result_collect_timeout_secs() -> u64 {
    300
}

fn default_result_collect_poll_interval_secs() -> u64 {
    5
}

fn default_state_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/lib/connprobe")
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("connprobe")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runner_image: default_runner_image(),
            target_image: default_target_image(),
            project_namespace: default_project_namespace(),
            log_level: default_log_level(),
            daemon_ready_timeout_secs: default_daemon_ready_timeout_secs(),
            daemon_ready_poll_interval_secs: default_daemon_ready_poll_interval_secs(),
            result_collect_timeout_secs: default_result_collect_timeout_secs(),
            result_collect_poll_interval_secs: default_result_collect_poll_interval_secs(),
            state_dir: default_state_dir(),
            config_path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, falling
    /// back to defaults (fully overridable by env vars) if none exist.
    pub fn load() -> Result<Self> {
        let paths = Self::config_paths();

        for path in &paths {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.config_path = path.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONNPROBE_RUNNER_IMAGE") {
            self.runner_image = v;
        }
        if let Ok(v) = std::env::var("CONNPROBE_TARGET_IMAGE") {
            self.target_image = v;
        }
        if let Ok(v) = std::env::var("CONNPROBE_PROJECT_NAMESPACE") {
            self.project_namespace = v;
        }
        if let Ok(v) = std::env::var("CONNPROBE_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.runner_image.is_empty() {
            anyhow::bail!("runner_image cannot be empty");
        }
        if self.target_image.is_empty() {
            anyhow::bail!("target_image cannot be empty");
        }
        if self.project_namespace.is_empty() {
            anyhow::bail!("project_namespace cannot be empty");
        }
        if self.daemon_ready_timeout_secs == 0 {
            anyhow::bail!("daemon_ready_timeout_secs must be positive");
        }
        if self.result_collect_timeout_secs == 0 {
            anyhow::bail!("result_collect_timeout_secs must be positive");
        }
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("connprobe.yaml"));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("connprobe").join("config.yaml"));
        }

        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/connprobe/config.yaml"));

        #[cfg(windows)]
        if let Ok(program_data) = std::env::var("ProgramData") {
            paths.push(PathBuf::from(program_data).join("connprobe").join("config.yaml"));
        }

        paths
    }
}
