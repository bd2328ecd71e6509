use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Container runtimes the node knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            other => Err(Error::Config(format!(
                "unknown engine '{}' (supported: docker)",
                other
            ))),
        }
    }
}

/// Top-level node configuration, usually read from `node.yaml`.
///
/// ```yaml
/// node_id: node-1
/// engine: docker
/// templates_dir: /srv/templates
/// watch_debounce_ms: 500
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node; every Perma and Session row is scoped by it.
    pub node_id: String,

    #[serde(default = "default_engine")]
    pub engine: String,

    /// Directory holding one sub-directory per template.
    pub templates_dir: PathBuf,

    /// Where the state database lives. Defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// All services share one synthetic template rooted at `templates_dir`.
    #[serde(default)]
    pub no_template: bool,

    /// Quiet period before a changed template is re-hashed.
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Build images on a worker thread. Unset means "unless nested in a container".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_in_background: Option<bool>,

    #[serde(default = "default_volume_prefix")]
    pub volume_prefix: String,

    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,

    /// Grace period handed to `docker stop` before it escalates to SIGKILL.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u32,

    /// Enforce the disk limit with `--storage-opt size=`. Needs a storage
    /// driver with quota support (overlay2 on xfs with pquota).
    #[serde(default)]
    pub storage_quota: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_volume_prefix() -> String {
    "svc-vol".to_string()
}

fn default_network_prefix() -> String {
    "svc-net".to_string()
}

fn default_stop_grace() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Minimal config for a node; everything else takes its default.
    pub fn new(node_id: impl Into<String>, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            engine: default_engine(),
            templates_dir: templates_dir.into(),
            state_dir: None,
            no_template: false,
            watch_debounce_ms: default_debounce_ms(),
            build_in_background: None,
            volume_prefix: default_volume_prefix(),
            network_prefix: default_network_prefix(),
            stop_grace_secs: default_stop_grace(),
            storage_quota: false,
            log_level: default_log_level(),
        }
    }

    /// Reject configurations the node cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must not be empty".to_string()));
        }
        self.engine_kind()?;
        if self.templates_dir.as_os_str().is_empty() {
            return Err(Error::Config("templates_dir is required".to_string()));
        }
        if self.watch_debounce_ms == 0 {
            return Err(Error::Config(
                "watch_debounce_ms must be greater than zero".to_string(),
            ));
        }
        for (field, prefix) in [
            ("volume_prefix", &self.volume_prefix),
            ("network_prefix", &self.network_prefix),
        ] {
            if prefix.is_empty()
                || !prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::Config(format!(
                    "{} '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                    field, prefix
                )));
            }
        }
        Ok(())
    }

    pub fn engine_kind(&self) -> Result<EngineKind> {
        self.engine.parse()
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("service-node")
        })
    }

    /// Whether image builds may run on a background worker.
    pub fn build_in_background(&self) -> bool {
        self.build_in_background
            .unwrap_or_else(|| !crate::docker::is_nested_container())
    }
}
