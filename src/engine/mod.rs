//! Container engine abstraction.
//!
//! The lifecycle core drives containers only through [`ContainerEngine`].
//! [`DockerEngine`] implements it on top of the `docker` CLI; [`EngineLayer`]
//! wraps any engine to add behaviour (tracing, for one) without touching it.
//!
//! Runtime callbacks flow back through an [`EngineListener`] handed to
//! [`ContainerEngine::run`] and [`ContainerEngine::reattach`]. A listener's
//! `on_close` fires exactly once per attachment.

mod context;
mod docker;
mod layer;
mod stats;

pub use context::pack_build_context;
pub use docker::{DockerEngine, DockerEngineOptions};
pub use layer::{EngineLayer, TracingLayer};
pub use stats::{CpuTracker, ProcSample};

use crate::config::{EngineKind, NodeConfig};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Build arguments selecting an image bucket.
pub type BuildOptions = BTreeMap<String, String>;

/// Everything the engine needs to start a service's container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub port: u16,
    pub ports: Vec<u16>,
    /// MiB
    pub ram: u64,
    pub cpu: f64,
    /// MiB
    pub disk: u64,
    pub env: BTreeMap<String, String>,
    /// Attach to a dedicated isolated network.
    pub network: bool,
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub service_id: Option<String>,
    pub volume: Option<String>,
    pub running: bool,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub running_only: bool,
    pub service_id: Option<String>,
}

impl ContainerFilter {
    pub fn running() -> Self {
        Self {
            running_only: true,
            service_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStat {
    pub container_id: String,
    pub service_id: Option<String>,
    /// Percent of one core since the previous sample; 0 on the first sample.
    pub cpu_percent: f64,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostUsage {
    /// Bytes used by managed volumes.
    pub disk_used: u64,
    /// Bytes free on the runtime's storage.
    pub disk_free: u64,
}

/// Runtime callbacks for one attached container.
#[async_trait]
pub trait EngineListener: Send + Sync {
    /// Progress from the engine itself ("pulling", "attached", ...).
    fn on_state_message(&self, message: &str);
    /// A line of container output.
    fn on_message(&self, message: &str);
    /// The container exited or the attachment was lost.
    async fn on_close(&self, exit_code: Option<i64>);
}

/// Per-service key/value storage the engine can persist runtime state in.
#[async_trait]
pub trait MetaStore: Send + Sync {
    fn service_id(&self) -> &str;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build `build_dir` into an image. Rebuilds in place when `image_id` is
    /// given, otherwise returns a fresh id.
    async fn build(
        &self,
        image_id: Option<&str>,
        build_dir: &Path,
        options: &BuildOptions,
    ) -> Result<String>;

    async fn remove_image(&self, image_id: &str) -> Result<bool>;

    /// Start a container and attach `listener` to it. Returns the container id.
    async fn run(
        &self,
        template_id: &str,
        image_id: &str,
        volume_id: &str,
        options: &RunOptions,
        meta: Arc<dyn MetaStore>,
        listener: Arc<dyn EngineListener>,
    ) -> Result<String>;

    /// Graceful stop. `Ok(false)` if the container was not running.
    async fn stop(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool>;

    async fn kill(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool>;

    /// Re-establish the live stream to a container started by a previous
    /// process. Fails if it is not running, after firing the listener's close.
    async fn reattach(&self, container_id: &str, listener: Arc<dyn EngineListener>) -> Result<()>;

    async fn delete_volume(&self, volume_id: &str) -> Result<bool>;

    /// Write `text` to the container's stdin. `Ok(false)` if not attached.
    async fn cmd(&self, container_id: &str, text: &str) -> Result<bool>;

    async fn attached_volume(&self, container_id: &str) -> Result<Option<String>>;

    async fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<ContainerInfo>>;

    async fn list_running(&self) -> Result<Vec<ContainerInfo>> {
        self.list_containers(Some(&ContainerFilter::running())).await
    }

    /// Host ports bound by any container the runtime knows about.
    async fn list_attached_ports(&self) -> Result<HashSet<u16>>;

    async fn stat(&self, container_id: &str) -> Result<ContainerStat>;

    async fn stat_all(&self) -> Result<Vec<ContainerStat>>;

    async fn host_usage(&self) -> Result<HostUsage>;
}

/// Create the engine named by the config.
pub fn create_engine(config: &NodeConfig) -> Result<Arc<dyn ContainerEngine>> {
    match config.engine_kind()? {
        EngineKind::Docker => Ok(Arc::new(DockerEngine::new(DockerEngineOptions::from_config(
            config,
        )))),
    }
}
