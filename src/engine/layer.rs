use super::{
    BuildOptions, ContainerEngine, ContainerFilter, ContainerInfo, ContainerStat, EngineListener,
    HostUsage, MetaStore, RunOptions,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Wraps an engine in another engine.
///
/// Layers compose outside-in: the last layer applied sees calls first.
pub trait EngineLayer: Send + Sync {
    fn layer(&self, inner: Arc<dyn ContainerEngine>) -> Arc<dyn ContainerEngine>;
}

/// Adds a tracing span around every engine call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl EngineLayer for TracingLayer {
    fn layer(&self, inner: Arc<dyn ContainerEngine>) -> Arc<dyn ContainerEngine> {
        Arc::new(TracingEngine { inner })
    }
}

struct TracingEngine {
    inner: Arc<dyn ContainerEngine>,
}

#[async_trait]
impl ContainerEngine for TracingEngine {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    #[tracing::instrument(skip(self, build_dir, options), fields(engine = self.inner.name()), err)]
    async fn build(
        &self,
        image_id: Option<&str>,
        build_dir: &Path,
        options: &BuildOptions,
    ) -> Result<String> {
        self.inner.build(image_id, build_dir, options).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn remove_image(&self, image_id: &str) -> Result<bool> {
        self.inner.remove_image(image_id).await
    }

    #[tracing::instrument(
        skip(self, options, meta, listener),
        fields(service = meta.service_id()),
        err
    )]
    async fn run(
        &self,
        template_id: &str,
        image_id: &str,
        volume_id: &str,
        options: &RunOptions,
        meta: Arc<dyn MetaStore>,
        listener: Arc<dyn EngineListener>,
    ) -> Result<String> {
        self.inner
            .run(template_id, image_id, volume_id, options, meta, listener)
            .await
    }

    #[tracing::instrument(skip(self, meta), fields(service = meta.service_id()), err)]
    async fn stop(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool> {
        self.inner.stop(container_id, meta).await
    }

    #[tracing::instrument(skip(self, meta), fields(service = meta.service_id()), err)]
    async fn kill(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool> {
        self.inner.kill(container_id, meta).await
    }

    #[tracing::instrument(skip(self, listener), err)]
    async fn reattach(&self, container_id: &str, listener: Arc<dyn EngineListener>) -> Result<()> {
        self.inner.reattach(container_id, listener).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        self.inner.delete_volume(volume_id).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn cmd(&self, container_id: &str, text: &str) -> Result<bool> {
        self.inner.cmd(container_id, text).await
    }

    async fn attached_volume(&self, container_id: &str) -> Result<Option<String>> {
        self.inner.attached_volume(container_id).await
    }

    async fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<ContainerInfo>> {
        self.inner.list_containers(filter).await
    }

    async fn list_running(&self) -> Result<Vec<ContainerInfo>> {
        self.inner.list_running().await
    }

    async fn list_attached_ports(&self) -> Result<HashSet<u16>> {
        self.inner.list_attached_ports().await
    }

    async fn stat(&self, container_id: &str) -> Result<ContainerStat> {
        self.inner.stat(container_id).await
    }

    async fn stat_all(&self) -> Result<Vec<ContainerStat>> {
        self.inner.stat_all().await
    }

    async fn host_usage(&self) -> Result<HostUsage> {
        self.inner.host_usage().await
    }
}
