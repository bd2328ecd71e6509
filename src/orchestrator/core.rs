use super::listener::ServiceListener;
use crate::config::NodeConfig;
use crate::engine::ContainerEngine;
use crate::error::{Error, Result};
use crate::events::{EventHub, LifecycleEvent};
use crate::image::ImageManager;
use crate::lock::BusyLock;
use crate::port::PortAllocator;
use crate::state::{Database, Perma, ServiceMetaStore};
use crate::template::TemplateRegistry;
use crate::watch::TemplateWatcher;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

/// The node-local orchestrator.
///
/// Owns every piece of in-memory coordination state (busy lock, running set,
/// template hashes) and is the only writer of service and session records.
/// Always lives in an `Arc`; see [`super::NodeBuilder`].
pub struct Node {
    pub(super) config: NodeConfig,
    pub(super) db: Arc<dyn Database>,
    pub(super) engine: Arc<dyn ContainerEngine>,
    pub(super) templates: Arc<TemplateRegistry>,
    pub(super) watcher: Arc<TemplateWatcher>,
    pub(super) images: ImageManager,
    pub(super) lock: BusyLock,
    pub(super) events: EventHub,
    pub(super) ports: PortAllocator,
    /// Serializes port selection across concurrent creates.
    pub(super) allocation: tokio::sync::Mutex<()>,
    pub(super) running: Mutex<BTreeSet<String>>,
    pub(super) self_ref: Weak<Node>,
}

impl Node {
    pub fn builder() -> super::NodeBuilder {
        super::NodeBuilder::new()
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn busy_lock(&self) -> &BusyLock {
        &self.lock
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn watcher(&self) -> &TemplateWatcher {
        &self.watcher
    }

    pub fn images(&self) -> &ImageManager {
        &self.images
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Hash templates, start watching them, then reconcile persisted
    /// sessions with the runtime. Call once before accepting work.
    pub async fn start(&self) -> Result<super::BootReport> {
        self.watcher.initial_scan().await?;
        if let Err(e) = self.watcher.start() {
            // Hashes still work from the initial scan; only live updates are lost
            tracing::warn!("template watching disabled: {}", e);
        }
        self.boot().await
    }

    /// Name of the volume backing a service.
    pub fn volume_id(&self, service_id: &str) -> String {
        format!("{}-{}", self.config.volume_prefix, service_id)
    }

    pub(super) fn meta_store(&self, service_id: &str) -> Arc<ServiceMetaStore> {
        Arc::new(ServiceMetaStore::new(Arc::clone(&self.db), service_id))
    }

    pub(super) fn listener(&self, service_id: &str) -> Arc<ServiceListener> {
        Arc::new(ServiceListener::new(self.self_ref.clone(), service_id))
    }

    pub(super) async fn require_perma(&self, service_id: &str) -> Result<Perma> {
        self.db
            .get_perma(service_id)
            .await?
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))
    }

    pub fn running_services(&self) -> Vec<String> {
        self.running.lock().iter().cloned().collect()
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.running.lock().contains(service_id)
    }

    pub(super) fn mark_running(&self, service_id: &str) {
        let changed = self.running.lock().insert(service_id.to_string());
        if changed {
            self.emit_running_set();
        }
    }

    pub(super) fn mark_stopped(&self, service_id: &str) {
        let changed = self.running.lock().remove(service_id);
        if changed {
            self.emit_running_set();
        }
    }

    fn emit_running_set(&self) {
        let running = self.running_services();
        self.events
            .emit(LifecycleEvent::RunningSetChanged { running });
    }
}
