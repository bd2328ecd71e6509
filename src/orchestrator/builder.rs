use super::Node;
use crate::config::NodeConfig;
use crate::engine::{create_engine, ContainerEngine, EngineLayer};
use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::image::ImageManager;
use crate::lock::BusyLock;
use crate::port::PortAllocator;
use crate::state::{Database, SqliteDatabase};
use crate::template::TemplateRegistry;
use crate::watch::TemplateWatcher;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Builder for a [`Node`].
///
/// Only the config is required. The engine comes from `config.engine` and the
/// database from `config.state_dir` unless supplied.
///
/// # Example
///
/// ```no_run
/// use service_node::{Node, NodeConfig};
/// use service_node::engine::TracingLayer;
///
/// # async fn example() -> Result<(), service_node::Error> {
/// let node = Node::builder()
///     .config(NodeConfig::new("node-1", "/srv/templates"))
///     .layer(TracingLayer)
///     .build()
///     .await?;
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct NodeBuilder {
    config: Option<NodeConfig>,
    engine: Option<Arc<dyn ContainerEngine>>,
    database: Option<Arc<dyn Database>>,
    layers: Vec<Box<dyn EngineLayer>>,
    ephemeral: bool,
    port_probe: Option<fn(u16) -> bool>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this engine instead of the one named by the config.
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Wrap the engine. Layers apply in call order, so the last one added
    /// sees calls first.
    pub fn layer(mut self, layer: impl EngineLayer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Keep state in memory instead of under `state_dir`.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Replace the host port availability check.
    pub fn port_probe(mut self, probe: fn(u16) -> bool) -> Self {
        self.port_probe = Some(probe);
        self
    }

    /// Assemble the node. Does not touch the runtime; see [`Node::start`].
    pub async fn build(self) -> Result<Arc<Node>> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("config is required".to_string()))?;
        config.validate()?;

        let mut engine = match self.engine {
            Some(engine) => engine,
            None => create_engine(&config)?,
        };
        for layer in &self.layers {
            engine = layer.layer(engine);
        }

        let db: Arc<dyn Database> = match self.database {
            Some(db) => db,
            None if self.ephemeral => Arc::new(SqliteDatabase::new_ephemeral().await?),
            None => Arc::new(SqliteDatabase::new(config.state_dir()).await?),
        };

        let templates = Arc::new(TemplateRegistry::new(
            config.templates_dir.clone(),
            config.no_template,
        ));
        let watcher = Arc::new(TemplateWatcher::new(
            Arc::clone(&templates),
            config.watch_debounce(),
        ));
        let images = ImageManager::new(
            Arc::clone(&db),
            Arc::clone(&engine),
            Arc::clone(&templates),
            watcher.clone(),
        );
        let ports = match self.port_probe {
            Some(probe) => PortAllocator::with_probe(probe),
            None => PortAllocator::new(),
        };

        tracing::debug!(
            "node {} using engine {} and templates at {}",
            config.node_id,
            engine.name(),
            config.templates_dir.display()
        );

        Ok(Arc::new_cyclic(|self_ref| Node {
            config,
            db,
            engine,
            templates,
            watcher,
            images,
            lock: BusyLock::new(),
            events: EventHub::new(),
            ports,
            allocation: tokio::sync::Mutex::new(()),
            running: Mutex::new(BTreeSet::new()),
            self_ref: self_ref.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_is_required() {
        let err = NodeBuilder::new().ephemeral(true).build().await.err();
        assert!(matches!(err, Some(Error::Config(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = NodeConfig::new("", "/tmp");
        config.engine = "docker".to_string();
        let err = NodeBuilder::new().config(config).ephemeral(true).build().await.err();
        assert!(matches!(err, Some(Error::Config(_))));
    }
}
