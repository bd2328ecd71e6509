//! Shared fixtures: an in-memory container engine and template helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use service_node::engine::{
    BuildOptions, ContainerEngine, ContainerFilter, ContainerInfo, ContainerStat, EngineListener,
    HostUsage, MetaStore, RunOptions,
};
use service_node::error::{Error, Result};
use service_node::state::{Database, ImageRecord, Perma, Session, SqliteDatabase};
use service_node::{Node, NodeConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};

pub const WEB_TEMPLATE: &str = r#"
name: Web
ports:
  start: 21000
  end: 21009
  extra: 1
resources:
  ram: 256
  cpu: 0.5
  disk: 512
options:
  required: [EULA]
  optional:
    VERSION: "1"
build_args: [VERSION]
meta:
  stopCmd: stop
"#;

pub fn write_template(root: &Path, id: &str, yaml: &str) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).expect("create template dir");
    std::fs::write(dir.join("template.yaml"), yaml).expect("write template.yaml");
    std::fs::write(dir.join("Dockerfile"), "FROM alpine\nCMD [\"sh\"]\n").expect("write Dockerfile");
}

pub fn env(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Clone)]
pub struct FakeContainer {
    pub volume: Option<String>,
    pub service_id: Option<String>,
    pub ports: Vec<u16>,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    listeners: HashMap<String, Arc<dyn EngineListener>>,
    deferred_closes: Vec<(Arc<dyn EngineListener>, i64)>,
}

/// A [`ContainerEngine`] that keeps everything in memory.
///
/// `stop` and `kill` fire the listener's close like a real attachment does.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    pub builds: AtomicUsize,
    pub runs: AtomicUsize,
    pub fail_run: AtomicBool,
    /// Hold back `on_close` from stop/kill until [`FakeEngine::deliver_closes`].
    pub defer_closes: AtomicBool,
    pub build_delay: Mutex<Option<Duration>>,
    pub attached_ports: Mutex<HashSet<u16>>,
    pub rebuilt: Mutex<Vec<String>>,
    pub removed_images: Mutex<Vec<String>>,
    pub deleted_volumes: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<(String, String)>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn has_image(&self, image_id: &str) -> bool {
        self.state.lock().images.contains(image_id)
    }

    pub fn container(&self, container_id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(container_id).cloned()
    }

    pub fn running_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Start a container the node knows nothing about.
    pub fn add_running_container(&self, container_id: &str, volume: Option<&str>) {
        self.state.lock().containers.insert(
            container_id.to_string(),
            FakeContainer {
                volume: volume.map(str::to_string),
                service_id: None,
                ports: Vec::new(),
                running: true,
            },
        );
    }

    /// The container dies without a listener noticing, as across a restart.
    pub fn crash_silently(&self, container_id: &str) {
        let mut state = self.state.lock();
        state.listeners.remove(container_id);
        state.containers.remove(container_id);
    }

    /// The container exits on its own.
    pub async fn trigger_exit(&self, container_id: &str, exit_code: Option<i64>) {
        let listener = {
            let mut state = self.state.lock();
            state.containers.remove(container_id);
            state.listeners.remove(container_id)
        };
        if let Some(listener) = listener {
            listener.on_close(exit_code).await;
        }
    }

    /// Fire every close held back while `defer_closes` was set.
    pub async fn deliver_closes(&self) {
        let closes = std::mem::take(&mut self.state.lock().deferred_closes);
        for (listener, exit_code) in closes {
            listener.on_close(Some(exit_code)).await;
        }
    }

    async fn terminate(&self, container_id: &str, exit_code: i64) -> bool {
        let (existed, listener) = {
            let mut state = self.state.lock();
            let existed = state.containers.remove(container_id).is_some();
            let listener = state.listeners.remove(container_id);
            if self.defer_closes.load(Ordering::SeqCst) {
                if let Some(listener) = listener {
                    state.deferred_closes.push((listener, exit_code));
                }
                return existed;
            }
            (existed, listener)
        };
        if let Some(listener) = listener {
            listener.on_close(Some(exit_code)).await;
        }
        existed
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn build(
        &self,
        image_id: Option<&str>,
        _build_dir: &Path,
        _options: &BuildOptions,
    ) -> Result<String> {
        let delay = *self.build_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = match image_id {
            Some(id) => {
                self.rebuilt.lock().push(id.to_string());
                id.to_string()
            }
            None => {
                state.next_id += 1;
                format!("img-{}", state.next_id)
            }
        };
        state.images.insert(id.clone());
        Ok(id)
    }

    async fn remove_image(&self, image_id: &str) -> Result<bool> {
        self.removed_images.lock().push(image_id.to_string());
        Ok(self.state.lock().images.remove(image_id))
    }

    async fn run(
        &self,
        _template_id: &str,
        image_id: &str,
        volume_id: &str,
        options: &RunOptions,
        meta: Arc<dyn MetaStore>,
        listener: Arc<dyn EngineListener>,
    ) -> Result<String> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(Error::Runtime(format!("cannot start {}", image_id)));
        }
        self.runs.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if !state.images.contains(image_id) {
            return Err(Error::ImageNotFound(image_id.to_string()));
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        let mut ports = vec![options.port];
        ports.extend(&options.ports);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                volume: Some(volume_id.to_string()),
                service_id: Some(meta.service_id().to_string()),
                ports,
                running: true,
            },
        );
        state.listeners.insert(id.clone(), listener);
        Ok(id)
    }

    async fn stop(&self, container_id: &str, _meta: &dyn MetaStore) -> Result<bool> {
        Ok(self.terminate(container_id, 0).await)
    }

    async fn kill(&self, container_id: &str, _meta: &dyn MetaStore) -> Result<bool> {
        self.killed.lock().push(container_id.to_string());
        Ok(self.terminate(container_id, 137).await)
    }

    async fn reattach(&self, container_id: &str, listener: Arc<dyn EngineListener>) -> Result<()> {
        let running = {
            let mut state = self.state.lock();
            let running = state
                .containers
                .get(container_id)
                .is_some_and(|c| c.running);
            if running {
                state
                    .listeners
                    .insert(container_id.to_string(), Arc::clone(&listener));
            }
            running
        };
        if running {
            return Ok(());
        }
        listener.on_close(None).await;
        Err(Error::Runtime(format!("container {} is not running", container_id)))
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        self.deleted_volumes.lock().push(volume_id.to_string());
        Ok(true)
    }

    async fn cmd(&self, container_id: &str, text: &str) -> Result<bool> {
        if !self.state.lock().listeners.contains_key(container_id) {
            return Ok(false);
        }
        self.commands
            .lock()
            .push((container_id.to_string(), text.to_string()));
        Ok(true)
    }

    async fn attached_volume(&self, container_id: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .containers
            .get(container_id)
            .and_then(|c| c.volume.clone()))
    }

    async fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<ContainerInfo>> {
        let state = self.state.lock();
        let mut containers: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|(_, c)| filter.map_or(true, |f| !f.running_only || c.running))
            .filter(|(_, c)| {
                filter
                    .and_then(|f| f.service_id.as_ref())
                    .map_or(true, |id| c.service_id.as_ref() == Some(id))
            })
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                service_id: c.service_id.clone(),
                volume: c.volume.clone(),
                running: c.running,
                ports: c.ports.clone(),
            })
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn list_attached_ports(&self) -> Result<HashSet<u16>> {
        let mut ports = self.attached_ports.lock().clone();
        for container in self.state.lock().containers.values() {
            ports.extend(&container.ports);
        }
        Ok(ports)
    }

    async fn stat(&self, container_id: &str) -> Result<ContainerStat> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::Runtime(format!("no such container {}", container_id)))?;
        Ok(ContainerStat {
            container_id: container_id.to_string(),
            service_id: container.service_id.clone(),
            cpu_percent: 0.0,
            memory_bytes: Some(64 * 1024 * 1024),
        })
    }

    async fn stat_all(&self) -> Result<Vec<ContainerStat>> {
        let ids: Vec<String> = self.state.lock().containers.keys().cloned().collect();
        let mut stats = Vec::new();
        for id in ids {
            stats.push(self.stat(&id).await?);
        }
        Ok(stats)
    }

    async fn host_usage(&self) -> Result<HostUsage> {
        Ok(HostUsage {
            disk_used: 1024,
            disk_free: 1024 * 1024,
        })
    }
}

/// A [`Database`] that can park one call after it has read its answer,
/// to line up interleavings between concurrent operations.
pub struct GatedDatabase {
    inner: Arc<dyn Database>,
    get_session_gate: Mutex<Option<oneshot::Receiver<()>>>,
    list_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Notified when a call reaches an armed gate.
    pub parked: Notify,
}

impl GatedDatabase {
    pub async fn new() -> Arc<Self> {
        let inner = SqliteDatabase::new_ephemeral()
            .await
            .expect("open in-memory database");
        Arc::new(Self {
            inner: Arc::new(inner),
            get_session_gate: Mutex::new(None),
            list_gate: Mutex::new(None),
            parked: Notify::new(),
        })
    }

    /// Park the next `get_session` until the returned sender fires.
    pub fn gate_next_get_session(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.get_session_gate.lock() = Some(rx);
        tx
    }

    /// Park the next `list` until the returned sender fires.
    pub fn gate_next_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.list_gate.lock() = Some(rx);
        tx
    }

    async fn pass(&self, gate: &Mutex<Option<oneshot::Receiver<()>>>) {
        let rx = gate.lock().take();
        if let Some(rx) = rx {
            self.parked.notify_one();
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl Database for GatedDatabase {
    async fn save_perma(&self, perma: &Perma) -> Result<()> {
        self.inner.save_perma(perma).await
    }

    async fn get_perma(&self, service_id: &str) -> Result<Option<Perma>> {
        self.inner.get_perma(service_id).await
    }

    async fn delete_perma(&self, service_id: &str) -> Result<bool> {
        self.inner.delete_perma(service_id).await
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.inner.save_session(session).await
    }

    async fn get_session(&self, service_id: &str) -> Result<Option<Session>> {
        let session = self.inner.get_session(service_id).await;
        self.pass(&self.get_session_gate).await;
        session
    }

    async fn delete_session(&self, service_id: &str) -> Result<bool> {
        self.inner.delete_session(service_id).await
    }

    async fn delete_sessions(&self, node_id: &str) -> Result<usize> {
        self.inner.delete_sessions(node_id).await
    }

    async fn list_sessions(&self, node_id: &str) -> Result<Vec<Session>> {
        self.inner.list_sessions(node_id).await
    }

    async fn list(
        &self,
        node_id: &str,
        page: Option<u32>,
        page_size: Option<u32>,
        meta_filter: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Perma>> {
        let permas = self.inner.list(node_id, page, page_size, meta_filter).await;
        self.pass(&self.list_gate).await;
        permas
    }

    async fn count(&self, node_id: &str) -> Result<u64> {
        self.inner.count(node_id).await
    }

    async fn save_image(&self, image: &ImageRecord) -> Result<()> {
        self.inner.save_image(image).await
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        self.inner.get_image(image_id).await
    }

    async fn delete_image(&self, image_id: &str) -> Result<bool> {
        self.inner.delete_image(image_id).await
    }

    async fn list_images_by_options(
        &self,
        template_id: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Vec<ImageRecord>> {
        self.inner.list_images_by_options(template_id, options).await
    }

    async fn count_image_refs(&self, image_id: &str) -> Result<u64> {
        self.inner.count_image_refs(image_id).await
    }

    async fn set_service_meta(
        &self,
        service_id: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        self.inner.set_service_meta(service_id, key, value).await
    }

    async fn get_service_meta(&self, service_id: &str, key: &str) -> Result<Option<String>> {
        self.inner.get_service_meta(service_id, key).await
    }

    async fn set_meta_val(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta_val(key, value).await
    }

    async fn get_meta_val(&self, key: &str, default: Option<&str>) -> Result<Option<String>> {
        self.inner.get_meta_val(key, default).await
    }
}

/// A started node over `templates`, with in-memory state.
pub async fn start_node(templates: &Path, engine: Arc<FakeEngine>) -> Arc<Node> {
    let db: Arc<dyn Database> = Arc::new(
        SqliteDatabase::new_ephemeral()
            .await
            .expect("open in-memory database"),
    );
    start_node_with_db(templates, engine, db).await
}

pub async fn start_node_with_db(
    templates: &Path,
    engine: Arc<FakeEngine>,
    db: Arc<dyn Database>,
) -> Arc<Node> {
    let mut config = NodeConfig::new("node-1", templates);
    config.watch_debounce_ms = 20;
    let node = Node::builder()
        .config(config)
        .engine(engine)
        .database(db)
        .port_probe(|_| true)
        .build()
        .await
        .expect("build node");
    node.start().await.expect("start node");
    node
}

pub fn templates_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write_template(dir.path(), "web", WEB_TEMPLATE);
    dir
}
