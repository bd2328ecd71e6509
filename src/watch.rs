//! Template change watching and content hashing.
//!
//! One recursive watch on the templates root covers every template directory,
//! including ones added at runtime. Each change schedules a debounced
//! recompute of the affected template's content hash:
//!
//! - triggers inside the quiet period collapse into one computation
//! - at most one computation per template runs at a time
//! - triggers that land during a computation cause exactly one trailing rerun
//!
//! The hash honours the template's `.buildignore`, so it describes exactly the
//! build context the engine would send.

use crate::error::{Error, Result};
use crate::image::TemplateHashes;
use crate::template::{hash_directory, IgnoreList, TemplateRegistry, NO_TEMPLATE_ID};
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Raw-event batching window of the OS watcher, below our own debounce.
const RAW_EVENT_WINDOW: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Slot {
    generation: u64,
    in_flight: bool,
    dirty: bool,
}

struct WatchState {
    templates: Arc<TemplateRegistry>,
    quiet: Duration,
    hashes: RwLock<HashMap<String, String>>,
    slots: Mutex<HashMap<String, Slot>>,
    ready: watch::Sender<bool>,
    computations: AtomicU64,
}

pub struct TemplateWatcher {
    state: Arc<WatchState>,
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher, FileIdMap>>>,
    cancel: CancellationToken,
}

impl TemplateWatcher {
    pub fn new(templates: Arc<TemplateRegistry>, quiet: Duration) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Arc::new(WatchState {
                templates,
                quiet,
                hashes: RwLock::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                ready,
                computations: AtomicU64::new(0),
            }),
            debouncer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Hash every known template now. Marks the watcher ready.
    pub async fn initial_scan(&self) -> Result<()> {
        let ids = self.state.templates.list_ids()?;
        let scans = ids
            .into_iter()
            .map(|id| Arc::clone(&self.state).run_computation(id));
        futures::future::join_all(scans).await;
        self.state.ready.send_replace(true);
        tracing::info!(
            "hashed {} template(s) under {}",
            self.state.hashes.read().len(),
            self.state.templates.root().display()
        );
        Ok(())
    }

    /// Resolve once the initial scan has finished.
    pub async fn wait_ready(&self) {
        let mut rx = self.state.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.state.ready.borrow()
    }

    /// Start watching the templates root.
    pub fn start(&self) -> Result<()> {
        let root = self.state.templates.root().to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut debouncer = new_debouncer(RAW_EVENT_WINDOW, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        for path in &event.paths {
                            let _ = tx.send(path.clone());
                        }
                    }
                }
                Err(errors) => tracing::warn!("Template watch error: {:?}", errors),
            }
        })
        .map_err(|e| Error::Watch(format!("Failed to create template watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(format!("Failed to watch {}: {}", root.display(), e)))?;
        tracing::debug!("Watching templates under {}", root.display());
        *self.debouncer.lock() = Some(debouncer);

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let canonical_root = root.canonicalize().unwrap_or(root);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    path = rx.recv() => {
                        let Some(path) = path else { break };
                        if let Some(id) = state.template_for_path(&canonical_root, &path) {
                            state.schedule(id);
                        }
                    }
                }
            }
            tracing::debug!("template watcher stopped");
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.debouncer.lock().take();
    }

    /// Schedule a debounced recompute of `template_id`, as a file event would.
    pub fn notify_changed(&self, template_id: &str) {
        let id = self.state.templates.canonical_id(template_id).to_string();
        self.state.schedule(id);
    }

    /// Number of hash computations run so far.
    pub fn computations(&self) -> u64 {
        self.state.computations.load(Ordering::SeqCst)
    }

    /// Snapshot of every known template hash.
    pub fn hashes(&self) -> HashMap<String, String> {
        self.state.hashes.read().clone()
    }
}

impl TemplateHashes for TemplateWatcher {
    fn template_hash(&self, template_id: &str) -> Result<String> {
        let id = self.state.templates.canonical_id(template_id);
        if let Some(hash) = self.state.hashes.read().get(id) {
            return Ok(hash.clone());
        }
        if self.state.templates.template_dir(id).is_dir() {
            Err(Error::HashPending(id.to_string()))
        } else {
            Err(Error::TemplateNotFound(id.to_string()))
        }
    }
}

impl Drop for TemplateWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl WatchState {
    /// Map a changed path to the template it belongs to.
    fn template_for_path(&self, root: &Path, path: &Path) -> Option<String> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let rel = path.strip_prefix(root).ok()?;

        if self.templates.is_no_template() {
            if IgnoreList::default().is_ignored(rel) {
                return None;
            }
            return Some(NO_TEMPLATE_ID.to_string());
        }

        let mut components = rel.components();
        let id = components.next()?.as_os_str().to_string_lossy().to_string();
        let inner: PathBuf = components.collect();
        if !inner.as_os_str().is_empty() && IgnoreList::default().is_ignored(&inner) {
            return None;
        }
        Some(id)
    }

    fn schedule(self: &Arc<Self>, id: String) {
        let generation = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(id.clone()).or_default();
            slot.generation += 1;
            slot.generation
        };

        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(state.quiet).await;
            let latest = state.slots.lock().get(&id).map(|s| s.generation);
            if latest != Some(generation) {
                // A later trigger restarted the quiet period
                return;
            }
            state.run_computation(id).await;
        });
    }

    async fn run_computation(self: Arc<Self>, id: String) {
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(id.clone()).or_default();
            if slot.in_flight {
                slot.dirty = true;
                return;
            }
            slot.in_flight = true;
        }

        loop {
            self.compute(&id).await;
            let mut slots = self.slots.lock();
            let slot = slots.entry(id.clone()).or_default();
            if slot.dirty {
                slot.dirty = false;
                continue;
            }
            slot.in_flight = false;
            break;
        }
    }

    async fn compute(&self, id: &str) {
        self.computations.fetch_add(1, Ordering::SeqCst);
        let dir = self.templates.template_dir(id);

        let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
            if !dir.is_dir() {
                return Ok(None);
            }
            let ignore = IgnoreList::load(&dir)?;
            hash_directory(&dir, &ignore).map(Some)
        })
        .await;

        match hashed {
            Ok(Ok(Some(hash))) => {
                let previous = self.hashes.write().insert(id.to_string(), hash.clone());
                if previous.as_deref() != Some(hash.as_str()) {
                    tracing::debug!("template '{}' hash is now {}", id, &hash[..12.min(hash.len())]);
                    self.templates.invalidate(id);
                }
            }
            Ok(Ok(None)) => {
                if self.hashes.write().remove(id).is_some() {
                    tracing::info!("template '{}' was removed", id);
                }
                self.templates.invalidate(id);
            }
            Ok(Err(e)) => tracing::warn!("failed to hash template '{}': {}", id, e),
            Err(e) => tracing::warn!("hash worker for template '{}' failed: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_template(root: &Path, id: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("template.yaml"), "name: test\n").unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    }

    fn watcher(root: &Path, quiet_ms: u64) -> TemplateWatcher {
        let registry = Arc::new(TemplateRegistry::new(root, false));
        TemplateWatcher::new(registry, Duration::from_millis(quiet_ms))
    }

    #[tokio::test]
    async fn hash_is_pending_until_scanned() {
        let dir = TempDir::new().unwrap();
        write_template(dir.path(), "web");
        let watcher = watcher(dir.path(), 20);

        assert!(matches!(
            watcher.template_hash("web"),
            Err(Error::HashPending(_))
        ));
        assert!(matches!(
            watcher.template_hash("missing"),
            Err(Error::TemplateNotFound(_))
        ));

        watcher.initial_scan().await.unwrap();
        watcher.wait_ready().await;
        assert_eq!(watcher.template_hash("web").unwrap().len(), 64);
    }

    #[tokio::test]
    async fn burst_of_triggers_computes_once() {
        let dir = TempDir::new().unwrap();
        write_template(dir.path(), "web");
        let watcher = watcher(dir.path(), 50);

        for _ in 0..10 {
            watcher.notify_changed("web");
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(watcher.computations(), 1);
        assert!(watcher.template_hash("web").is_ok());
    }

    #[tokio::test]
    async fn change_updates_hash_and_removal_drops_it() {
        let dir = TempDir::new().unwrap();
        write_template(dir.path(), "web");
        let watcher = watcher(dir.path(), 20);
        watcher.initial_scan().await.unwrap();
        let before = watcher.template_hash("web").unwrap();

        std::fs::write(dir.path().join("web/Dockerfile"), "FROM alpine\n").unwrap();
        watcher.notify_changed("web");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(watcher.template_hash("web").unwrap(), before);

        std::fs::remove_dir_all(dir.path().join("web")).unwrap();
        watcher.notify_changed("web");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            watcher.template_hash("web"),
            Err(Error::TemplateNotFound(_))
        ));
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        done()
    }

    #[tokio::test]
    async fn file_edits_recompute_once_through_the_os_watcher() {
        let dir = TempDir::new().unwrap();
        write_template(dir.path(), "web");
        let watcher = watcher(dir.path(), 300);
        watcher.initial_scan().await.unwrap();
        let before = watcher.template_hash("web").unwrap();
        let scanned = watcher.computations();

        watcher.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for i in 0..5 {
            std::fs::write(dir.path().join("web/Dockerfile"), format!("FROM alpine:{}\n", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(wait_for(|| watcher.template_hash("web").is_ok_and(|h| h != before)).await);
        // Nothing trails the single recompute
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(watcher.computations() - scanned, 1);

        write_template(dir.path(), "api");
        assert!(wait_for(|| watcher.template_hash("api").is_ok()).await);
        watcher.stop();
    }

    #[test]
    fn paths_map_to_their_template() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let watcher = watcher(&root, 20);
        let state = &watcher.state;

        assert_eq!(
            state.template_for_path(&root, &root.join("web/src/main.rs")),
            Some("web".to_string())
        );
        assert_eq!(state.template_for_path(&root, &root.join("web/.git/HEAD")), None);
        assert_eq!(state.template_for_path(&root, Path::new("/elsewhere/x")), None);
    }
}
