//! Boot-time reconciliation of persisted sessions with the runtime.
//!
//! Sessions survive a node restart; the containers behind them may not. On
//! boot every session is reattached, sessions whose container is gone are
//! closed, and running managed containers that no live session accounts for
//! are killed.

use super::Node;
use crate::engine::{ContainerInfo, MetaStore};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What a boot pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    /// Services whose containers were still running.
    pub reattached: Vec<String>,
    /// Services whose sessions were closed because the container was gone.
    pub closed: Vec<String>,
    /// Containers killed because no session owned them.
    pub orphans_killed: Vec<String>,
}

/// Meta store for containers that belong to no live service.
///
/// Reads nothing and drops writes, so tearing down an orphan never touches
/// the state of a service that reuses its volume.
struct DetachedMeta {
    service_id: String,
}

#[async_trait]
impl MetaStore for DetachedMeta {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Option<&str>) -> Result<()> {
        Ok(())
    }
}

pub(super) struct OrphanCleaner<'a> {
    node: &'a Node,
}

impl<'a> OrphanCleaner<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }

    async fn reattach_sessions(&self, report: &mut BootReport) -> Result<()> {
        let node = self.node;
        for session in node.db.list_sessions(node.node_id()).await? {
            let service_id = session.service_id.clone();
            let listener = node.listener(&service_id);
            listener.bind_container(&session.container_id);

            match node.engine.reattach(&session.container_id, listener).await {
                Ok(()) => {
                    debug!("reattached {} to {}", service_id, session.container_id);
                    node.mark_running(&service_id);
                    report.reattached.push(service_id);
                }
                Err(e) => {
                    info!("session of {} is stale: {}", service_id, e);
                    // The close callback usually removed it already
                    if let Err(e) = node.db.delete_session(&service_id).await {
                        warn!("failed to delete session of {}: {}", service_id, e);
                    }
                    node.mark_stopped(&service_id);
                    report.closed.push(service_id);
                }
            }
        }
        Ok(())
    }

    /// Kill running managed containers not owned by a live session.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let node = self.node;
        let live: HashMap<String, String> = node
            .db
            .list_sessions(node.node_id())
            .await?
            .into_iter()
            .map(|s| (node.volume_id(&s.service_id), s.container_id))
            .collect();

        let mut killed = Vec::new();
        for container in node.engine.list_running().await? {
            let volume = match &container.volume {
                Some(volume) => Some(volume.clone()),
                None => node.engine.attached_volume(&container.id).await?,
            };
            if is_owned(&container, volume.as_deref(), &live) {
                continue;
            }

            warn!(
                "killing orphaned container {} (volume {:?})",
                container.id, volume
            );
            let meta = DetachedMeta {
                service_id: container.service_id.clone().unwrap_or_default(),
            };
            match node.engine.kill(&container.id, &meta).await {
                Ok(_) => killed.push(container.id),
                Err(e) => warn!("failed to kill orphan {}: {}", container.id, e),
            }
        }
        Ok(killed)
    }
}

fn is_owned(container: &ContainerInfo, volume: Option<&str>, live: &HashMap<String, String>) -> bool {
    let Some(volume) = volume else {
        return false;
    };
    live.get(volume).is_some_and(|owner| *owner == container.id)
}

impl Node {
    /// Reconcile sessions and containers after a restart.
    ///
    /// Waits for every busy slot to drain before sweeping, so a resume that
    /// raced the boot is never mistaken for an orphan.
    pub async fn boot(&self) -> Result<BootReport> {
        let cleaner = OrphanCleaner::new(self);
        let mut report = BootReport::default();
        cleaner.reattach_sessions(&mut report).await?;

        self.lock.when_unlocked_all().await;
        report.orphans_killed = cleaner.sweep().await?;

        info!(
            "boot: {} reattached, {} closed, {} orphan(s) killed",
            report.reattached.len(),
            report.closed.len(),
            report.orphans_killed.len()
        );
        Ok(report)
    }
}
