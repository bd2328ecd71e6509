//! Service lifecycle operations: create, resume, stop, delete, update.

use super::Node;
use crate::engine::{ContainerStat, HostUsage, RunOptions};
use crate::error::{Error, Result};
use crate::events::LifecycleEvent;
use crate::lock::{ACTION_DELETE, ACTION_FORCE_STOP, ACTION_RESUME, ACTION_STOP, ACTION_UPDATE};
use crate::state::{Perma, Session, LAST_POWER_ERROR_KEY};
use crate::template::STOP_CMD_KEY;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Request to create a service from a template.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub env: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    /// MiB; the template default when unset.
    pub ram: Option<u64>,
    pub cpu: Option<f64>,
    /// MiB; the template default when unset.
    pub disk: Option<u64>,
    pub network: bool,
}

/// Partial update of a stopped or running service's options.
///
/// `env` and `meta` merge key by key over the stored maps; every other set
/// field replaces the stored value.
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub env: Option<BTreeMap<String, String>>,
    pub meta: Option<BTreeMap<String, String>>,
    pub ram: Option<u64>,
    pub cpu: Option<f64>,
    pub disk: Option<u64>,
    pub network: Option<bool>,
}

/// Page through services, optionally filtered by exact meta matches.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Zero-based.
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub meta: Option<BTreeMap<String, String>>,
}

impl Node {
    /// Register a new service. Nothing is started; see [`Node::resume_service`].
    pub async fn create_service(&self, template_id: &str, request: CreateOptions) -> Result<Perma> {
        let template = self.templates.get(template_id)?;

        let mut meta = template.settings.meta.clone();
        meta.extend(request.meta);
        if meta.get(STOP_CMD_KEY).map_or(true, |cmd| cmd.is_empty()) {
            return Err(Error::Validation(format!(
                "template '{}' does not define meta.{}",
                template.id, STOP_CMD_KEY
            )));
        }

        template.validate_options(&request.env)?;
        let env = template.resolve_env(&request.env);

        // Held from the exclusion snapshot until the new ports are persisted
        let _allocation = self.allocation.lock().await;
        let mut excluded: HashSet<u16> = self.engine.list_attached_ports().await?;
        for perma in self.db.list(self.node_id(), None, None, None).await? {
            excluded.extend(perma.all_ports());
        }
        let ports = self.ports.allocate(&template.settings.ports, &excluded)?;

        let defaults = template.settings.resources;
        let perma = Perma {
            service_id: uuid::Uuid::new_v4().to_string(),
            template_id: template.id.clone(),
            node_id: self.node_id().to_string(),
            port: ports[0],
            ports: ports[1..].to_vec(),
            ram: request.ram.unwrap_or(defaults.ram),
            cpu: request.cpu.unwrap_or(defaults.cpu),
            disk: request.disk.unwrap_or(defaults.disk),
            env,
            meta,
            network: request.network,
            image_id: None,
            created_at: Utc::now(),
        };

        let saved = self.db.save_perma(&perma).await;
        // Persisted ports are excluded through the store from here on
        self.ports.release(&ports);
        saved?;

        info!(
            "created service {} from template '{}' on port {}",
            perma.service_id, perma.template_id, perma.port
        );
        Ok(perma)
    }

    /// Start a stopped service, building or refreshing its image first.
    pub async fn resume_service(&self, service_id: &str) -> Result<Session> {
        let perma = self.require_perma(service_id).await?;
        if self.db.get_session(service_id).await?.is_some() {
            return Err(already_running(service_id));
        }

        let guard = self.lock.lock(service_id, ACTION_RESUME)?.clear_tag_on_release();
        // A resume that finished since the check above owns the service now
        match self.db.get_session(service_id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                guard.release(None);
                return Err(already_running(service_id));
            }
            Err(e) => {
                guard.release(Some(e.to_string()));
                return Err(e);
            }
        }
        let result = self.resume_locked(perma).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .db
            .set_service_meta(service_id, LAST_POWER_ERROR_KEY, error.as_deref())
            .await
        {
            warn!("failed to record power state of {}: {}", service_id, e);
        }
        guard.release(error.clone());

        if result.is_ok() {
            self.mark_running(service_id);
        }
        self.events.emit(LifecycleEvent::Resume {
            service_id: service_id.to_string(),
            error,
        });
        result
    }

    async fn resume_locked(&self, mut perma: Perma) -> Result<Session> {
        let service_id = perma.service_id.clone();
        let template = self.templates.get(&perma.template_id)?;
        let build_options = template.build_options(&perma.env);

        let previous = perma.image_id.clone();
        let image_id = self
            .images
            .process_image(previous.as_deref(), &template.id, &build_options)
            .await?;
        if previous.as_deref() != Some(image_id.as_str()) {
            perma.image_id = Some(image_id.clone());
            self.db.save_perma(&perma).await?;
            if let Some(old) = previous {
                self.images.collect_if_unreferenced(&old).await;
            }
        }

        let options = run_options(&perma);
        let listener = self.listener(&service_id);
        let container_id = self
            .engine
            .run(
                &template.id,
                &image_id,
                &self.volume_id(&service_id),
                &options,
                self.meta_store(&service_id),
                listener.clone(),
            )
            .await?;
        listener.bind_container(&container_id);

        let session = Session::new(&service_id, self.node_id(), &container_id);
        if let Err(e) = self.db.save_session(&session).await {
            warn!(
                "failed to persist session for {}; killing container {}",
                service_id, container_id
            );
            let meta = self.meta_store(&service_id);
            if let Err(kill_err) = self.engine.kill(&container_id, meta.as_ref()).await {
                warn!("failed to kill container {}: {}", container_id, kill_err);
            }
            return Err(e);
        }

        info!("service {} running in container {}", service_id, container_id);
        Ok(session)
    }

    /// Stop a running service. With `force` the container is killed outright.
    pub async fn stop_service(&self, service_id: &str, force: bool) -> Result<()> {
        self.require_perma(service_id).await?;
        if self.db.get_session(service_id).await?.is_none() {
            return Err(not_running(service_id));
        }

        let action = if force { ACTION_FORCE_STOP } else { ACTION_STOP };
        let guard = self.lock.lock(service_id, action)?.clear_tag_on_release();
        let session = match self.db.get_session(service_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                guard.release(None);
                return Err(not_running(service_id));
            }
            Err(e) => {
                guard.release(Some(e.to_string()));
                return Err(e);
            }
        };

        let meta = self.meta_store(service_id);
        let stopped = if force {
            self.engine.kill(&session.container_id, meta.as_ref()).await
        } else {
            self.engine.stop(&session.container_id, meta.as_ref()).await
        };

        let result = match stopped {
            Ok(_) => self.db.delete_session(service_id).await.map(|_| ()),
            Err(e) => Err(e),
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        guard.release(error.clone());

        if result.is_ok() {
            info!("service {} stopped{}", service_id, if force { " (forced)" } else { "" });
            self.mark_stopped(service_id);
        }
        self.events.emit(LifecycleEvent::Stop {
            service_id: service_id.to_string(),
            error,
        });
        result
    }

    pub async fn stop_service_forcibly(&self, service_id: &str) -> Result<()> {
        self.stop_service(service_id, true).await
    }

    /// Write the template's stop command to the container's stdin and let it
    /// shut down on its own. Does not take the busy lock.
    pub async fn send_stop_signal(&self, service_id: &str) -> Result<bool> {
        let perma = self.require_perma(service_id).await?;
        let stop_cmd = perma
            .meta
            .get(STOP_CMD_KEY)
            .filter(|cmd| !cmd.is_empty())
            .ok_or_else(|| {
                Error::Validation(format!("service '{}' has no {}", service_id, STOP_CMD_KEY))
            })?;
        let session = self
            .db
            .get_session(service_id)
            .await?
            .ok_or_else(|| not_running(service_id))?;
        self.engine.cmd(&session.container_id, stop_cmd).await
    }

    /// Remove a service with its volume, stopping it first if needed.
    pub async fn delete_service(&self, service_id: &str) -> Result<()> {
        let perma = self.require_perma(service_id).await?;

        match self.stop_service(service_id, true).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => debug!("delete {}: {}", service_id, e),
            Err(e) => return Err(e),
        }
        self.lock.when_unlocked(service_id).await;
        // A resume may have finished while we waited
        if self.db.get_session(service_id).await?.is_some() {
            self.stop_service(service_id, true).await?;
        }

        let guard = self.lock.lock(service_id, ACTION_DELETE)?.clear_tag_on_release();
        self.events.pre_volume_deletion(service_id).await;

        let volume_id = self.volume_id(service_id);
        match self.engine.delete_volume(&volume_id).await {
            Ok(true) => debug!("deleted volume {}", volume_id),
            Ok(false) => debug!("volume {} did not exist", volume_id),
            Err(e) => warn!("failed to delete volume {}: {}", volume_id, e),
        }

        let deleted = self.db.delete_perma(service_id).await;
        guard.release(deleted.as_ref().err().map(|e| e.to_string()));
        deleted?;

        if let Some(image_id) = &perma.image_id {
            self.images.collect_if_unreferenced(image_id).await;
        }
        info!("deleted service {}", service_id);
        Ok(())
    }

    /// Apply `update` to a service. Changes take effect on the next resume.
    pub async fn update_options(&self, service_id: &str, update: ServiceUpdate) -> Result<Perma> {
        if self.lock.is_locked(service_id) {
            return Err(Error::Conflict(format!(
                "service '{}' has a pending action",
                service_id
            )));
        }
        let guard = self.lock.lock(service_id, ACTION_UPDATE)?.clear_tag_on_release();

        let result: Result<Perma> = async {
            let mut perma = self.require_perma(service_id).await?;
            if let Some(env) = update.env {
                perma.env.extend(env);
            }
            if let Some(meta) = update.meta {
                perma.meta.extend(meta);
            }
            if let Some(ram) = update.ram {
                perma.ram = ram;
            }
            if let Some(cpu) = update.cpu {
                perma.cpu = cpu;
            }
            if let Some(disk) = update.disk {
                perma.disk = disk;
            }
            if let Some(network) = update.network {
                perma.network = network;
            }
            if let Ok(template) = self.templates.get(&perma.template_id) {
                template.validate_options(&perma.env)?;
            }
            self.db.save_perma(&perma).await?;
            Ok(perma)
        }
        .await;

        guard.release(result.as_ref().err().map(|e| e.to_string()));
        result
    }

    pub async fn get_service(&self, service_id: &str) -> Result<Perma> {
        self.require_perma(service_id).await
    }

    pub async fn list_services(&self, query: &ListQuery) -> Result<Vec<Perma>> {
        self.db
            .list(self.node_id(), query.page, query.page_size, query.meta.as_ref())
            .await
    }

    pub async fn count_services(&self) -> Result<u64> {
        self.db.count(self.node_id()).await
    }

    /// Error message of the last failed resume, cleared by a successful one.
    pub async fn last_power_error(&self, service_id: &str) -> Result<Option<String>> {
        self.require_perma(service_id).await?;
        self.db.get_service_meta(service_id, LAST_POWER_ERROR_KEY).await
    }

    pub async fn service_stats(&self, service_id: &str) -> Result<ContainerStat> {
        let session = self
            .db
            .get_session(service_id)
            .await?
            .ok_or_else(|| not_running(service_id))?;
        self.engine.stat(&session.container_id).await
    }

    pub async fn host_usage(&self) -> Result<HostUsage> {
        self.engine.host_usage().await
    }

    /// Stop every running service and the template watcher.
    pub async fn shutdown(&self) {
        info!("shutting down node {}", self.node_id());
        self.lock.set_stopping(true);
        self.watcher.stop();

        let stops = self.running_services().into_iter().map(|id| async move {
            if let Err(e) = self.stop_service(&id, false).await {
                warn!("failed to stop {} during shutdown: {}", id, e);
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Exit of a container the node did not ask to stop.
    pub(super) async fn handle_close(
        &self,
        service_id: &str,
        container_id: Option<&str>,
        exit_code: Option<i64>,
    ) {
        if is_requested_stop(self.lock.action_tag(service_id).as_deref()) {
            debug!("service {} exited after a requested stop", service_id);
            return;
        }
        // Let an in-flight resume finish persisting its session first
        self.lock.when_unlocked(service_id).await;
        if is_requested_stop(self.lock.action_tag(service_id).as_deref()) {
            return;
        }

        let session = match self.db.get_session(service_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("failed to load session of {}: {}", service_id, e);
                return;
            }
        };
        let current = match (session, container_id) {
            (Some(s), Some(cid)) => s.container_id == cid,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !current {
            debug!("close of a stale container for {}; ignoring", service_id);
            return;
        }

        warn!(
            "service {} exited unexpectedly (exit code {:?})",
            service_id, exit_code
        );
        self.events.pre_volume_deletion(service_id).await;
        if let Err(e) = self.db.delete_session(service_id).await {
            warn!("failed to delete session of {}: {}", service_id, e);
        }
        self.mark_stopped(service_id);

        let error = match exit_code {
            Some(0) => None,
            Some(code) => Some(format!("container exited with code {}", code)),
            None => Some("container exited".to_string()),
        };
        self.events.emit(LifecycleEvent::Stop {
            service_id: service_id.to_string(),
            error,
        });
    }
}

fn already_running(service_id: &str) -> Error {
    Error::Conflict(format!("service '{}' is already running", service_id))
}

fn not_running(service_id: &str) -> Error {
    Error::Conflict(format!("service '{}' is not running", service_id))
}

fn is_requested_stop(tag: Option<&str>) -> bool {
    matches!(tag, Some(ACTION_STOP) | Some(ACTION_FORCE_STOP))
}

fn run_options(perma: &Perma) -> RunOptions {
    RunOptions {
        port: perma.port,
        ports: perma.ports.clone(),
        ram: perma.ram,
        cpu: perma.cpu,
        disk: perma.disk,
        env: perma.env.clone(),
        network: perma.network,
    }
}
