//! [`ContainerEngine`] backed by the `docker` CLI.
//!
//! Each running container has one `docker attach` child process. Its stdin
//! carries [`ContainerEngine::cmd`] input, its stdout/stderr feed the
//! listener, and its exit is how an out-of-band container exit is noticed.

use super::{
    pack_build_context, BuildOptions, ContainerEngine, ContainerFilter, ContainerInfo,
    ContainerStat, CpuTracker, EngineListener, HostUsage, MetaStore, ProcSample, RunOptions,
};
use crate::config::NodeConfig;
use crate::docker::{
    AttachedStream, BuildRequest, DockerClient, PsEntry, MANAGED_LABEL, SERVICE_LABEL,
    TEMPLATE_LABEL, VOLUME_LABEL,
};
use crate::error::{Error, Result};
use crate::template::IgnoreList;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Service meta key holding the isolated network id.
const NETWORK_META_KEY: &str = "network";
const VOLUME_MOUNT_PATH: &str = "/data";
const DEFAULT_IMAGE_PREFIX: &str = "svc-img";

type SharedStdin = Arc<tokio::sync::Mutex<ChildStdin>>;

#[derive(Debug, Clone)]
pub struct DockerEngineOptions {
    pub image_prefix: String,
    pub network_prefix: String,
    pub stop_grace_secs: u32,
    /// Run builds on a blocking worker thread instead of the calling task.
    pub build_in_background: bool,
    pub storage_quota: bool,
}

impl DockerEngineOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            network_prefix: config.network_prefix.clone(),
            stop_grace_secs: config.stop_grace_secs,
            build_in_background: config.build_in_background(),
            storage_quota: config.storage_quota,
        }
    }
}

impl Default for DockerEngineOptions {
    fn default() -> Self {
        Self {
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            network_prefix: "svc-net".to_string(),
            stop_grace_secs: 10,
            build_in_background: true,
            storage_quota: false,
        }
    }
}

pub struct DockerEngine {
    client: DockerClient,
    options: DockerEngineOptions,
    /// Live attachments keyed by container id.
    attachments: Arc<Mutex<HashMap<String, Option<SharedStdin>>>>,
    cpu: CpuTracker,
}

impl DockerEngine {
    pub fn new(options: DockerEngineOptions) -> Self {
        Self {
            client: DockerClient::new(),
            options,
            attachments: Arc::new(Mutex::new(HashMap::new())),
            cpu: CpuTracker::new(),
        }
    }

    pub fn is_attached(&self, container_id: &str) -> bool {
        self.attachments.lock().contains_key(container_id)
    }

    fn container_name(service_id: &str) -> String {
        format!("svc-{}", service_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_args(
        &self,
        name: &str,
        service_id: &str,
        template_id: &str,
        image_id: &str,
        volume_id: &str,
        options: &RunOptions,
        network: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("{}=true", MANAGED_LABEL),
            "--label".to_string(),
            format!("{}={}", SERVICE_LABEL, service_id),
            "--label".to_string(),
            format!("{}={}", TEMPLATE_LABEL, template_id),
            "--label".to_string(),
            format!("{}={}", VOLUME_LABEL, volume_id),
            "-v".to_string(),
            format!("{}:{}", volume_id, VOLUME_MOUNT_PATH),
        ];

        if options.ram > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}m", options.ram));
        }
        if options.cpu > 0.0 {
            args.push("--cpus".to_string());
            args.push(format!("{}", options.cpu));
        }
        if self.options.storage_quota && options.disk > 0 {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}m", options.disk));
        }

        for port in std::iter::once(options.port).chain(options.ports.iter().copied()) {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port, port));
        }

        args.push("-e".to_string());
        args.push(format!("PORT={}", options.port));
        for (key, value) in &options.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(network) = network {
            args.push("--network".to_string());
            args.push(network.to_string());
        }

        args.push(image_id.to_string());
        args
    }

    /// Reuse the service's isolated network, creating it on first use.
    async fn ensure_network(&self, meta: &dyn MetaStore) -> Result<String> {
        if let Some(id) = meta.get(NETWORK_META_KEY).await? {
            if self.client.network_exists(&id).await? {
                return Ok(id);
            }
        }

        let name = format!("{}-{}", self.options.network_prefix, meta.service_id());
        let id = if self.client.network_exists(&name).await? {
            name
        } else {
            let labels = [(MANAGED_LABEL, "true"), (SERVICE_LABEL, meta.service_id())];
            self.client.network_create(&name, &labels).await?
        };
        meta.set(NETWORK_META_KEY, Some(&id)).await?;
        debug!("service '{}' uses network {}", meta.service_id(), id);
        Ok(id)
    }

    async fn release_network(&self, meta: &dyn MetaStore) {
        let id = match meta.get(NETWORK_META_KEY).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to read network of '{}': {}", meta.service_id(), e);
                return;
            }
        };
        if let Err(e) = self.client.network_rm(&id).await {
            warn!("failed to remove network {}: {}", id, e);
            return;
        }
        if let Err(e) = meta.set(NETWORK_META_KEY, None).await {
            warn!("failed to clear network of '{}': {}", meta.service_id(), e);
        }
    }

    async fn after_stop(&self, container_id: &str, meta: &dyn MetaStore) {
        if let Err(e) = self.client.rm_force(container_id).await {
            warn!("failed to remove container {}: {}", container_id, e);
        }
        self.cpu.forget(container_id);
        self.release_network(meta).await;
    }

    /// Start the `docker attach` child for `container_id` and the task that
    /// watches it. The task fires `listener.on_close` exactly once.
    fn attach(&self, container_id: &str, listener: Arc<dyn EngineListener>) -> Result<()> {
        let AttachedStream {
            mut child,
            stdin,
            stdout,
            stderr,
        } = self.client.attach(container_id)?;

        self.attachments.lock().insert(
            container_id.to_string(),
            stdin.map(|s| Arc::new(tokio::sync::Mutex::new(s))),
        );

        let readers: Vec<JoinHandle<()>> = [
            stdout.map(|s| forward_lines(s, Arc::clone(&listener))),
            stderr.map(|s| forward_lines(s, Arc::clone(&listener))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let attachments = Arc::clone(&self.attachments);
        let client = self.client.clone();
        let container_id = container_id.to_string();
        listener.on_state_message("attached");

        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                debug!("docker attach for {} failed: {}", container_id, e);
            }
            for reader in readers {
                let _ = reader.await;
            }
            attachments.lock().remove(&container_id);

            let exit_code = match client.inspect(&container_id).await {
                Ok(Some(info)) if info.running => {
                    warn!(
                        "lost attachment to {} while it is still running; killing it",
                        container_id
                    );
                    let _ = client.kill(&container_id).await;
                    None
                }
                Ok(Some(info)) => info.exit_code,
                Ok(None) => None,
                Err(e) => {
                    debug!("inspect after exit of {} failed: {}", container_id, e);
                    None
                }
            };
            if let Err(e) = client.rm_force(&container_id).await {
                debug!("cleanup of {} failed: {}", container_id, e);
            }

            listener.on_state_message("closed");
            listener.on_close(exit_code).await;
        });

        Ok(())
    }

    fn build_context(dir: &Path) -> Result<Vec<u8>> {
        let ignore = IgnoreList::load(dir)?;
        Ok(pack_build_context(dir, &ignore)?)
    }
}

fn forward_lines<R>(stream: R, listener: Arc<dyn EngineListener>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            listener.on_message(&line);
        }
    })
}

fn container_info(entry: PsEntry) -> ContainerInfo {
    ContainerInfo {
        running: entry.state == "running",
        service_id: entry.labels.get(SERVICE_LABEL).cloned(),
        volume: entry.labels.get(VOLUME_LABEL).cloned(),
        ports: entry.ports,
        id: entry.id,
    }
}

fn build_error(dir: &Path, reason: impl std::fmt::Display) -> Error {
    let template = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string());
    Error::Build {
        template,
        reason: reason.to_string(),
    }
}

/// Total size of regular files under `path`, not following symlinks.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.path().symlink_metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        })
        .sum()
}

fn free_bytes(path: &str) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::Runtime(format!("statvfs {} failed: {}", path, e)))?;
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(
        &self,
        image_id: Option<&str>,
        build_dir: &Path,
        options: &BuildOptions,
    ) -> Result<String> {
        let tag = match image_id {
            Some(id) => id.to_string(),
            None => format!("{}-{}", self.options.image_prefix, Uuid::new_v4().simple()),
        };
        let request = BuildRequest {
            tag: tag.clone(),
            build_args: options.clone(),
            labels: BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        };
        let dir: PathBuf = build_dir.to_path_buf();
        let started = Instant::now();

        let built: Result<String> = if self.options.build_in_background {
            let client = self.client.clone();
            let worker_dir = dir.clone();
            tokio::task::spawn_blocking(move || -> Result<String> {
                let context = Self::build_context(&worker_dir)?;
                Ok(client.build_blocking(&request, &context)?)
            })
            .await
            .map_err(|e| build_error(&dir, format!("build worker failed: {}", e)))?
        } else {
            match Self::build_context(&dir) {
                Ok(context) => self.client.build(&request, context).await.map_err(Error::from),
                Err(e) => Err(e),
            }
        };
        let digest = built.map_err(|e| build_error(&dir, e))?;

        info!(
            "built image {} ({}) in {:.1}s",
            tag,
            digest,
            started.elapsed().as_secs_f64()
        );
        Ok(tag)
    }

    async fn remove_image(&self, image_id: &str) -> Result<bool> {
        Ok(self.client.image_rm(image_id).await?)
    }

    async fn run(
        &self,
        template_id: &str,
        image_id: &str,
        volume_id: &str,
        options: &RunOptions,
        meta: Arc<dyn MetaStore>,
        listener: Arc<dyn EngineListener>,
    ) -> Result<String> {
        let service_id = meta.service_id().to_string();
        self.client
            .volume_ensure(volume_id, &[(MANAGED_LABEL, "true"), (SERVICE_LABEL, service_id.as_str())])
            .await?;

        let network = if options.network {
            Some(self.ensure_network(meta.as_ref()).await?)
        } else {
            None
        };

        let name = Self::container_name(&service_id);
        // A container left behind by a crash would block the name
        self.client.rm_force(&name).await?;

        let args = self.run_args(
            &name,
            &service_id,
            template_id,
            image_id,
            volume_id,
            options,
            network.as_deref(),
        );
        let container_id = self.client.run_detached(&args).await?;
        listener.on_state_message("started");

        if let Err(e) = self.attach(&container_id, listener) {
            let _ = self.client.rm_force(&container_id).await;
            return Err(e);
        }
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool> {
        let stopped = self
            .client
            .stop(container_id, self.options.stop_grace_secs)
            .await?;
        self.after_stop(container_id, meta).await;
        Ok(stopped)
    }

    async fn kill(&self, container_id: &str, meta: &dyn MetaStore) -> Result<bool> {
        let killed = self.client.kill(container_id).await?;
        self.after_stop(container_id, meta).await;
        Ok(killed)
    }

    async fn reattach(&self, container_id: &str, listener: Arc<dyn EngineListener>) -> Result<()> {
        if self.is_attached(container_id) {
            return Ok(());
        }
        match self.client.inspect(container_id).await? {
            Some(info) if info.running => self.attach(container_id, listener),
            other => {
                let exit_code = other.as_ref().and_then(|info| info.exit_code);
                if other.is_some() {
                    let _ = self.client.rm_force(container_id).await;
                }
                listener.on_close(exit_code).await;
                Err(Error::Runtime(format!(
                    "container {} is not running",
                    container_id
                )))
            }
        }
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        Ok(self.client.volume_rm(volume_id).await?)
    }

    async fn cmd(&self, container_id: &str, text: &str) -> Result<bool> {
        let stdin = self.attachments.lock().get(container_id).cloned().flatten();
        let Some(stdin) = stdin else {
            return Ok(false);
        };
        let mut stdin = stdin.lock().await;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(true)
    }

    async fn attached_volume(&self, container_id: &str) -> Result<Option<String>> {
        Ok(self.client.inspect(container_id).await?.and_then(|info| {
            info.labels
                .get(VOLUME_LABEL)
                .cloned()
                .or_else(|| info.volumes.into_iter().next())
        }))
    }

    async fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<ContainerInfo>> {
        let mut filters = vec![format!("label={}", MANAGED_LABEL)];
        if let Some(service_id) = filter.and_then(|f| f.service_id.as_deref()) {
            filters.push(format!("label={}={}", SERVICE_LABEL, service_id));
        }
        let all = !filter.is_some_and(|f| f.running_only);
        let entries = self.client.ps(all, &filters).await?;
        Ok(entries.into_iter().map(container_info).collect())
    }

    async fn list_attached_ports(&self) -> Result<HashSet<u16>> {
        let entries = self.client.ps(false, &[]).await?;
        Ok(entries.into_iter().flat_map(|e| e.ports).collect())
    }

    async fn stat(&self, container_id: &str) -> Result<ContainerStat> {
        let info = self
            .client
            .inspect(container_id)
            .await?
            .ok_or_else(|| Error::Runtime(format!("container {} not found", container_id)))?;
        let pid = info
            .pid
            .filter(|pid| info.running && *pid > 0)
            .ok_or_else(|| Error::Runtime(format!("container {} is not running", container_id)))?;
        let sample = ProcSample::read(pid)
            .await
            .ok_or_else(|| Error::Runtime(format!("no /proc entry for pid {}", pid)))?;

        Ok(ContainerStat {
            container_id: container_id.to_string(),
            service_id: info.labels.get(SERVICE_LABEL).cloned(),
            cpu_percent: self.cpu.percent(container_id, sample.cpu_ticks, Instant::now()),
            memory_bytes: sample.rss_bytes,
        })
    }

    async fn stat_all(&self) -> Result<Vec<ContainerStat>> {
        let mut stats = Vec::new();
        for container in self.list_running().await? {
            match self.stat(&container.id).await {
                Ok(stat) => stats.push(stat),
                Err(e) => debug!("skipping stats for {}: {}", container.id, e),
            }
        }
        Ok(stats)
    }

    async fn host_usage(&self) -> Result<HostUsage> {
        let root = self.client.root_dir().await?;
        let disk_free = free_bytes(&root)?;

        let mut mountpoints = Vec::new();
        for volume in self.client.volume_ls(MANAGED_LABEL).await? {
            if let Some(mountpoint) = self.client.volume_mountpoint(&volume).await? {
                mountpoints.push(PathBuf::from(mountpoint));
            }
        }
        let disk_used = tokio::task::spawn_blocking(move || {
            mountpoints.iter().map(|p| dir_size(p)).sum::<u64>()
        })
        .await
        .map_err(|e| Error::Runtime(format!("disk usage worker failed: {}", e)))?;

        Ok(HostUsage {
            disk_used,
            disk_free,
        })
    }
}
