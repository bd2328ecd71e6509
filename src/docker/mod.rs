//! Docker CLI plumbing used by the docker-backed container engine.
//!
//! Every `docker` invocation goes through [`DockerClient`]; this module adds the
//! environment probes the engine needs (daemon health, nested execution).

pub mod client;
pub mod error;

pub use client::{AttachedStream, BuildRequest, DockerClient, InspectedContainer, PsEntry};
pub use error::DockerError;

use std::path::Path;
use std::time::Duration;

/// Label put on every container, volume and network the node manages.
pub const MANAGED_LABEL: &str = "service-node.managed";
/// Label carrying the owning service id.
pub const SERVICE_LABEL: &str = "service-node.service";
/// Label carrying the template id an image or container was built from.
pub const TEMPLATE_LABEL: &str = "service-node.template";
/// Label carrying the volume a container was started with.
pub const VOLUME_LABEL: &str = "service-node.volume";

/// Whether this process runs inside a container itself.
///
/// Spawning build workers that shell out to docker is unreliable there (the
/// socket is usually bind-mounted and worker threads compete with the parent
/// runtime), so the engine builds inline instead.
pub fn is_nested_container() -> bool {
    if Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() {
        return true;
    }
    match std::fs::read_to_string("/proc/1/cgroup") {
        Ok(cgroup) => cgroup_indicates_container(&cgroup),
        Err(_) => false,
    }
}

fn cgroup_indicates_container(cgroup: &str) -> bool {
    cgroup
        .lines()
        .any(|line| line.contains("/docker/") || line.contains("/kubepods") || line.contains("/lxc/"))
}

/// Check Docker daemon health with retry and exponential backoff.
///
/// Backoff: 100ms, 200ms, 400ms ... capped at 2 seconds.
pub async fn check_daemon_with_retry(max_attempts: u32, total_timeout: Duration) -> bool {
    use tokio::time::{sleep, timeout};

    let client = DockerClient::new();
    let start = std::time::Instant::now();
    let mut delay = Duration::from_millis(100);

    for attempt in 1..=max_attempts {
        if start.elapsed() >= total_timeout {
            tracing::debug!("Docker daemon health check timeout after {:?}", start.elapsed());
            return false;
        }

        let remaining = total_timeout.saturating_sub(start.elapsed());
        match timeout(remaining, client.daemon_healthy(Duration::from_secs(2))).await {
            Ok(true) => {
                if attempt > 1 {
                    tracing::info!("Docker daemon became healthy after {} attempts", attempt);
                }
                return true;
            }
            Ok(false) | Err(_) => {
                if attempt < max_attempts {
                    tracing::debug!(
                        "Docker daemon health check attempt {}/{} failed, retrying in {:?}",
                        attempt,
                        max_attempts,
                        delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                } else {
                    tracing::warn!("Docker daemon unhealthy after {} attempts", max_attempts);
                }
            }
        }
    }

    false
}
