//! Centralized Docker CLI client.
//!
//! All Docker CLI interactions go through `DockerClient`, which provides
//! consistent timeout handling, error mapping to [`DockerError`], and a single
//! point where `Command::new("docker")` is constructed.

use super::DockerError;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::process::{Output, Stdio};
use std::time::Duration;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(60);
const CREATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Subset of `docker inspect` output the engine relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectedContainer {
    pub id: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i64>,
    /// Named volumes mounted into the container.
    pub volumes: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Clone, PartialEq)]
pub struct PsEntry {
    pub id: String,
    pub name: String,
    pub state: String,
    pub ports: Vec<u16>,
    pub labels: HashMap<String, String>,
}

/// A live `docker attach` session: stdin carries commands, stdout/stderr
/// carry the container's output, and process exit signals container exit.
pub struct AttachedStream {
    pub child: tokio::process::Child,
    pub stdin: Option<tokio::process::ChildStdin>,
    pub stdout: Option<tokio::process::ChildStdout>,
    pub stderr: Option<tokio::process::ChildStderr>,
}

/// Arguments for `docker build` shared by the inline and worker paths.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl BuildRequest {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--quiet".to_string(),
            "--tag".to_string(),
            self.tag.clone(),
        ];
        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        // Context is read from stdin as a tar stream
        args.push("-".to_string());
        args
    }
}

/// Centralized client for Docker CLI operations.
///
/// Zero-sized; construct freely and thread through the engine.
#[derive(Debug, Clone)]
pub struct DockerClient;

impl DockerClient {
    pub fn new() -> Self {
        DockerClient
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker")
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(cmd_str, e)),
            Err(_) => Err(DockerError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("docker {}", args.join(" "));
            Err(DockerError::failed(cmd_str, &output))
        }
    }

    async fn run_stdout(&self, args: &[&str], timeout: Duration) -> Result<String, DockerError> {
        let output = self.run_success(args, timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Build an image from a tar build context streamed on stdin.
    ///
    /// Returns the image id printed by `docker build --quiet`.
    pub async fn build(&self, request: &BuildRequest, context: Vec<u8>) -> Result<String, DockerError> {
        use tokio::io::AsyncWriteExt;

        let args = request.args();
        let cmd_str = format!("docker build -t {}", request.tag);
        let mut child = tokio::process::Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&context)
                .await
                .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;
            // Dropping stdin closes the stream so docker starts building
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;
        parse_build_output(&cmd_str, &output)
    }

    /// Blocking variant of [`DockerClient::build`] for background build workers.
    pub fn build_blocking(&self, request: &BuildRequest, context: &[u8]) -> Result<String, DockerError> {
        let args = request.args();
        let cmd_str = format!("docker build -t {}", request.tag);
        let mut child = std::process::Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(context)
                .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;
        parse_build_output(&cmd_str, &output)
    }

    /// Remove an image tag. `Ok(false)` if it was already gone.
    pub async fn image_rm(&self, image: &str) -> Result<bool, DockerError> {
        let output = self.run(&["image", "rm", "-f", image], INSPECT_TIMEOUT).await?;
        if output.status.success() {
            return Ok(true);
        }
        match DockerError::failed("docker image rm", &output) {
            e if e.is_not_found() => Ok(false),
            e => Err(e),
        }
    }

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    /// Run a container in detached mode. Returns the container id.
    ///
    /// `args` holds everything after `docker run -d`.
    pub async fn run_detached(&self, args: &[String]) -> Result<String, DockerError> {
        let mut full: Vec<&str> = vec!["run", "-d"];
        full.extend(args.iter().map(String::as_str));
        let id = self.run_stdout(&full, CREATE_TIMEOUT).await?;
        if id.is_empty() {
            return Err(DockerError::parse("docker run", "empty container id"));
        }
        Ok(id)
    }

    /// Stop a container with a grace period. `Ok(false)` if it was not running.
    pub async fn stop(&self, container: &str, grace_secs: u32) -> Result<bool, DockerError> {
        let grace = grace_secs.to_string();
        let timeout = LIFECYCLE_TIMEOUT + Duration::from_secs(grace_secs as u64);
        let output = self.run(&["stop", "-t", &grace, container], timeout).await?;
        if output.status.success() {
            return Ok(true);
        }
        match DockerError::failed("docker stop", &output) {
            e if e.is_not_found() => Ok(false),
            e => Err(e),
        }
    }

    /// Kill a container (SIGKILL). `Ok(false)` if it was not running.
    pub async fn kill(&self, container: &str) -> Result<bool, DockerError> {
        let output = self.run(&["kill", container], LIFECYCLE_TIMEOUT).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Container already stopped or doesn't exist, not an error
        if stderr.contains("No such container") || stderr.contains("is not running") {
            return Ok(false);
        }
        Err(DockerError::failed("docker kill", &output))
    }

    /// Force-remove a container. Returns `Ok(())` if container doesn't exist.
    pub async fn rm_force(&self, container: &str) -> Result<(), DockerError> {
        let output = self.run(&["rm", "-f", container], INSPECT_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        match DockerError::failed("docker rm -f", &output) {
            e if e.is_not_found() => Ok(()),
            e => Err(e),
        }
    }

    /// Attach to a running container's stdio.
    ///
    /// `--sig-proxy=false` keeps signals sent to the attach process away from
    /// the container; the stream ends when the container exits.
    pub fn attach(&self, container: &str) -> Result<AttachedStream, DockerError> {
        let cmd_str = format!("docker attach {}", container);
        let mut child = tokio::process::Command::new("docker")
            .args(["attach", "--sig-proxy=false", container])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DockerError::exec_failed(cmd_str, e))?;

        Ok(AttachedStream {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Inspect a container. `Ok(None)` if it doesn't exist.
    pub async fn inspect(&self, container: &str) -> Result<Option<InspectedContainer>, DockerError> {
        let output = self
            .run(&["inspect", "--type=container", "--format={{json .}}", container], INSPECT_TIMEOUT)
            .await?;
        if !output.status.success() {
            return match DockerError::failed("docker inspect", &output) {
                e if e.is_not_found() => Ok(None),
                e => Err(e),
            };
        }
        let json = String::from_utf8_lossy(&output.stdout);
        parse_inspect(&json).map(Some)
    }

    /// List containers. `all` includes stopped ones; `filters` are `key=value` pairs.
    pub async fn ps(&self, all: bool, filters: &[String]) -> Result<Vec<PsEntry>, DockerError> {
        let mut args: Vec<&str> = vec!["ps", "--no-trunc", "--format", "{{json .}}"];
        if all {
            args.push("-a");
        }
        for filter in filters {
            args.push("--filter");
            args.push(filter);
        }
        let stdout = self.run_stdout(&args, INSPECT_TIMEOUT).await?;
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Create a named volume if it doesn't exist yet.
    pub async fn volume_ensure(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), DockerError> {
        if self.volume_mountpoint(name).await?.is_some() {
            return Ok(());
        }
        let label_args: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args: Vec<&str> = vec!["volume", "create"];
        for label in &label_args {
            args.push("--label");
            args.push(label);
        }
        args.push(name);
        self.run_success(&args, CREATE_TIMEOUT).await?;
        Ok(())
    }

    /// Host mountpoint of a volume, `None` if the volume doesn't exist.
    pub async fn volume_mountpoint(&self, name: &str) -> Result<Option<String>, DockerError> {
        let output = self
            .run(&["volume", "inspect", "--format", "{{.Mountpoint}}", name], INSPECT_TIMEOUT)
            .await?;
        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()));
        }
        match DockerError::failed("docker volume inspect", &output) {
            e if e.is_not_found() => Ok(None),
            e => Err(e),
        }
    }

    /// Force-remove a volume. `Ok(false)` if it didn't exist.
    pub async fn volume_rm(&self, name: &str) -> Result<bool, DockerError> {
        let output = self.run(&["volume", "rm", "-f", name], INSPECT_TIMEOUT).await?;
        if !output.status.success() {
            return Err(DockerError::failed("docker volume rm", &output));
        }
        // `-f` succeeds silently for missing volumes; the name is echoed only on removal
        Ok(!output.stdout.is_empty())
    }

    /// Names of volumes carrying `label`.
    pub async fn volume_ls(&self, label: &str) -> Result<Vec<String>, DockerError> {
        let filter = format!("label={}", label);
        let stdout = self
            .run_stdout(&["volume", "ls", "--filter", &filter, "--format", "{{.Name}}"], INSPECT_TIMEOUT)
            .await?;
        Ok(stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub async fn network_exists(&self, network: &str) -> Result<bool, DockerError> {
        let output = self
            .run(&["network", "inspect", "--format", "{{.Id}}", network], INSPECT_TIMEOUT)
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        match DockerError::failed("docker network inspect", &output) {
            e if e.is_not_found() => Ok(false),
            e => Err(e),
        }
    }

    /// Create a bridge network and return its id.
    pub async fn network_create(&self, name: &str, labels: &[(&str, &str)]) -> Result<String, DockerError> {
        let label_args: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args: Vec<&str> = vec!["network", "create", "--driver", "bridge"];
        for label in &label_args {
            args.push("--label");
            args.push(label);
        }
        args.push(name);
        self.run_stdout(&args, CREATE_TIMEOUT).await
    }

    /// Remove a network. `Ok(false)` if it didn't exist.
    pub async fn network_rm(&self, network: &str) -> Result<bool, DockerError> {
        let output = self.run(&["network", "rm", network], INSPECT_TIMEOUT).await?;
        if output.status.success() {
            return Ok(true);
        }
        match DockerError::failed("docker network rm", &output) {
            e if e.is_not_found() => Ok(false),
            e => Err(e),
        }
    }

    // ========================================================================
    // Daemon
    // ========================================================================

    /// Check if the Docker daemon is healthy.
    pub async fn daemon_healthy(&self, timeout: Duration) -> bool {
        match self.run(&["info", "--format", "{{.ServerVersion}}"], timeout).await {
            Ok(o) => o.status.success(),
            Err(_) => false,
        }
    }

    /// Docker's data root, used to measure free space for volumes.
    pub async fn root_dir(&self) -> Result<String, DockerError> {
        self.run_stdout(&["info", "--format", "{{.DockerRootDir}}"], INSPECT_TIMEOUT)
            .await
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_build_output(cmd_str: &str, output: &Output) -> Result<String, DockerError> {
    if !output.status.success() {
        return Err(DockerError::failed(cmd_str, output));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DockerError::parse(cmd_str, "no image id in build output"))
}

fn parse_inspect(json: &str) -> Result<InspectedContainer, DockerError> {
    let value: serde_json::Value = serde_json::from_str(json.trim())
        .map_err(|e| DockerError::parse("docker inspect", e.to_string()))?;

    let id = value
        .get("Id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DockerError::parse("docker inspect", "missing Id"))?
        .to_string();
    let state = value.get("State");
    let running = state
        .and_then(|s| s.get("Running"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let pid = state
        .and_then(|s| s.get("Pid"))
        .and_then(|v| v.as_u64())
        .filter(|p| *p > 0)
        .map(|p| p as u32);
    let exit_code = state.and_then(|s| s.get("ExitCode")).and_then(|v| v.as_i64());

    let volumes = value
        .get("Mounts")
        .and_then(|m| m.as_array())
        .map(|mounts| {
            mounts
                .iter()
                .filter(|m| m.get("Type").and_then(|t| t.as_str()) == Some("volume"))
                .filter_map(|m| m.get("Name").and_then(|n| n.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let labels = value
        .get("Config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(InspectedContainer {
        id,
        running,
        pid,
        exit_code,
        volumes,
        labels,
    })
}

fn parse_ps_line(line: &str) -> Result<PsEntry, DockerError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| DockerError::parse("docker ps", e.to_string()))?;
    let field = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    // Labels come back as a flat "k=v,k2=v2" string
    let labels = field("Labels")
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(PsEntry {
        id: field("ID"),
        name: field("Names"),
        state: field("State"),
        ports: parse_host_ports(&field("Ports")),
        labels,
    })
}

/// Extract published host ports from a `docker ps` Ports column, e.g.
/// `0.0.0.0:25565->25565/tcp, :::25565->25565/tcp`.
pub(crate) fn parse_host_ports(ports: &str) -> Vec<u16> {
    let mut found: Vec<u16> = ports
        .split(',')
        .filter_map(|binding| {
            let (host, _) = binding.trim().split_once("->")?;
            let port = host.rsplit(':').next()?;
            // Ranges look like 0.0.0.0:8000-8002
            match port.split_once('-') {
                Some((start, _)) => start.parse().ok(),
                None => port.parse().ok(),
            }
        })
        .collect();
    found.sort_unstable();
    found.dedup();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ports_are_parsed_and_deduplicated() {
        let ports = parse_host_ports("0.0.0.0:25565->25565/tcp, :::25565->25565/tcp, 0.0.0.0:8080->80/udp");
        assert_eq!(ports, vec![8080, 25565]);
        assert!(parse_host_ports("80/tcp").is_empty());
        assert!(parse_host_ports("").is_empty());
    }

    #[test]
    fn ps_line_parses_labels() {
        let line = r#"{"ID":"abc","Names":"svc","State":"running","Ports":"0.0.0.0:7000->7000/tcp","Labels":"service-node.managed=true,service-node.service=s1"}"#;
        let entry = parse_ps_line(line).unwrap();
        assert_eq!(entry.id, "abc");
        assert_eq!(entry.ports, vec![7000]);
        assert_eq!(entry.labels.get("service-node.service").map(String::as_str), Some("s1"));
    }

    #[test]
    fn inspect_extracts_named_volumes_only() {
        let json = r#"{
            "Id": "c1",
            "State": {"Running": true, "Pid": 4242, "ExitCode": 0},
            "Mounts": [
                {"Type": "volume", "Name": "svc-vol"},
                {"Type": "bind", "Source": "/tmp"}
            ],
            "Config": {"Labels": {"service-node.managed": "true"}}
        }"#;
        let inspected = parse_inspect(json).unwrap();
        assert!(inspected.running);
        assert_eq!(inspected.pid, Some(4242));
        assert_eq!(inspected.volumes, vec!["svc-vol".to_string()]);
    }

    #[test]
    fn build_args_are_rendered_before_stdin_marker() {
        let mut request = BuildRequest {
            tag: "img:1".into(),
            ..Default::default()
        };
        request.build_args.insert("VERSION".into(), "1.20".into());
        let args = request.args();
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.windows(2).any(|w| w[0] == "--build-arg" && w[1] == "VERSION=1.20"));
    }
}
