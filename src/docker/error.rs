use std::time::Duration;
use thiserror::Error;

/// Structured error type for Docker CLI invocations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Timed out running '{command}' (exceeded {} seconds)", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' failed{}: {stderr}", .exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("Failed to execute '{command}': {source}")]
    ExecFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Container, volume, network or image is gone ("No such ..." on stderr).
    #[error("No such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Unexpected docker output from '{command}': {detail}")]
    Parse { command: String, detail: String },

    #[error("Docker daemon is not responding")]
    DaemonUnavailable,
}

impl DockerError {
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        DockerError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Build a failure from process output, recognising "No such ..." as [`DockerError::NotFound`].
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Self::from_stderr(cmd, stderr, output.status.code())
    }

    pub fn from_stderr(cmd: impl Into<String>, stderr: String, exit_code: Option<i32>) -> Self {
        for kind in ["container", "volume", "network", "image", "object"] {
            let marker = format!("No such {}:", kind);
            if let Some(pos) = stderr.find(&marker) {
                let name = stderr[pos + marker.len()..].trim().to_string();
                return DockerError::NotFound { kind, name };
            }
        }
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code,
        }
    }

    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        DockerError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn parse(cmd: impl Into<String>, detail: impl Into<String>) -> Self {
        DockerError::Parse {
            command: cmd.into(),
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::NotFound { .. })
    }
}
