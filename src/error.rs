// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::docker::DockerError;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    #[diagnostic(
        code(node::validation),
        help("Check the template's required options and the request payload")
    )]
    Validation(String),

    #[error("Conflict: {0}")]
    #[diagnostic(code(node::conflict))]
    Conflict(String),

    #[error("Service not found: {0}")]
    #[diagnostic(code(node::service::not_found))]
    ServiceNotFound(String),

    #[error("Template not found: {0}")]
    #[diagnostic(
        code(node::template::not_found),
        help("Templates live in <templates_dir>/<id>/template.yaml")
    )]
    TemplateNotFound(String),

    #[error("Image not found: {0}")]
    #[diagnostic(code(node::image::not_found))]
    ImageNotFound(String),

    #[error("No content hash computed yet for template '{0}'")]
    #[diagnostic(
        code(node::template::hash_pending),
        help("Wait for the template watcher's initial scan before building images")
    )]
    HashPending(String),

    #[error("Build failed for template '{template}': {reason}")]
    #[diagnostic(code(node::image::build_failed))]
    Build { template: String, reason: String },

    #[error("Runtime error: {0}")]
    #[diagnostic(code(node::runtime::error))]
    Runtime(String),

    #[error("Docker error: {0}")]
    #[diagnostic(
        code(node::docker::error),
        help("Check that Docker is running with `docker ps`")
    )]
    Docker(#[from] DockerError),

    #[error("Port allocation failed: {0}")]
    #[diagnostic(
        code(node::port::allocation_failed),
        help("Widen the template's port range or stop services holding ports in it")
    )]
    PortAllocation(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(node::config::error))]
    Config(String),

    #[error("Persistence error: {0}")]
    #[diagnostic(code(node::database::persist))]
    Persistence(String),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(node::database::error),
        help("See recovery suggestions based on the specific error type")
    )]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(node::filesystem::error))]
    Filesystem(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP-style status code for the outer API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::ServiceNotFound(_)
            | Error::TemplateNotFound(_)
            | Error::ImageNotFound(_)
            | Error::HashPending(_) => 404,
            Error::Conflict(_) => 409,
            _ => 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Conflict(msg) if msg.contains("busy") => Some(
                "Another lifecycle operation is in progress for this service; retry once it finishes."
                    .to_string(),
            ),
            Error::HashPending(id) => Some(format!(
                "Template '{}' has not been hashed yet. Check that its directory is readable.",
                id
            )),
            Error::Docker(_) => Some("Check that Docker is running: docker ps".to_string()),
            Error::Config(_) => Some(
                "Validate your node configuration with: noded check".to_string(),
            ),
            Error::Database(e) => {
                // tokio_rusqlite wraps the rusqlite error opaquely, so match on text.
                let err_str = e.to_string();
                if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                    Some(
                        "Another noded instance may be using this state directory.".to_string(),
                    )
                } else if err_str.contains("malformed") || err_str.contains("SQLITE_CORRUPT") {
                    Some(
                        "Database corrupted. Back up node.db and run `sqlite3 node.db '.recover'`."
                            .to_string(),
                    )
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
