use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A created service. Exists from create until delete, whether or not a
/// container is running for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perma {
    pub service_id: String,
    pub template_id: String,
    pub node_id: String,
    /// Primary host port.
    pub port: u16,
    /// Additional host ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// MiB
    pub ram: u64,
    /// Cores
    pub cpu: f64,
    /// MiB
    pub disk: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Run on a dedicated isolated network.
    #[serde(default)]
    pub network: bool,
    /// Image bucket the service last ran on.
    #[serde(default)]
    pub image_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Perma {
    /// Primary and extra ports together.
    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(1 + self.ports.len());
        ports.push(self.port);
        ports.extend(self.ports.iter().copied());
        ports
    }
}

/// A container believed to be live for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub service_id: String,
    pub node_id: String,
    pub container_id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        service_id: impl Into<String>,
        node_id: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            node_id: node_id.into(),
            container_id: container_id.into(),
            started_at: Utc::now(),
        }
    }
}

/// A built image bucket. The id is stable across in-place rebuilds; the
/// content hash records which template content the current build came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub template_id: String,
    pub content_hash: String,
    pub build_options: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}
