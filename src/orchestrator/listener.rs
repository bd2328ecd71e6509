use super::Node;
use crate::engine::EngineListener;
use async_trait::async_trait;
use std::sync::{OnceLock, Weak};

/// Engine callbacks for one service's container.
pub(crate) struct ServiceListener {
    node: Weak<Node>,
    service_id: String,
    /// Set once the engine has reported the container id.
    container_id: OnceLock<String>,
}

impl ServiceListener {
    pub(super) fn new(node: Weak<Node>, service_id: &str) -> Self {
        Self {
            node,
            service_id: service_id.to_string(),
            container_id: OnceLock::new(),
        }
    }

    pub(super) fn bind_container(&self, container_id: &str) {
        let _ = self.container_id.set(container_id.to_string());
    }
}

#[async_trait]
impl EngineListener for ServiceListener {
    fn on_state_message(&self, message: &str) {
        tracing::debug!(service = %self.service_id, "{}", message);
    }

    fn on_message(&self, message: &str) {
        tracing::trace!(service = %self.service_id, "{}", message);
    }

    async fn on_close(&self, exit_code: Option<i64>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        node.handle_close(&self.service_id, self.container_id.get().map(String::as_str), exit_code)
            .await;
    }
}
