//! Lifecycle event fan-out.
//!
//! Notification events go out over a `tokio::sync::broadcast` channel and are
//! fire-and-forget; slow subscribers lag rather than block the node.
//! `PreVolumeDeletion` is different: it runs registered hooks and awaits them,
//! so a hook can copy data out of a volume before it disappears.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A resume finished; `error` is set if it failed.
    Resume {
        service_id: String,
        error: Option<String>,
    },
    /// A stop finished or the container exited on its own.
    Stop {
        service_id: String,
        error: Option<String>,
    },
    /// The set of running services changed.
    RunningSetChanged { running: Vec<String> },
}

impl LifecycleEvent {
    pub fn service_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::Resume { service_id, .. } | LifecycleEvent::Stop { service_id, .. } => {
                Some(service_id)
            }
            LifecycleEvent::RunningSetChanged { .. } => None,
        }
    }
}

/// Awaited before a service's volume is deleted.
#[async_trait]
pub trait PreVolumeDeletionHook: Send + Sync {
    async fn before_volume_deletion(&self, service_id: &str) -> Result<()>;
}

pub struct EventHub {
    tx: broadcast::Sender<LifecycleEvent>,
    hooks: RwLock<Vec<Arc<dyn PreVolumeDeletionHook>>>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn add_pre_volume_deletion_hook(&self, hook: Arc<dyn PreVolumeDeletionHook>) {
        self.hooks.write().push(hook);
    }

    /// Run every hook in registration order. Hook failures are logged and do
    /// not prevent the deletion.
    pub async fn pre_volume_deletion(&self, service_id: &str) {
        let hooks: Vec<_> = self.hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.before_volume_deletion(service_id).await {
                tracing::warn!(
                    "pre-volume-deletion hook failed for '{}': {}",
                    service_id,
                    e
                );
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl PreVolumeDeletionHook for Counting {
        async fn before_volume_deletion(&self, _service_id: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PreVolumeDeletionHook for Failing {
        async fn before_volume_deletion(&self, service_id: &str) -> Result<()> {
            Err(Error::Runtime(format!("cannot back up {}", service_id)))
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(LifecycleEvent::Resume {
            service_id: "a".into(),
            error: None,
        });
        hub.emit(LifecycleEvent::Stop {
            service_id: "a".into(),
            error: None,
        });

        assert!(matches!(rx.recv().await.unwrap(), LifecycleEvent::Resume { .. }));
        let stop = rx.recv().await.unwrap();
        assert_eq!(stop.service_id(), Some("a"));
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_the_rest() {
        let hub = EventHub::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        hub.add_pre_volume_deletion_hook(Arc::new(Failing));
        hub.add_pre_volume_deletion_hook(counter.clone());

        hub.pre_volume_deletion("svc").await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventHub::new().emit(LifecycleEvent::RunningSetChanged { running: vec![] });
    }
}
