use crate::output::UserOutput;
use service_node::engine::TracingLayer;
use service_node::events::LifecycleEvent;
use service_node::{Node, NodeConfig};
use tokio::sync::broadcast::error::RecvError;

pub async fn run_serve(config: NodeConfig, ephemeral: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let node = Node::builder()
        .config(config)
        .layer(TracingLayer)
        .ephemeral(ephemeral)
        .build()
        .await?;

    let mut events = node.events().subscribe();
    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("dropped {} lifecycle event(s)", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = node.start().await?;
    out.status(&format!(
        "Node {} ready: {} service(s) running, {} stale session(s) closed, {} orphan(s) killed",
        node.node_id(),
        report.reattached.len(),
        report.closed.len(),
        report.orphans_killed.len()
    ));

    tokio::signal::ctrl_c().await?;
    out.status("Shutting down...");
    node.shutdown().await;
    log_events.abort();
    Ok(())
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Resume { service_id, error: None } => {
            tracing::info!("service {} resumed", service_id)
        }
        LifecycleEvent::Resume { service_id, error: Some(e) } => {
            tracing::warn!("service {} failed to resume: {}", service_id, e)
        }
        LifecycleEvent::Stop { service_id, error: None } => {
            tracing::info!("service {} stopped", service_id)
        }
        LifecycleEvent::Stop { service_id, error: Some(e) } => {
            tracing::warn!("service {} stopped: {}", service_id, e)
        }
        LifecycleEvent::RunningSetChanged { running } => {
            tracing::debug!("{} service(s) running", running.len())
        }
    }
}
