use crate::output::UserOutput;
use service_node::config::EngineKind;
use service_node::docker::check_daemon_with_retry;
use service_node::template::TemplateRegistry;
use service_node::NodeConfig;
use std::time::Duration;

pub async fn run_check(config: &NodeConfig, out: &dyn UserOutput) -> anyhow::Result<()> {
    let mut all_ok = true;

    out.progress("Config: ");
    config.validate()?;
    out.finish_progress(&format!("ok (node {})", config.node_id));

    match config.engine_kind()? {
        EngineKind::Docker => {
            out.progress("Docker daemon: ");
            if check_daemon_with_retry(3, Duration::from_secs(10)).await {
                out.finish_progress("Running");
            } else {
                out.finish_progress("Not running (start it with: sudo systemctl start docker)");
                all_ok = false;
            }
        }
    }

    out.progress("Templates: ");
    let registry = TemplateRegistry::new(config.templates_dir.clone(), config.no_template);
    match registry.list_ids() {
        Ok(ids) => {
            let broken: Vec<String> = ids
                .iter()
                .filter_map(|id| registry.get(id).err().map(|e| format!("{}: {}", id, e)))
                .collect();
            if broken.is_empty() {
                out.finish_progress(&format!("{} found", ids.len()));
            } else {
                out.finish_progress(&format!("{} invalid", broken.len()));
                for line in broken {
                    out.error(&format!("  {}", line));
                }
                all_ok = false;
            }
        }
        Err(e) => {
            out.finish_progress(&format!("unreadable ({})", e));
            all_ok = false;
        }
    }

    if !all_ok {
        anyhow::bail!("node check failed");
    }
    out.status("All checks passed.");
    Ok(())
}
