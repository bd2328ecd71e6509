use crate::output::UserOutput;
use service_node::image::TemplateHashes;
use service_node::template::TemplateRegistry;
use service_node::watch::TemplateWatcher;
use service_node::NodeConfig;
use std::sync::Arc;

pub async fn run_templates(config: &NodeConfig, out: &dyn UserOutput) -> anyhow::Result<()> {
    let registry = Arc::new(TemplateRegistry::new(
        config.templates_dir.clone(),
        config.no_template,
    ));
    let watcher = TemplateWatcher::new(Arc::clone(&registry), config.watch_debounce());
    watcher.initial_scan().await?;

    let ids = registry.list_ids()?;
    if ids.is_empty() {
        out.warning(&format!(
            "No templates found under {}",
            config.templates_dir.display()
        ));
        return Ok(());
    }

    for id in ids {
        match registry.get(&id) {
            Ok(template) => {
                let hash = watcher
                    .template_hash(&id)
                    .map(|h| h[..12.min(h.len())].to_string())
                    .unwrap_or_else(|_| "-".to_string());
                out.status(&format!("{:<24} {:<12} {}", id, hash, template.name));
            }
            Err(e) => out.error(&format!("{:<24} invalid: {}", id, e)),
        }
    }
    Ok(())
}
