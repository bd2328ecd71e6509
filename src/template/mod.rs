//! Templates: named build recipes plus the settings services are created from.
//!
//! Each template is a directory under the node's `templates_dir`:
//!
//! ```text
//! templates/
//!   minecraft/
//!     template.yaml     # settings (see TemplateSettings)
//!     Dockerfile        # build context
//!     .buildignore      # optional ignore list
//! ```

mod hash;
mod ignore;

pub use hash::hash_directory;
pub(crate) use hash::collect_files;
pub use ignore::{IgnoreList, IGNORE_FILE_NAME};

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SETTINGS_FILE_NAME: &str = "template.yaml";

/// Template id used for every service in no-template mode.
pub const NO_TEMPLATE_ID: &str = "default";

/// Meta key holding the command that asks a service to shut down cleanly.
pub const STOP_CMD_KEY: &str = "stopCmd";

/// Inclusive host port range services of a template are allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    /// Additional ports allocated next to the primary one.
    #[serde(default)]
    pub extra: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 20999,
            extra: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefaults {
    /// MiB
    #[serde(default = "default_ram")]
    pub ram: u64,
    /// Cores, fractional allowed
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    /// MiB
    #[serde(default = "default_disk")]
    pub disk: u64,
}

fn default_ram() -> u64 {
    1024
}

fn default_cpu() -> f64 {
    1.0
}

fn default_disk() -> u64 {
    4096
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            ram: default_ram(),
            cpu: default_cpu(),
            disk: default_disk(),
        }
    }
}

/// Environment options a template accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionSchema {
    #[serde(default)]
    pub required: Vec<String>,
    /// Optional keys with their defaults.
    #[serde(default)]
    pub optional: BTreeMap<String, String>,
}

/// Parsed `template.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default)]
    pub resources: ResourceDefaults,
    #[serde(default)]
    pub options: OptionSchema,
    /// Option keys that are passed as build arguments and so select the image bucket.
    #[serde(default)]
    pub build_args: Vec<String>,
    /// Default service meta; must carry `stopCmd`.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            name: NO_TEMPLATE_ID.to_string(),
            description: String::new(),
            ports: PortRange::default(),
            resources: ResourceDefaults::default(),
            options: OptionSchema::default(),
            build_args: Vec::new(),
            meta: BTreeMap::from([(STOP_CMD_KEY.to_string(), "stop".to_string())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: String,
    pub settings: TemplateSettings,
    /// Build context root.
    pub dir: PathBuf,
}

impl Template {
    pub fn ignore_list(&self) -> Result<IgnoreList> {
        Ok(IgnoreList::load(&self.dir)?)
    }

    pub fn stop_cmd(&self) -> Option<&str> {
        self.settings.meta.get(STOP_CMD_KEY).map(String::as_str)
    }

    /// Check `env` against the option schema. Unknown keys are allowed.
    pub fn validate_options(&self, env: &BTreeMap<String, String>) -> Result<()> {
        let missing: Vec<&str> = self
            .settings
            .options
            .required
            .iter()
            .filter(|key| env.get(*key).map_or(true, |v| v.is_empty()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "template '{}' requires option(s): {}",
                self.id,
                missing.join(", ")
            )))
        }
    }

    /// Environment with optional defaults filled in under explicit values.
    pub fn resolve_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut resolved = self.settings.options.optional.clone();
        resolved.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        resolved
    }

    /// The build options selecting this service's image bucket.
    pub fn build_options(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let resolved = self.resolve_env(env);
        self.settings
            .build_args
            .iter()
            .filter_map(|key| resolved.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }
}

/// Loads templates from disk and caches them until invalidated.
pub struct TemplateRegistry {
    root: PathBuf,
    no_template: bool,
    cache: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateRegistry {
    pub fn new(root: impl Into<PathBuf>, no_template: bool) -> Self {
        Self {
            root: root.into(),
            no_template,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_no_template(&self) -> bool {
        self.no_template
    }

    /// Directory of a template's build context.
    pub fn template_dir(&self, id: &str) -> PathBuf {
        if self.no_template {
            self.root.clone()
        } else {
            self.root.join(id)
        }
    }

    /// Map a requested id onto the id templates are stored under.
    pub fn canonical_id<'a>(&self, id: &'a str) -> &'a str {
        if self.no_template {
            NO_TEMPLATE_ID
        } else {
            id
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Template>> {
        let id = self.canonical_id(id);
        if let Some(template) = self.cache.read().get(id) {
            return Ok(Arc::clone(template));
        }

        let template = Arc::new(self.load(id)?);
        self.cache
            .write()
            .insert(id.to_string(), Arc::clone(&template));
        Ok(template)
    }

    /// Ids of every template directory that carries a settings file.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        if self.no_template {
            return Ok(vec![NO_TEMPLATE_ID.to_string()]);
        }
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(SETTINGS_FILE_NAME).is_file() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn invalidate(&self, id: &str) {
        let id = self.canonical_id(id);
        if self.cache.write().remove(id).is_some() {
            tracing::debug!("Invalidated cached template '{}'", id);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }

    fn load(&self, id: &str) -> Result<Template> {
        if !self.no_template && (id.is_empty() || id.contains('/') || id.contains("..")) {
            return Err(Error::TemplateNotFound(id.to_string()));
        }
        let dir = self.template_dir(id);
        let settings_path = dir.join(SETTINGS_FILE_NAME);

        let settings = match std::fs::read_to_string(&settings_path) {
            Ok(content) => serde_yaml::from_str::<TemplateSettings>(&content).map_err(|e| {
                Error::Validation(format!(
                    "invalid {} for template '{}': {}",
                    SETTINGS_FILE_NAME, id, e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.no_template {
                    TemplateSettings::default()
                } else {
                    return Err(Error::TemplateNotFound(id.to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        };

        if settings.ports.start == 0 || settings.ports.start > settings.ports.end {
            return Err(Error::Validation(format!(
                "template '{}' has an invalid port range {}-{}",
                id, settings.ports.start, settings.ports.end
            )));
        }

        Ok(Template {
            id: id.to_string(),
            name: settings.name.clone(),
            description: settings.description.clone(),
            settings,
            dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_template(root: &Path, id: &str, yaml: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SETTINGS_FILE_NAME), yaml).unwrap();
        fs::write(dir.join("Dockerfile"), "FROM alpine\n").unwrap();
    }

    const MINECRAFT: &str = r#"
name: Minecraft
description: Vanilla server
ports: { start: 25565, end: 25600 }
resources: { ram: 2048, cpu: 2.0, disk: 8192 }
options:
  required: [EULA]
  optional: { VERSION: latest }
build_args: [VERSION]
meta: { stopCmd: stop }
"#;

    #[test]
    fn loads_and_caches_templates() {
        let root = tempfile::tempdir().unwrap();
        write_template(root.path(), "mc", MINECRAFT);
        let registry = TemplateRegistry::new(root.path(), false);

        let template = registry.get("mc").unwrap();
        assert_eq!(template.name, "Minecraft");
        assert_eq!(template.settings.ports.start, 25565);
        assert_eq!(template.stop_cmd(), Some("stop"));

        // Cached: deleting the file does not affect subsequent lookups
        fs::remove_file(root.path().join("mc").join(SETTINGS_FILE_NAME)).unwrap();
        assert!(registry.get("mc").is_ok());
        registry.invalidate("mc");
        assert!(matches!(registry.get("mc"), Err(Error::TemplateNotFound(_))));
    }

    #[test]
    fn required_options_are_enforced() {
        let root = tempfile::tempdir().unwrap();
        write_template(root.path(), "mc", MINECRAFT);
        let template = TemplateRegistry::new(root.path(), false).get("mc").unwrap();

        let err = template.validate_options(&BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("EULA"));
        let env = BTreeMap::from([("EULA".to_string(), "true".to_string())]);
        template.validate_options(&env).unwrap();
    }

    #[test]
    fn build_options_pick_build_args_with_defaults() {
        let root = tempfile::tempdir().unwrap();
        write_template(root.path(), "mc", MINECRAFT);
        let template = TemplateRegistry::new(root.path(), false).get("mc").unwrap();

        let env = BTreeMap::from([("EULA".to_string(), "true".to_string())]);
        assert_eq!(
            template.build_options(&env),
            BTreeMap::from([("VERSION".to_string(), "latest".to_string())])
        );
        let env = BTreeMap::from([("VERSION".to_string(), "1.20".to_string())]);
        assert_eq!(template.build_options(&env)["VERSION"], "1.20");
    }

    #[test]
    fn no_template_mode_synthesizes_default() {
        let root = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::new(root.path(), true);
        let template = registry.get("anything").unwrap();
        assert_eq!(template.id, NO_TEMPLATE_ID);
        assert_eq!(template.dir, root.path());
        assert_eq!(template.stop_cmd(), Some("stop"));
        assert_eq!(registry.list_ids().unwrap(), vec![NO_TEMPLATE_ID.to_string()]);
    }

    #[test]
    fn list_ids_skips_directories_without_settings() {
        let root = tempfile::tempdir().unwrap();
        write_template(root.path(), "b", MINECRAFT);
        write_template(root.path(), "a", MINECRAFT);
        fs::create_dir_all(root.path().join("scratch")).unwrap();
        let registry = TemplateRegistry::new(root.path(), false);
        assert_eq!(registry.list_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::new(root.path(), false);
        assert!(registry.get("../etc").is_err());
    }
}
