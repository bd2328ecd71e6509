use super::NodeConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "node.yaml";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find `node.yaml` starting from the current directory and walking up.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        for name in [CONFIG_FILE_NAME, "node.yml"] {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(format!(
            "Could not find {} in current directory or any parent",
            CONFIG_FILE_NAME
        )))
    }

    /// Load and validate config from a file path.
    ///
    /// A relative `templates_dir` / `state_dir` is resolved against the
    /// directory containing the config file.
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<NodeConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut config = self.parse_config(&content)?;
        if let Some(base) = path.parent() {
            if config.templates_dir.is_relative() {
                config.templates_dir = base.join(&config.templates_dir);
            }
            if let Some(state_dir) = config.state_dir.as_mut() {
                if state_dir.is_relative() {
                    *state_dir = base.join(&*state_dir);
                }
            }
        }
        Ok(config)
    }

    pub fn parse_config(&self, content: &str) -> Result<NodeConfig> {
        let config: NodeConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
