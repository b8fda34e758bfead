// Configuration management for the bluecap CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/bluecap/config.json
// - Linux: ~/.config/bluecap/config.json
// - Windows: %APPDATA%\bluecap\config.json

use anyhow::{Context, Result};
use bluecap_core::ContextSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,

    /// Execution context settings
    pub contexts: ContextSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "warn".to_string(),
            contexts: ContextSettings::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bluecap");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform location, creating the default if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .contexts
                .validate()
                .context("Invalid context settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory; rejected values leave the config untouched
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "log_filter" => {
                if value.trim().is_empty() {
                    anyhow::bail!("Log filter cannot be empty");
                }
                updated.log_filter = value.to_string();
            }
            "pool_workers" => {
                updated.contexts.pool_workers = value.parse().context("Invalid number")?;
            }
            "serial_name" => {
                updated.contexts.serial_name = value.to_string();
            }
            "stream_capacity" => {
                updated.contexts.stream_capacity = match value {
                    "" | "none" | "unbounded" => None,
                    n => Some(n.parse().context("Invalid number")?),
                };
            }
            "max_stack_depth" => {
                updated.contexts.max_stack_depth = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.contexts.validate()?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "log_filter" => Some(self.log_filter.clone()),
            "pool_workers" => Some(self.contexts.pool_workers.to_string()),
            "serial_name" => Some(self.contexts.serial_name.clone()),
            "stream_capacity" => Some(format_capacity(self.contexts.stream_capacity)),
            "max_stack_depth" => Some(self.contexts.max_stack_depth.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        ["log_filter", "pool_workers", "serial_name", "stream_capacity", "max_stack_depth"]
            .iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

pub fn format_capacity(capacity: Option<usize>) -> String {
    capacity.map_or_else(|| "unbounded".to_string(), |c| c.to_string())
}
