//! Configuration management for EchoMIDI
//!
//! Settings live in a small YAML file. Every field has a default, so a
//! missing file or an empty document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::paths::AppPaths;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppConfig {
    /// Routing document location; defaults to `<state_dir>/routing.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_file: Option<PathBuf>,
    /// How often the device inventory is polled for plug/unplug changes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Save the routing document on shutdown
    #[serde(default = "default_true")]
    pub autosave: bool,
}

/// Focus-mute settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FocusConfig {
    /// Track the foreground window (only effective where an OS hook exists)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Also write a daily rolling log file in the logs directory
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            routing_file: None,
            poll_interval_ms: default_poll_interval(),
            focus: FocusConfig::default(),
            logging: LoggingConfig::default(),
            autosave: true,
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: true }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // An empty file parses as YAML null
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        };

        config.validate()?;
        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }
        if let Some(path) = &self.routing_file {
            if path.as_os_str().is_empty() {
                anyhow::bail!("routing_file cannot be empty");
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Effective routing document path. Relative paths are resolved against
    /// the directory holding the config file.
    pub fn routing_path(&self, paths: &AppPaths) -> PathBuf {
        match &self.routing_file {
            Some(path) if path.is_relative() => paths.base_dir().join(path),
            Some(path) => path.clone(),
            None => paths.routing_file(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Layout;
    use tempfile::TempDir;

    fn paths(root: &Path) -> AppPaths {
        AppPaths {
            layout: Layout::Portable,
            config: root.join("config.yaml"),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
        }
    }

    #[test]
    fn test_defaults_from_partial_yaml() {
        let config: AppConfig = serde_yaml::from_str("poll_interval_ms: 250\n").unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(config.focus.enabled);
        assert!(config.logging.file);
        assert!(config.autosave);
        assert!(config.routing_file.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = AppConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_routing_path() {
        let config = AppConfig {
            routing_file: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_routing_path_resolution() {
        let root = PathBuf::from("/srv/echo");
        let paths = paths(&root);

        assert_eq!(
            AppConfig::default().routing_path(&paths),
            root.join("state").join("routing.json")
        );

        let relative = AppConfig {
            routing_file: Some(PathBuf::from("my-routing.json")),
            ..Default::default()
        };
        assert_eq!(relative.routing_path(&paths), root.join("my-routing.json"));
    }

    #[tokio::test]
    async fn test_load_save_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.yaml");

        let config = AppConfig {
            poll_interval_ms: 500,
            focus: FocusConfig { enabled: false },
            autosave: false,
            ..Default::default()
        };
        config.save(&path).await?;
        assert_eq!(AppConfig::load(&path).await?, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_and_empty_files() -> Result<()> {
        let dir = TempDir::new()?;
        let missing = dir.path().join("missing.yaml");
        assert_eq!(AppConfig::load_or_default(&missing).await?, AppConfig::default());

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "")?;
        assert_eq!(AppConfig::load(&empty).await?, AppConfig::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "poll_interval_ms: [not a number").unwrap();
        assert!(AppConfig::load(&path).await.is_err());
    }
}
