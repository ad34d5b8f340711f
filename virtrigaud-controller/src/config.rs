//! Configuration management for the controller.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reconciliation settings
    pub controller: ControllerConfig,
    /// Migration payload transport settings
    pub storage: StorageConfig,
    /// Development mode (in-process mock providers)
    pub dev: DevConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(workers) = args.workers {
            self.controller.workers = workers;
        }

        if args.dev {
            self.dev.enabled = true;
        }

        self
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Parallel workers per controller
    pub workers: usize,
    /// Full-resync period for the VM controller, seconds
    pub resync_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_seconds: 300,
        }
    }
}

/// Migration payload transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where migration PVC/NFS mounts appear in this process's filesystem
    pub mount_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_root: "/mnt/migration-storage".to_string(),
        }
    }
}

/// Development mode settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Use in-process mock providers instead of gRPC channels
    pub enabled: bool,
    /// Scratch directory for mock provider storage
    pub data_dir: String,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: "/var/lib/virtrigaud/dev".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.storage.mount_root, "/mnt/migration-storage");
        assert!(!config.dev.enabled);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
controller:
  workers: 8
storage:
  mountRoot: /mnt/staging
"#;
        // Field names are serde defaults (snake_case); camelCase is not
        // accepted here, so the unknown key falls back to the default.
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.controller.workers, 8);
        assert_eq!(config.storage.mount_root, "/mnt/migration-storage");

        let yaml = r#"
storage:
  mount_root: /mnt/staging
dev:
  enabled: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.mount_root, "/mnt/staging");
        assert!(config.dev.enabled);
    }
}
