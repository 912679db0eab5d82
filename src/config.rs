use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::scheduler::BackoffPolicy;

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub hsm: HsmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads running zone stages
    pub workers: usize,
    /// Drudger threads producing signatures; 0 signs inline in the worker
    pub drudgers: usize,
    /// Signing queue capacity
    pub queue_capacity: usize,
    /// Upper bound on any idle sleep, in milliseconds
    pub poll_interval_ms: u64,
    /// Zonelist file
    pub zonelist: PathBuf,
    /// Run after each successful write as `<command> <zone> <output>`
    pub notify_command: Option<String>,
    /// Notify command timeout in seconds
    pub notify_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            drudgers: 4,
            queue_capacity: 256,
            poll_interval_ms: 1000,
            zonelist: PathBuf::from("/etc/aegis-signer/zonelist.toml"),
            notify_command: None,
            notify_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Soft HSM key directory
    pub key_dir: PathBuf,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("/var/lib/aegis-signer/keys"),
        }
    }
}

impl SignerConfig {
    /// Load configuration from a TOML or YAML file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SignerConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config {}", path.display()))?,
            _ => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.workers == 0 {
            anyhow::bail!("Invalid workers: must be > 0");
        }

        if self.engine.queue_capacity == 0 {
            anyhow::bail!("Invalid queue_capacity: must be > 0");
        }

        if self.engine.poll_interval_ms == 0 {
            anyhow::bail!("Invalid poll_interval_ms: must be > 0");
        }

        if self.backoff.floor == 0 {
            anyhow::bail!("Invalid backoff floor: must be > 0");
        }

        if self.backoff.max < self.backoff.floor {
            anyhow::bail!("Invalid backoff: max must be >= floor");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SignerConfig::default();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.drudgers, 4);
        assert_eq!(config.backoff.floor, 60);
        assert_eq!(config.backoff.max, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_zero_workers() {
        let mut config = SignerConfig::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fails_inverted_backoff() {
        let mut config = SignerConfig::default();
        config.backoff.max = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_drudgers_allowed() {
        let mut config = SignerConfig::default();
        config.engine.drudgers = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [engine]
            workers = 2
            drudgers = 8
            zonelist = "/tmp/zonelist.toml"
            notify_command = "/usr/local/bin/reload-nameserver"

            [backoff]
            floor_secs = 30
            max_secs = 600

            [hsm]
            key_dir = "/tmp/keys"
        "#;

        let config: SignerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.drudgers, 8);
        assert_eq!(config.engine.queue_capacity, 256);
        assert_eq!(config.backoff.floor, 30);
        assert_eq!(config.hsm.key_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(
            config.engine.notify_command.as_deref(),
            Some("/usr/local/bin/reload-nameserver")
        );
    }

    #[test]
    fn test_yaml_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signer.yaml");
        fs::write(
            &path,
            "engine:\n  workers: 3\n  drudgers: 0\nbackoff:\n  floor_secs: 5\n  max_secs: 50\n",
        )
        .unwrap();
        let config = SignerConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.engine.drudgers, 0);
        assert_eq!(config.backoff.max, 50);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signer.toml");
        let original = SignerConfig::default();
        original.to_file(&path).unwrap();
        let loaded = SignerConfig::from_file(&path).unwrap();
        assert_eq!(original.engine.workers, loaded.engine.workers);
        assert_eq!(original.hsm.key_dir, loaded.hsm.key_dir);
    }
}
