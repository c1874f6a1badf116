//! Configuration Manager

use super::{Config, DiscoveryStrategy};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values supplied on the command line. `None` keeps the loaded value.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub container: Option<String>,
    pub strategy: Option<DiscoveryStrategy>,
    pub start_port: Option<u16>,
    pub max_attempts: Option<u32>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::debug!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::debug!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables on top of `base`
    pub fn apply_env(mut config: Config) -> Result<Config> {
        if let Ok(container) = std::env::var("LANSHARE_CONTAINER") {
            config.discovery.container = container;
        }

        if let Ok(runtime) = std::env::var("LANSHARE_RUNTIME") {
            config.discovery.runtime = runtime;
        }

        if let Ok(start_port) = std::env::var("LANSHARE_START_PORT") {
            config.exposure.start_port = start_port
                .parse::<u16>()
                .with_context(|| format!("Invalid LANSHARE_START_PORT: {}", start_port))?;
        }

        if let Ok(attempts) = std::env::var("LANSHARE_MAX_ATTEMPTS") {
            config.exposure.max_attempts = attempts
                .parse::<u32>()
                .with_context(|| format!("Invalid LANSHARE_MAX_ATTEMPTS: {}", attempts))?;
        }

        if let Ok(timeout) = std::env::var("LANSHARE_CONNECT_TIMEOUT") {
            config.relay.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid LANSHARE_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("LANSHARE_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load with priority: file > environment > defaults.
    /// CLI overrides are applied separately by the caller.
    pub fn load(path: &Path) -> Result<Config> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Self::apply_env(Config::default())
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.exposure.start_port == 0 {
            bail!("exposure.start_port must be greater than 0");
        }

        if self.exposure.max_attempts == 0 {
            bail!("exposure.max_attempts must be greater than 0");
        }

        if self.discovery.container.trim().is_empty() {
            bail!("discovery.container must not be empty");
        }

        if self.discovery.runtime.trim().is_empty() {
            bail!("discovery.runtime must not be empty");
        }

        if self.discovery.service_port == 0 {
            bail!("discovery.service_port must be greater than 0");
        }

        if self.discovery.strategy == DiscoveryStrategy::EnvironmentPort
            && self.discovery.port_env_var.trim().is_empty()
        {
            bail!("discovery.port_env_var is required for the environment-port strategy");
        }

        if self.relay.connect_timeout.is_zero() {
            bail!("relay.connect_timeout must be greater than 0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(container) = &overrides.container {
            self.discovery.container = container.clone();
            tracing::debug!("CLI override: container set to {}", container);
        }

        if let Some(strategy) = overrides.strategy {
            self.discovery.strategy = strategy;
            tracing::debug!("CLI override: discovery strategy set to {}", strategy);
        }

        if let Some(port) = overrides.start_port {
            self.exposure.start_port = port;
            tracing::debug!("CLI override: start port set to {}", port);
        }

        if let Some(attempts) = overrides.max_attempts {
            self.exposure.max_attempts = attempts;
            tracing::debug!("CLI override: max attempts set to {}", attempts);
        }

        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exposure.start_port, 10000);
        assert_eq!(config.exposure.max_attempts, 100);
        assert_eq!(config.discovery.strategy, DiscoveryStrategy::ContainerAddress);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("lanshare.toml");
        std::fs::write(
            &path,
            r#"
[exposure]
start_port = 20000

[discovery]
container = "workbench"
strategy = "environment-port"

[relay]
connect_timeout = "3s"
"#,
        )?;

        let config = ConfigManager::load_from_file(&path)?;
        assert_eq!(config.exposure.start_port, 20000);
        assert_eq!(config.exposure.max_attempts, 100);
        assert_eq!(config.discovery.container, "workbench");
        assert_eq!(config.discovery.strategy, DiscoveryStrategy::EnvironmentPort);
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(3));
        Ok(())
    }

    #[test]
    fn test_invalid_file_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("lanshare.toml");
        std::fs::write(&path, "[exposure]\nmax_attempts = 0\n")?;

        assert!(ConfigManager::load_from_file(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_file_uses_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml"))?;
        assert_eq!(config.discovery.container, "devbox");
        Ok(())
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        config.merge_with_cli_args(&CliOverrides {
            container: Some("other".to_string()),
            strategy: Some(DiscoveryStrategy::EnvironmentPort),
            start_port: Some(12000),
            max_attempts: Some(5),
            log_level: Some("debug".to_string()),
        });

        assert_eq!(config.discovery.container, "other");
        assert_eq!(config.discovery.strategy, DiscoveryStrategy::EnvironmentPort);
        assert_eq!(config.exposure.start_port, 12000);
        assert_eq!(config.exposure.max_attempts, 5);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "environment-port".parse::<DiscoveryStrategy>().unwrap(),
            DiscoveryStrategy::EnvironmentPort
        );
        assert!("guess".parse::<DiscoveryStrategy>().is_err());
    }
}
