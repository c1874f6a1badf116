//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Well-known management port. Targets on this port are shown as `ssh://`.
pub const MANAGEMENT_PORT: u16 = 22;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub exposure: ExposureConfig,
    pub discovery: DiscoveryConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// Port negotiation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// First port tried during negotiation
    pub start_port: u16,
    /// How many consecutive ports are probed before giving up
    pub max_attempts: u32,
}

/// How the upstream service is located
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Container hosting the service
    pub container: String,
    /// Container runtime binary used for inspection
    pub runtime: String,
    pub strategy: DiscoveryStrategy,
    /// Port the service listens on inside the container
    pub service_port: u16,
    /// Environment variable holding the host-side port
    pub port_env_var: String,
}

/// Discovery strategy for the target service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStrategy {
    /// Container network address plus the configured service port
    ContainerAddress,
    /// Loopback plus a port read from the container environment
    EnvironmentPort,
}

/// Per-connection relay settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exposure: ExposureConfig::default(),
            discovery: DiscoveryConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            start_port: 10000,
            max_attempts: 100,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            container: "devbox".to_string(),
            runtime: "docker".to_string(),
            strategy: DiscoveryStrategy::ContainerAddress,
            service_port: MANAGEMENT_PORT,
            port_env_var: "HOST_PORT".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryStrategy::ContainerAddress => write!(f, "container-address"),
            DiscoveryStrategy::EnvironmentPort => write!(f, "environment-port"),
        }
    }
}

impl FromStr for DiscoveryStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container-address" => Ok(DiscoveryStrategy::ContainerAddress),
            "environment-port" => Ok(DiscoveryStrategy::EnvironmentPort),
            other => anyhow::bail!(
                "unknown discovery strategy '{}' (expected container-address or environment-port)",
                other
            ),
        }
    }
}
