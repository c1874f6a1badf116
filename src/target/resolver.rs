//! Target Resolver

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

use super::ContainerInspector;
use crate::config::{DiscoveryConfig, DiscoveryStrategy, MANAGEMENT_PORT};
use crate::error::{ExposeError, ExposeResult};

/// Upstream the session forwards every connection to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExposureTarget {
    pub host: IpAddr,
    pub port: u16,
}

impl ExposureTarget {
    /// Create a target at `host:port`
    pub fn new(host: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target on the local loopback
    pub fn local(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Address relays dial
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// URL scheme clients should use: the management port is SSH,
    /// everything else is assumed to be HTTP
    pub fn scheme(&self) -> &'static str {
        if self.port == MANAGEMENT_PORT {
            "ssh"
        } else {
            "http"
        }
    }
}

impl fmt::Display for ExposureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// How a target is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Caller-supplied port on the loopback host
    Override(u16),
    /// Ask the container runtime
    Discover {
        container: String,
        strategy: DiscoveryStrategy,
        service_port: u16,
        port_env_var: String,
    },
}

impl TargetSpec {
    /// Discovery settings taken from configuration
    pub fn from_config(discovery: &DiscoveryConfig) -> Self {
        TargetSpec::Discover {
            container: discovery.container.clone(),
            strategy: discovery.strategy,
            service_port: discovery.service_port,
            port_env_var: discovery.port_env_var.clone(),
        }
    }
}

/// Resolves a [`TargetSpec`] into an [`ExposureTarget`]
#[derive(Clone)]
pub struct TargetResolver {
    spec: TargetSpec,
    inspector: Arc<dyn ContainerInspector>,
}

impl TargetResolver {
    /// Create a resolver for `spec` backed by `inspector`
    pub fn new(spec: TargetSpec, inspector: Arc<dyn ContainerInspector>) -> Self {
        Self { spec, inspector }
    }

    /// Explicit port wins; otherwise discover using `discovery`
    pub fn from_options(
        port_override: Option<u16>,
        discovery: &DiscoveryConfig,
        inspector: Arc<dyn ContainerInspector>,
    ) -> Self {
        let spec = match port_override {
            Some(port) => TargetSpec::Override(port),
            None => TargetSpec::from_config(discovery),
        };
        Self::new(spec, inspector)
    }

    /// How the target will be resolved
    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    /// Resolve synchronously. Discovery shells out to the container runtime
    /// and blocks.
    pub fn resolve(&self) -> ExposeResult<ExposureTarget> {
        let target = match &self.spec {
            TargetSpec::Override(port) => {
                debug!("Using explicit target port {}", port);
                ExposureTarget::local(*port)
            }
            TargetSpec::Discover {
                container,
                strategy,
                service_port,
                port_env_var,
            } => {
                if !self.inspector.is_running(container) {
                    return Err(ExposeError::target_unavailable(
                        container,
                        "container is not running",
                    ));
                }
                match strategy {
                    DiscoveryStrategy::ContainerAddress => {
                        self.container_address(container, *service_port)?
                    }
                    DiscoveryStrategy::EnvironmentPort => {
                        self.environment_port(container, port_env_var)?
                    }
                }
            }
        };

        info!("Resolved exposure target {}", target);
        Ok(target)
    }

    /// Resolve on the blocking pool so runtime calls don't stall the reactor
    pub async fn resolve_async(&self) -> ExposeResult<ExposureTarget> {
        if let TargetSpec::Override(port) = self.spec {
            return Ok(ExposureTarget::local(port));
        }

        let resolver = self.clone();
        match tokio::task::spawn_blocking(move || resolver.resolve()).await {
            Ok(result) => result,
            Err(e) => Err(ExposeError::target_unavailable(
                self.container_name(),
                format!("inspection task failed: {}", e),
            )),
        }
    }

    fn container_name(&self) -> &str {
        match &self.spec {
            TargetSpec::Override(_) => "",
            TargetSpec::Discover { container, .. } => container,
        }
    }

    fn container_address(&self, container: &str, service_port: u16) -> ExposeResult<ExposureTarget> {
        let raw = self
            .inspector
            .inspect_ip(container)
            .map_err(|e| ExposeError::target_unavailable(container, e.to_string()))?;

        let host: IpAddr = raw.trim().parse().map_err(|_| {
            ExposeError::target_unavailable(
                container,
                format!("inspected address '{}' is not an IP address", raw.trim()),
            )
        })?;

        Ok(ExposureTarget::new(host, service_port))
    }

    fn environment_port(&self, container: &str, var: &str) -> ExposeResult<ExposureTarget> {
        let raw = self
            .inspector
            .exec_capture(container, &["printenv", var])
            .map_err(|e| {
                ExposeError::target_unavailable(container, format!("{} not readable: {}", var, e))
            })?;

        let value = raw.trim();
        if value.is_empty() {
            return Err(ExposeError::target_unavailable(
                container,
                format!("{} is not set", var),
            ));
        }

        match value.parse::<u16>() {
            Ok(port) if port != 0 => Ok(ExposureTarget::local(port)),
            _ => Err(ExposeError::target_unavailable(
                container,
                format!("{}='{}' is not a valid port", var, value),
            )),
        }
    }
}

impl fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetResolver")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeInspector {
        running: bool,
        ip: Option<String>,
        env: Option<String>,
        calls: AtomicUsize,
    }

    impl ContainerInspector for FakeInspector {
        fn is_running(&self, _name: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.running
        }

        fn inspect_ip(&self, name: &str) -> crate::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ip.clone().ok_or_else(|| anyhow!("no address for {}", name))
        }

        fn exec_capture(&self, _name: &str, command: &[&str]) -> crate::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(command.first(), Some(&"printenv"));
            self.env.clone().ok_or_else(|| anyhow!("exit status 1"))
        }
    }

    fn discover(strategy: DiscoveryStrategy) -> TargetSpec {
        TargetSpec::Discover {
            container: "devbox".to_string(),
            strategy,
            service_port: 22,
            port_env_var: "HOST_PORT".to_string(),
        }
    }

    #[test]
    fn test_override_ignores_container_state() {
        let inspector = Arc::new(FakeInspector::default());
        let resolver = TargetResolver::new(TargetSpec::Override(9292), inspector.clone());

        let target = resolver.resolve().unwrap();
        assert_eq!(target, ExposureTarget::new(Ipv4Addr::LOCALHOST, 9292));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stopped_container_is_unavailable() {
        let inspector = Arc::new(FakeInspector {
            running: false,
            ip: Some("172.17.0.3".to_string()),
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::ContainerAddress), inspector);

        assert!(matches!(
            resolver.resolve(),
            Err(ExposeError::TargetUnavailable { .. })
        ));
    }

    #[test]
    fn test_container_address_uses_service_port() {
        let inspector = Arc::new(FakeInspector {
            running: true,
            ip: Some("172.17.0.3\n".to_string()),
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::ContainerAddress), inspector);

        let target = resolver.resolve().unwrap();
        assert_eq!(target.socket_addr(), "172.17.0.3:22".parse().unwrap());
        assert_eq!(target.scheme(), "ssh");
    }

    #[test]
    fn test_unparsable_address_is_unavailable() {
        let inspector = Arc::new(FakeInspector {
            running: true,
            ip: Some("not-an-ip".to_string()),
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::ContainerAddress), inspector);

        let err = resolver.resolve().unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn test_environment_port_targets_loopback() {
        let inspector = Arc::new(FakeInspector {
            running: true,
            env: Some("8080\n".to_string()),
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::EnvironmentPort), inspector);

        let target = resolver.resolve().unwrap();
        assert_eq!(target, ExposureTarget::local(8080));
        assert_eq!(target.scheme(), "http");
    }

    #[test]
    fn test_missing_environment_signal() {
        let inspector = Arc::new(FakeInspector {
            running: true,
            env: None,
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::EnvironmentPort), inspector);

        let err = resolver.resolve().unwrap_err();
        assert!(err.to_string().contains("HOST_PORT"));
    }

    #[test]
    fn test_invalid_environment_port() {
        for bad in ["", "abc", "0", "70000"] {
            let inspector = Arc::new(FakeInspector {
                running: true,
                env: Some(bad.to_string()),
                ..Default::default()
            });
            let resolver =
                TargetResolver::new(discover(DiscoveryStrategy::EnvironmentPort), inspector);
            assert!(resolver.resolve().is_err(), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_resolve_async_matches_sync() {
        let inspector = Arc::new(FakeInspector {
            running: true,
            ip: Some("10.88.0.4".to_string()),
            ..Default::default()
        });
        let resolver = TargetResolver::new(discover(DiscoveryStrategy::ContainerAddress), inspector);

        let target = resolver.resolve_async().await.unwrap();
        assert_eq!(target.socket_addr(), "10.88.0.4:22".parse().unwrap());
    }

    #[test]
    fn test_from_options_prefers_override() {
        let resolver = TargetResolver::from_options(
            Some(3000),
            &DiscoveryConfig::default(),
            Arc::new(FakeInspector::default()),
        );
        assert_eq!(resolver.spec(), &TargetSpec::Override(3000));
    }
}
