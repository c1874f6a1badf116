//! Exposure Session
//!
//! Negotiates a port and target, binds one listener per LAN address, and
//! tears everything down again on cancellation or the first fatal listener
//! error. A session is either fully bound or not started at all.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{ProxyInstance, ProxyListener};
use super::state::SessionState;
use crate::config::Config;
use crate::error::{ExposeError, ExposeResult};
use crate::network::{InterfaceScanner, PortNegotiator};
use crate::relay::ConnectionRelay;
use crate::shutdown::ShutdownCoordinator;
use crate::target::{ExposureTarget, TargetResolver};

/// Collaborators a session negotiates with
pub struct SessionComponents {
    pub scanner: InterfaceScanner,
    pub negotiator: PortNegotiator,
    pub resolver: TargetResolver,
    pub connect_timeout: Duration,
}

impl SessionComponents {
    /// Create components with the default connect timeout
    pub fn new(scanner: InterfaceScanner, negotiator: PortNegotiator, resolver: TargetResolver) -> Self {
        Self {
            scanner,
            negotiator,
            resolver,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Components for the host's real interfaces and a real port probe
    pub fn from_config(config: &Config, resolver: TargetResolver) -> Self {
        Self {
            scanner: InterfaceScanner::new(),
            negotiator: PortNegotiator::new(config.exposure.start_port, config.exposure.max_attempts),
            resolver,
            connect_timeout: config.relay.connect_timeout,
        }
    }

    /// Override the relay dial timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Negotiated addresses, port and target, before anything is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposurePlan {
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub target: ExposureTarget,
}

impl ExposurePlan {
    /// One proxy instance per planned address
    pub fn proxies(&self) -> Vec<ProxyInstance> {
        self.addresses
            .iter()
            .map(|addr| ProxyInstance {
                listen_address: *addr,
                listen_port: self.port,
                target: self.target,
            })
            .collect()
    }
}

/// One LAN exposure for the lifetime of a command invocation
pub struct ExposureSession {
    state: SessionState,
    components: Option<SessionComponents>,
    connect_timeout: Duration,
    shutdown: ShutdownCoordinator,
    proxies: Vec<ProxyInstance>,
    relay: Option<ConnectionRelay>,
    listeners: Vec<JoinHandle<()>>,
    fatal_rx: Option<mpsc::Receiver<ExposeError>>,
}

impl ExposureSession {
    /// Create an idle session that negotiates with `components`
    pub fn new(components: SessionComponents) -> Self {
        let mut session = Self::without_components(components.connect_timeout);
        session.components = Some(components);
        session
    }

    /// Session that can only be started from an existing plan via [`bind`](Self::bind)
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self::without_components(connect_timeout)
    }

    fn without_components(connect_timeout: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            components: None,
            connect_timeout,
            shutdown: ShutdownCoordinator::new(),
            proxies: Vec::new(),
            relay: None,
            listeners: Vec::new(),
            fatal_rx: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bound listeners; empty unless the session is running
    pub fn proxies(&self) -> &[ProxyInstance] {
        &self.proxies
    }

    /// Negotiated port shared by every listener, once running
    pub fn port(&self) -> Option<u16> {
        self.proxies.first().map(|p| p.listen_port)
    }

    /// Resolved target, once running
    pub fn target(&self) -> Option<ExposureTarget> {
        self.proxies.first().map(|p| p.target)
    }

    /// One URL per bound address
    pub fn reachable_urls(&self) -> Vec<String> {
        self.proxies.iter().map(ProxyInstance::url).collect()
    }

    /// Relays currently forwarding traffic
    pub fn active_relays(&self) -> usize {
        self.relay.as_ref().map_or(0, ConnectionRelay::active_relays)
    }

    fn transition(&mut self, next: SessionState) -> ExposeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ExposeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Fail the session before it ever ran
    fn abort(&mut self, err: ExposeError) -> ExposeError {
        if self.state != SessionState::Stopped {
            self.state = SessionState::Stopped;
            debug!("Session stopped before running");
        }
        err
    }

    /// Scan interfaces, negotiate the shared port, resolve the target.
    /// Any failure stops the session.
    pub async fn negotiate(&mut self) -> ExposeResult<ExposurePlan> {
        self.transition(SessionState::Negotiating)?;

        let Some(components) = self.components.take() else {
            return Err(self.abort(ExposeError::InvalidTransition {
                from: SessionState::Idle,
                to: SessionState::Negotiating,
            }));
        };

        let addresses: Vec<IpAddr> = match components.scanner.candidate_addresses() {
            Ok(found) => found.into_iter().map(IpAddr::V4).collect(),
            Err(e) => return Err(self.abort(e)),
        };

        let port = match components.negotiator.negotiate(&addresses) {
            Ok(port) => port,
            Err(e) => return Err(self.abort(e)),
        };

        let target = match components.resolver.resolve_async().await {
            Ok(target) => target,
            Err(e) => return Err(self.abort(e)),
        };

        info!(
            "Negotiated port {} on {} interfaces for target {}",
            port,
            addresses.len(),
            target
        );
        Ok(ExposurePlan {
            addresses,
            port,
            target,
        })
    }

    /// Bind every listener in `plan` and start serving. All-or-nothing: if
    /// any bind fails the already bound listeners are closed and the session
    /// stops with `ListenFailed`.
    pub async fn bind(&mut self, plan: ExposurePlan) -> ExposeResult<()> {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Negotiating)?;
        }
        if self.state != SessionState::Negotiating {
            return Err(ExposeError::InvalidTransition {
                from: self.state,
                to: SessionState::Running,
            });
        }
        if plan.addresses.is_empty() {
            return Err(self.abort(ExposeError::NoInterface));
        }
        if plan.port == 0 {
            // Port 0 would give every address its own ephemeral port
            let addr = SocketAddr::new(plan.addresses[0], 0);
            return Err(self.abort(ExposeError::ListenFailed {
                addr,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "listen port must be a fixed, non-zero port",
                ),
            }));
        }

        let mut bound = Vec::with_capacity(plan.addresses.len());
        for proxy in plan.proxies() {
            match ProxyListener::bind(proxy).await {
                Ok(listener) => bound.push(listener),
                Err(e) => {
                    drop(bound);
                    return Err(self.abort(e));
                }
            }
        }

        self.serve(bound, plan.target)
    }

    /// Spawn one accept task per bound listener and enter `Running`
    fn serve(&mut self, bound: Vec<ProxyListener>, target: ExposureTarget) -> ExposeResult<()> {
        let relay = ConnectionRelay::new(target, self.connect_timeout);
        let (fatal_tx, fatal_rx) = mpsc::channel(bound.len().max(1));

        for listener in bound {
            info!(
                "Listening on {} -> {}",
                listener.proxy.listen_addr(),
                listener.proxy.target
            );
            self.proxies.push(listener.proxy);
            let task = listener.run(relay.clone(), self.shutdown.subscribe(), fatal_tx.clone());
            self.listeners.push(tokio::spawn(task));
        }

        self.relay = Some(relay);
        self.fatal_rx = Some(fatal_rx);
        self.transition(SessionState::Running)
    }

    /// Negotiate and bind in one go
    pub async fn start(&mut self) -> ExposeResult<ExposurePlan> {
        let plan = self.negotiate().await?;
        self.bind(plan.clone()).await?;
        Ok(plan)
    }

    /// Serve until `stop` resolves or a listener fails fatally, then shut
    /// down. Returns the listener error if that is what ended the session.
    pub async fn run_until<F>(&mut self, stop: F) -> ExposeResult<()>
    where
        F: Future<Output = ()>,
    {
        if self.state != SessionState::Running {
            return Err(ExposeError::InvalidTransition {
                from: self.state,
                to: SessionState::ShuttingDown,
            });
        }

        let Some(mut fatal_rx) = self.fatal_rx.take() else {
            return Err(ExposeError::InvalidTransition {
                from: self.state,
                to: SessionState::ShuttingDown,
            });
        };

        let outcome = tokio::select! {
            _ = stop => {
                info!("Stop requested, shutting down exposure session");
                Ok(())
            }
            Some(err) = fatal_rx.recv() => {
                error!("Listener failure, shutting down exposure session");
                Err(err)
            }
        };

        self.shutdown().await?;
        outcome
    }

    /// Cancel every listener and relay and wait for all of them to exit.
    /// Calling this again after the session stopped is a no-op.
    pub async fn shutdown(&mut self) -> ExposeResult<()> {
        match self.state {
            SessionState::Stopped => return Ok(()),
            SessionState::Idle | SessionState::Negotiating => {
                self.components = None;
                return self.transition(SessionState::Stopped);
            }
            SessionState::Running => self.transition(SessionState::ShuttingDown)?,
            SessionState::ShuttingDown => {}
        }

        self.shutdown.trigger();

        let active = self.active_relays();
        info!(
            "Closing {} listeners and {} active relays",
            self.listeners.len(),
            active
        );

        for handle in self.listeners.drain(..) {
            if let Err(e) = handle.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }

        self.fatal_rx = None;
        self.proxies.clear();
        self.transition(SessionState::Stopped)?;
        info!("Exposure session stopped");
        Ok(())
    }
}

impl Drop for ExposureSession {
    fn drop(&mut self) {
        // Listener tasks outlive an un-awaited session otherwise
        self.shutdown.trigger();
    }
}
