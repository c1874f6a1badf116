//! Port Negotiator
//!
//! Finds the first port that can be bound on every candidate address. The
//! probe binds and immediately releases, so another process may still take
//! the port before the session binds it for real. The session's own bind is
//! authoritative and fails loudly.

use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace};

use crate::error::{ExposeError, ExposeResult};

/// Ports probed before negotiation gives up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Checks whether a port is currently bindable on one address
pub trait PortProbe: Send + Sync {
    fn is_available(&self, addr: IpAddr, port: u16) -> bool;
}

/// Bind-then-release probe using a real TCP listener
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_available(&self, addr: IpAddr, port: u16) -> bool {
        match std::net::TcpListener::bind(SocketAddr::new(addr, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                trace!("Port {} unavailable on {}: {}", port, addr, e);
                false
            }
        }
    }
}

/// Sequential port scan shared across all addresses
pub struct PortNegotiator {
    start_port: u16,
    max_attempts: u32,
    probe: Box<dyn PortProbe>,
}

impl PortNegotiator {
    /// Create a negotiator probing with real binds
    pub fn new(start_port: u16, max_attempts: u32) -> Self {
        Self {
            start_port,
            max_attempts,
            probe: Box::new(TcpProbe),
        }
    }

    /// Replace the bind probe
    pub fn with_probe<P: PortProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// First port probed
    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Maximum number of ports probed
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Return the first port at or above the start port that is free on every
    /// address. Stops after `max_attempts` ports or at the end of the port
    /// space, whichever comes first.
    pub fn negotiate(&self, addrs: &[IpAddr]) -> ExposeResult<u16> {
        if addrs.is_empty() {
            return Err(ExposeError::NoInterface);
        }

        let mut attempts = 0;
        for offset in 0..self.max_attempts {
            let Some(port) = u16::try_from(self.start_port as u32 + offset)
                .ok()
                .filter(|p| *p != 0)
            else {
                break;
            };
            attempts += 1;

            if addrs.iter().all(|addr| self.probe.is_available(*addr, port)) {
                debug!(
                    "Negotiated port {} on {} addresses after {} attempts",
                    port,
                    addrs.len(),
                    attempts
                );
                return Ok(port);
            }
        }

        Err(ExposeError::PortExhausted {
            start: self.start_port,
            attempts,
        })
    }
}
