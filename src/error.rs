//! Error Types
//!
//! Session-level errors are fatal: they stop the whole exposure and are
//! reported to the operator. Relay errors belong to a single connection and
//! are only ever logged.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::exposure::SessionState;

/// Fatal errors raised while negotiating or running an exposure session.
#[derive(Debug, Error)]
pub enum ExposeError {
    /// No up, non-loopback IPv4 interface exists on this host.
    #[error("no usable network interface found (need an up, non-loopback IPv4 address)")]
    NoInterface,

    /// Failed to enumerate host interfaces at all.
    #[error("failed to enumerate network interfaces: {0}")]
    InterfaceScan(#[source] std::io::Error),

    /// No port in the scanned range was free on every candidate address.
    #[error("no port free on all interfaces after {attempts} attempts starting at {start}")]
    PortExhausted {
        /// First port probed.
        start: u16,
        /// Number of ports probed.
        attempts: u32,
    },

    /// The upstream service could not be resolved.
    #[error("target unavailable for container '{container}': {reason}")]
    TargetUnavailable {
        /// Container that was inspected.
        container: String,
        /// Why the target could not be determined.
        reason: String,
    },

    /// Binding a listener failed even though negotiation succeeded.
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A running listener hit an unrecoverable accept error.
    #[error("listener on {addr} failed: {source}")]
    ListenerFailed {
        /// Address of the failing listener.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The session was driven through an illegal state change.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },
}

/// Coarse classification used for operator-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Negotiation,
    TargetResolution,
    Listen,
    Internal,
}

impl ExposeError {
    /// Which stage of the session produced this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExposeError::NoInterface | ExposeError::InterfaceScan(_) => ErrorKind::Discovery,
            ExposeError::PortExhausted { .. } => ErrorKind::Negotiation,
            ExposeError::TargetUnavailable { .. } => ErrorKind::TargetResolution,
            ExposeError::ListenFailed { .. } | ExposeError::ListenerFailed { .. } => {
                ErrorKind::Listen
            }
            ExposeError::InvalidTransition { .. } => ErrorKind::Internal,
        }
    }

    /// Every session error terminates the session.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Shorthand for `TargetUnavailable`
    pub(crate) fn target_unavailable(container: &str, reason: impl Into<String>) -> Self {
        ExposeError::TargetUnavailable {
            container: container.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-connection relay failures. Never escalated to the session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The target refused or failed the connection.
    #[error("failed to connect to target {addr}: {source}")]
    Dial {
        /// Target address.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The target did not answer within the connect timeout.
    #[error("connecting to target {addr} timed out after {timeout:?}")]
    DialTimeout {
        /// Target address.
        addr: SocketAddr,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// Copying bytes between the two sides failed.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Relay errors only affect their own connection.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

/// Result type for exposure session operations.
pub type ExposeResult<T> = std::result::Result<T, ExposeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_exhausted_message() {
        let err = ExposeError::PortExhausted {
            start: 10000,
            attempts: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("10000"));
        assert!(msg.contains("100 attempts"));
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }

    #[test]
    fn test_listen_failed_is_listen_kind() {
        let err = ExposeError::ListenFailed {
            addr: "10.0.0.5:10002".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("10.0.0.5:10002"));
        assert_eq!(err.kind(), ErrorKind::Listen);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_target_unavailable_names_container() {
        let err = ExposeError::target_unavailable("devbox", "container is not running");
        assert!(err.to_string().contains("devbox"));
        assert_eq!(err.kind(), ErrorKind::TargetResolution);
    }

    #[test]
    fn test_relay_errors_are_not_fatal() {
        let err = RelayError::Dial {
            addr: "127.0.0.1:9".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:9"));
    }
}
