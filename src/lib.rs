//! lanshare Library
//!
//! Makes a locally running container service reachable from other devices on
//! the LAN: listens on every non-loopback IPv4 interface at one negotiated
//! port and relays raw TCP streams to the service for the lifetime of one
//! command invocation.

pub mod config;
pub mod error;
pub mod exposure;
pub mod network;
pub mod relay;
pub mod service;
pub mod shutdown;
pub mod target;

pub use config::Config;
pub use error::{ExposeError, RelayError};
pub use exposure::{ExposurePlan, ExposureSession, SessionComponents, SessionState};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and CLI glue
pub type Result<T> = anyhow::Result<T>;
