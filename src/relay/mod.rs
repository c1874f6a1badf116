//! Data Relay Module
//! 
//! Handles bidirectional data relay between LAN clients and the target.

pub mod engine;
pub mod session;

pub use engine::ConnectionRelay;
pub use session::{RelaySession, RelayStats};
