//! Exposure Session Module
//! 
//! Owns one listener per LAN interface at the negotiated port and drives
//! the relays spawned from them.

pub mod listener;
pub mod session;
pub mod state;

pub use listener::ProxyInstance;
pub use session::{ExposurePlan, ExposureSession, SessionComponents};
pub use state::SessionState;
