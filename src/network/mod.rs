//! Host Network Module
//! 
//! Discovers the addresses a session can listen on and negotiates the one
//! port shared by all of them.

pub mod negotiator;
pub mod scanner;

pub use negotiator::{PortNegotiator, PortProbe, TcpProbe, DEFAULT_MAX_ATTEMPTS};
pub use scanner::{InterfaceScanner, InterfaceSource, NetworkInterface, SystemInterfaces};
