//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Byte accounting for one client connection while it is relayed
#[derive(Debug)]
pub struct RelaySession {
    pub relay_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Statistics for a finished relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub relay_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Ended by session cancellation rather than by either side closing
    pub cancelled: bool,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(relay_id: String, client_addr: SocketAddr, target_addr: SocketAddr) -> Self {
        debug!("Creating relay {} ({} -> {})", relay_id, client_addr, target_addr);

        Self {
            relay_id,
            client_addr,
            target_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes copied client to target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes copied target to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Total bytes transferred in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Time since the relay started
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record bytes copied client to target
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes copied target to client
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot the session into final statistics
    pub fn to_stats(&self, cancelled: bool) -> RelayStats {
        let duration = self.duration();

        RelayStats {
            relay_id: self.relay_id.clone(),
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            cancelled,
        }
    }
}

impl RelayStats {
    /// Total bytes transferred in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Log the statistics as structured fields
    pub fn log(&self) {
        debug!(
            relay_id = %self.relay_id,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration_ms,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            cancelled = self.cancelled,
            "Relay finished"
        );
    }
}
