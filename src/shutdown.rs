//! Graceful Shutdown Handling
//!
//! Provides the single session-wide cancellation signal and the OS signal
//! listener that triggers it. SIGTERM and SIGINT are supported on unix,
//! Ctrl+C everywhere.

use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};
use crate::Result;

/// Owns the cancellation signal shared by every listener and relay
#[derive(Debug)]
pub struct ShutdownCoordinator {
    /// Latched flag; once `true` it never goes back
    shutdown_tx: watch::Sender<bool>,
}

/// Receiving half handed to listeners and relays
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }

    /// Get a signal for a component to wait on. Subscribing after the
    /// trigger still observes it.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Broadcast cancellation. Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        let was_set = self.shutdown_tx.send_replace(true);
        if !was_set {
            debug!("Cancellation broadcast to {} subscribers", self.shutdown_tx.receiver_count());
        }
        !was_set
    }

    /// Whether cancellation has been broadcast
    pub fn is_triggered(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C. Does not trigger cancellation
    /// itself; the session decides what to do with the interrupt.
    pub async fn wait_for_signal() -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Start listening for shutdown signals and trigger cancellation on one
    pub async fn listen_for_signals(&self) -> Result<()> {
        debug!("Starting shutdown signal listener");
        Self::wait_for_signal().await?;
        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolve once cancellation has been broadcast. Also resolves if the
    /// coordinator is dropped, since nothing can cancel us afterwards.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.shutdown_rx.borrow_and_update() {
                return;
            }
            if self.shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new();
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        assert!(coordinator.trigger());

        timeout(Duration::from_secs(1), first.cancelled()).await.unwrap();
        timeout(Duration::from_secs(1), second.cancelled()).await.unwrap();
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_cancellation() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();

        let mut late = coordinator.subscribe();
        assert!(late.is_cancelled());
        timeout(Duration::from_secs(1), late.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_twice_is_harmless() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.trigger());
        assert!(!coordinator.trigger());
    }

    #[tokio::test]
    async fn test_waiting_task_wakes_on_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.subscribe();

        let waiter = tokio::spawn(async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => false,
                _ = signal.cancelled() => true,
            }
        });

        sleep(Duration::from_millis(50)).await;
        coordinator.trigger();

        assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
    }

    #[test]
    fn test_cancelled_pending_until_trigger() {
        use tokio_test::{assert_pending, assert_ready, task};

        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.subscribe();
        let mut cancelled = task::spawn(signal.cancelled());

        assert_pending!(cancelled.poll());
        assert!(!cancelled.is_woken());

        coordinator.trigger();
        assert!(cancelled.is_woken());
        assert_ready!(cancelled.poll());
    }

    #[tokio::test]
    async fn test_dropped_coordinator_releases_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.subscribe();
        drop(coordinator);

        timeout(Duration::from_secs(1), signal.cancelled()).await.unwrap();
    }
}
