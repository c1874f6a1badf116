//! Connection Relay
//!
//! Forwards one accepted client connection to the exposure target. A relay
//! ends when either direction reaches EOF or fails, or when the session is
//! cancelled. Both sockets are shut down on every exit path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use super::session::{RelaySession, RelayStats};
use crate::error::RelayError;
use crate::shutdown::ShutdownSignal;
use crate::target::ExposureTarget;

const RELAY_BUFFER_SIZE: usize = 8192;

/// Relays client connections to a single target
#[derive(Debug, Clone)]
pub struct ConnectionRelay {
    target: ExposureTarget,
    connect_timeout: Duration,
    active: Arc<AtomicUsize>,
}

/// Decrements the active relay count when dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum RelayEnd {
    Upstream(std::io::Result<()>),
    Downstream(std::io::Result<()>),
    Cancelled,
}

impl ConnectionRelay {
    /// Create a relay for `target` with the given dial timeout
    pub fn new(target: ExposureTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Target every connection is forwarded to
    pub fn target(&self) -> ExposureTarget {
        self.target
    }

    /// Relays currently between accept and close
    pub fn active_relays(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Dial the target, bounded by the connect timeout
    pub async fn connect_to_target(&self) -> Result<TcpStream, RelayError> {
        let addr = self.target.socket_addr();
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Setting TCP_NODELAY towards {}: {}", addr, e);
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(RelayError::Dial { addr, source }),
            Err(_) => Err(RelayError::DialTimeout {
                addr,
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Relay `client` to the target until either side closes or `shutdown`
    /// fires. Dial failures close the client and are returned, never
    /// propagated further by the caller.
    pub async fn relay(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        mut shutdown: ShutdownSignal,
    ) -> Result<RelayStats, RelayError> {
        let _active = ActiveGuard::enter(&self.active);
        let session = RelaySession::new(
            Uuid::new_v4().to_string(),
            client_addr,
            self.target.socket_addr(),
        );

        let dialed = tokio::select! {
            result = self.connect_to_target() => Some(result),
            _ = shutdown.cancelled() => None,
        };

        let mut upstream = match dialed {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                close_stream(&mut client, "client").await;
                return Err(e);
            }
            None => {
                close_stream(&mut client, "client").await;
                return Ok(session.to_stats(true));
            }
        };

        let end = {
            let (mut client_read, mut client_write) = client.split();
            let (mut upstream_read, mut upstream_write) = upstream.split();

            tokio::select! {
                result = pump(&mut client_read, &mut upstream_write, |n| session.add_bytes_up(n)) => {
                    RelayEnd::Upstream(result)
                }
                result = pump(&mut upstream_read, &mut client_write, |n| session.add_bytes_down(n)) => {
                    RelayEnd::Downstream(result)
                }
                _ = shutdown.cancelled() => RelayEnd::Cancelled,
            }
        };

        close_stream(&mut client, "client").await;
        close_stream(&mut upstream, "upstream").await;

        let stats = match end {
            RelayEnd::Upstream(Err(e)) | RelayEnd::Downstream(Err(e)) => {
                debug!("Relay {} ended with error: {}", session.relay_id, e);
                return Err(RelayError::Io(e));
            }
            RelayEnd::Upstream(Ok(())) | RelayEnd::Downstream(Ok(())) => session.to_stats(false),
            RelayEnd::Cancelled => session.to_stats(true),
        };

        stats.log();
        Ok(stats)
    }
}

/// Copy until EOF, then propagate the half-close to the writer
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, mut on_bytes: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }
}

/// Shut down the write side. Failures only mean the peer is already gone.
async fn close_stream(stream: &mut TcpStream, side: &str) {
    if let Err(e) = stream.shutdown().await {
        debug!("Closing {} side: {}", side, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        // Reserve then release a port so nothing listens on it
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let relay = ConnectionRelay::new(ExposureTarget::local(port), Duration::from_secs(2));
        let coordinator = ShutdownCoordinator::new();
        let (mut outside, accepted) = connected_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let result = relay.relay(accepted, peer, coordinator.subscribe()).await;
        assert!(matches!(result, Err(RelayError::Dial { .. })));
        assert_eq!(relay.active_relays(), 0);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), outside.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "client should observe EOF");
    }

    #[tokio::test]
    async fn test_cancellation_ends_idle_relay() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let _keep = tokio::spawn(async move {
            let (stream, _) = target.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let relay = ConnectionRelay::new(ExposureTarget::local(target_port), Duration::from_secs(2));
        let coordinator = ShutdownCoordinator::new();
        let (_outside, accepted) = connected_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let signal = coordinator.subscribe();
        let relay_clone = relay.clone();
        let handle = tokio::spawn(async move { relay_clone.relay(accepted, peer, signal).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.active_relays(), 1);
        coordinator.trigger();

        let stats = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(stats.cancelled);
        assert_eq!(relay.active_relays(), 0);
    }
}
