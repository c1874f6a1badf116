//! Proxy Listener
//!
//! Accepts LAN clients on one address and hands each to its own relay task.
//! The accept loop stops on cancellation or on a fatal accept error, which is
//! reported to the session. In both cases the listener waits for the
//! session-wide cancellation and then joins every relay it spawned.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ExposeError;
use crate::relay::ConnectionRelay;
use crate::shutdown::ShutdownSignal;
use crate::target::ExposureTarget;

/// Back-off after a transient accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One bound listen address of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInstance {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub target: ExposureTarget,
}

impl ProxyInstance {
    /// Socket address this listener binds
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    /// URL a LAN client uses to reach the target through this listener
    pub fn url(&self) -> String {
        format!("{}://{}", self.target.scheme(), self.listen_addr())
    }
}

/// Where a listener takes its connections from
pub(crate) enum Incoming {
    Tcp(TcpListener),
    /// Accept results fed in by tests
    #[cfg(test)]
    Injected(mpsc::Receiver<io::Result<(TcpStream, SocketAddr)>>),
}

impl Incoming {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            Incoming::Tcp(listener) => listener.accept().await,
            #[cfg(test)]
            Incoming::Injected(rx) => match rx.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            },
        }
    }
}

/// A bound listener waiting to be run
pub(crate) struct ProxyListener {
    pub(crate) proxy: ProxyInstance,
    pub(crate) incoming: Incoming,
}

impl ProxyListener {
    /// Bind the real listener. This is the authoritative bind; failure here
    /// is fatal for the session.
    pub(crate) async fn bind(proxy: ProxyInstance) -> Result<Self, ExposeError> {
        let addr = proxy.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ExposeError::ListenFailed { addr, source })?;
        Ok(Self {
            proxy,
            incoming: Incoming::Tcp(listener),
        })
    }

    /// Accept until cancelled or a fatal error, then wait for the session to
    /// cancel and join every relay spawned here.
    pub(crate) async fn run(
        mut self,
        relay: ConnectionRelay,
        mut shutdown: ShutdownSignal,
        fatal_tx: mpsc::Sender<ExposeError>,
    ) {
        let addr = self.proxy.listen_addr();
        let mut relays = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                accepted = self.incoming.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted {} on {}", peer, addr);
                        let relay = relay.clone();
                        let signal = shutdown.clone();
                        relays.spawn(async move {
                            if let Err(e) = relay.relay(stream, peer, signal).await {
                                debug!("Relay for {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("Transient accept error on {}: {}", addr, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(source) => break Err(ExposeError::ListenerFailed { addr, source }),
                },
                Some(joined) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Relay task on {} ended abnormally: {}", addr, e);
                    }
                }
                _ = shutdown.cancelled() => break Ok(()),
            }
        };

        drop(self.incoming);
        debug!("Listener on {} closed", addr);

        if let Err(e) = outcome {
            error!("{}", e);
            if fatal_tx.send(e).await.is_err() {
                debug!("Session no longer waiting for listener errors");
            }
        }

        shutdown.cancelled().await;
        let in_flight = relays.len();
        if in_flight > 0 {
            info!("Waiting for {} relays on {} to close", in_flight, addr);
        }
        while let Some(joined) = relays.join_next().await {
            if let Err(e) = joined {
                warn!("Relay task on {} ended abnormally: {}", addr, e);
            }
        }
    }
}

/// Accept errors that concern one connection or a momentary resource
/// shortage rather than the listening socket itself
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => is_fd_exhaustion(e),
    }
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::errno::Errno::EMFILE as i32 || code == nix::errno::Errno::ENFILE as i32
    )
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_follows_target_port() {
        let ssh = ProxyInstance {
            listen_address: "10.0.0.5".parse().unwrap(),
            listen_port: 10002,
            target: ExposureTarget::new("172.17.0.3".parse::<IpAddr>().unwrap(), 22),
        };
        assert_eq!(ssh.url(), "ssh://10.0.0.5:10002");

        let web = ProxyInstance {
            target: ExposureTarget::local(8080),
            ..ssh
        };
        assert_eq!(web.url(), "http://10.0.0.5:10002");
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_exhaustion_is_transient() {
        let err = io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32);
        assert!(is_transient(&err));
    }

    #[tokio::test]
    async fn test_fatal_accept_error_is_reported() {
        let (accept_tx, accept_rx) = mpsc::channel(4);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let coordinator = crate::shutdown::ShutdownCoordinator::new();
        let proxy = ProxyInstance {
            listen_address: "127.0.0.1".parse().unwrap(),
            listen_port: 10002,
            target: ExposureTarget::local(9),
        };
        let listener = ProxyListener {
            proxy,
            incoming: Incoming::Injected(accept_rx),
        };
        let relay = ConnectionRelay::new(proxy.target, Duration::from_secs(1));
        let task = tokio::spawn(listener.run(relay, coordinator.subscribe(), fatal_tx));

        // Transient errors keep the loop alive
        accept_tx
            .send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .await
            .unwrap();
        accept_tx
            .send(Err(io::Error::from(io::ErrorKind::PermissionDenied)))
            .await
            .unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(2), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match reported {
            ExposeError::ListenerFailed { addr, source } => {
                assert_eq!(addr, proxy.listen_addr());
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error {}", other),
        }

        // The task waits for session cancellation before it returns
        assert!(!task.is_finished());
        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listen_failed() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let proxy = ProxyInstance {
            listen_address: "127.0.0.1".parse().unwrap(),
            listen_port: port,
            target: ExposureTarget::local(9),
        };
        match ProxyListener::bind(proxy).await {
            Err(ExposeError::ListenFailed { addr, .. }) => assert_eq!(addr.port(), port),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("bind should fail while the port is held"),
        }
    }
}
