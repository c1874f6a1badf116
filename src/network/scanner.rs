//! Interface Scanner

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, trace};

use crate::error::{ExposeError, ExposeResult};

/// One address found on a host interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub address: IpAddr,
    pub is_loopback: bool,
    pub is_up: bool,
}

/// Anything that can list the host's interface addresses
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>>;
}

/// Reads interfaces from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

#[cfg(unix)]
impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;

        let mut found = Vec::new();
        for ifaddr in getifaddrs().map_err(io::Error::from)? {
            let Some(address) = ifaddr.address.as_ref().and_then(sockaddr_ip) else {
                continue;
            };
            found.push(NetworkInterface {
                name: ifaddr.interface_name.clone(),
                address,
                is_loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                is_up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
            });
        }
        Ok(found)
    }
}

#[cfg(not(unix))]
impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface enumeration is only implemented for unix hosts",
        ))
    }
}

#[cfg(unix)]
fn sockaddr_ip(addr: &nix::sys::socket::SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        let socket = std::net::SocketAddrV4::from(*v4);
        return Some(IpAddr::V4(*socket.ip()));
    }
    addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
}

/// Picks the interfaces a session should listen on
pub struct InterfaceScanner {
    source: Box<dyn InterfaceSource>,
}

impl InterfaceScanner {
    /// Scanner over the host's real interfaces
    pub fn new() -> Self {
        Self::with_source(SystemInterfaces)
    }

    /// Scanner over a custom interface source
    pub fn with_source<S: InterfaceSource + 'static>(source: S) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Up, non-loopback IPv4 interfaces in enumeration order, one entry per
    /// address. Fails with `NoInterface` if nothing qualifies.
    pub fn scan(&self) -> ExposeResult<Vec<NetworkInterface>> {
        let all = self.source.interfaces().map_err(ExposeError::InterfaceScan)?;

        let mut seen = HashSet::new();
        let mut usable = Vec::new();
        for iface in all {
            if !is_candidate(&iface) {
                trace!("Skipping {} on {}", iface.address, iface.name);
                continue;
            }
            if seen.insert(iface.address) {
                debug!("Candidate interface {} ({})", iface.name, iface.address);
                usable.push(iface);
            }
        }

        if usable.is_empty() {
            return Err(ExposeError::NoInterface);
        }
        Ok(usable)
    }

    /// Just the addresses from [`scan`](Self::scan)
    pub fn candidate_addresses(&self) -> ExposeResult<Vec<Ipv4Addr>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter_map(|iface| match iface.address {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

impl Default for InterfaceScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_candidate(iface: &NetworkInterface) -> bool {
    if !iface.is_up || iface.is_loopback {
        return false;
    }
    match iface.address {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified(),
        IpAddr::V6(_) => false,
    }
}
