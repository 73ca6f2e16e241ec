//! Network Module
//!
//! Datagram transport for the negotiation protocol. Sessions hand finished
//! messages to a [`Transport`]; inbound datagrams are decoded and pushed
//! into the engine's dispatch queue.

pub mod multicast;
pub mod udp;

#[cfg(test)]
pub(crate) mod memory;

pub use multicast::MulticastListener;
pub use udp::UdpTransport;

use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{Family, Message};

/// Datagram transport shared by every session of an engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start receiving on `local` unless a channel is already open there
    async fn open(&self, local: SocketAddr) -> Result<()>;

    /// Send `msg` from `msg.local` to `msg.remote`
    async fn send(&self, msg: &Message) -> Result<()>;

    /// Stop every receiver
    async fn close(&self) {}
}

/// Addresses of `family` assigned to this host.
///
/// Loopback and link-local addresses are skipped. When `interfaces` is not
/// empty only those NICs are considered.
pub fn local_addresses(family: Family, interfaces: &[String]) -> Result<Vec<IpAddr>> {
    let ifaddrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Network(format!("Failed to list interface addresses: {}", e)))?;

    let mut found = Vec::new();
    for ifaddr in ifaddrs {
        if !interfaces.is_empty() && !interfaces.iter().any(|i| *i == ifaddr.interface_name) {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };

        let ip = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(*SocketAddrV4::from(*sin).ip())
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
        } else {
            continue;
        };

        if Family::of(&ip) == family && is_usable(&ip) && !found.contains(&ip) {
            found.push(ip);
        }
    }

    tracing::debug!("Local {} addresses: {:?}", family, found);
    Ok(found)
}

/// Whether an address can carry negotiation traffic
pub fn is_usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}
