//! Multicast Discovery Listener
//!
//! Clients without a configured peer send their Discover/Solicit to the
//! family multicast group. This listener joins the group, turns each
//! discover into a unicast-looking message addressed to one of our local
//! addresses and hands it to the dispatcher.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

use crate::config::FamilySettings;
use crate::engine::DispatchItem;
use crate::error::{Error, Result};
use crate::protocol::{Family, Message, MessageType, OptionCode};
use crate::state::TunnelRegistry;

/// How often the receive loop checks the running flag
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Joined multicast socket feeding the dispatcher
pub struct MulticastListener {
    inbound: Arc<Inbound>,
    buffer_size: usize,
    queue: mpsc::Sender<DispatchItem>,
    running: Arc<RwLock<bool>>,
}

impl MulticastListener {
    pub fn new(
        settings: &FamilySettings,
        local_addrs: Vec<IpAddr>,
        registry: Arc<TunnelRegistry>,
        queue: mpsc::Sender<DispatchItem>,
    ) -> Self {
        Self {
            inbound: Arc::new(Inbound::new(settings, local_addrs, registry)),
            buffer_size: settings.buffer_size,
            queue,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Bind to the group, join it on every local address and start receiving
    pub async fn start(&self) -> Result<tokio::task::JoinHandle<()>> {
        let group = self.inbound.group;
        let socket = UdpSocket::bind(group)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind multicast socket {}: {}", group.ip(), e)))?;

        match group.ip() {
            IpAddr::V4(group) => {
                for addr in &self.inbound.local_addrs {
                    if let IpAddr::V4(iface) = addr {
                        if let Err(e) = socket.join_multicast_v4(group, *iface) {
                            tracing::warn!("Could not join {} on {}: {}", group, iface, e);
                        }
                    }
                }
            }
            IpAddr::V6(group) => {
                socket
                    .join_multicast_v6(&group, 0)
                    .map_err(|e| Error::Network(format!("Failed to join {}: {}", group, e)))?;
            }
        }

        *self.running.write().await = true;
        tracing::info!("{} multicast discovery listening on {}", self.inbound.family, group);

        let inbound = Arc::clone(&self.inbound);
        let queue = self.queue.clone();
        let running = Arc::clone(&self.running);
        let mut buf = vec![0u8; self.buffer_size];

        Ok(tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }

                // Use timeout to periodically check running flag
                let (len, src) = match tokio::time::timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        tracing::trace!("Multicast recv error: {}", e);
                        continue;
                    }
                    Err(_) => continue,
                };

                if let Some(msg) = inbound.accept(&buf[..len], src).await {
                    if queue.send(DispatchItem::Message(msg)).await.is_err() {
                        break;
                    }
                }
            }
        }))
    }

    /// Stop the listener task
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

/// Per-datagram filtering and address rewriting
pub(crate) struct Inbound {
    family: Family,
    group: SocketAddr,
    port: u16,
    local_addrs: Vec<IpAddr>,
    registry: Arc<TunnelRegistry>,
}

impl Inbound {
    pub(crate) fn new(settings: &FamilySettings, local_addrs: Vec<IpAddr>, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            family: settings.family,
            group: SocketAddr::new(settings.multicast_group, settings.port),
            port: settings.port,
            local_addrs,
            registry,
        }
    }

    pub(crate) async fn accept(&self, bytes: &[u8], src: SocketAddr) -> Option<Message> {
        // Skip our own sends
        if self.local_addrs.contains(&src.ip()) {
            return None;
        }

        let mut msg = match Message::decode(self.family, bytes, self.group, src) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Dropping multicast datagram from {}: {}", src, e);
                return None;
            }
        };

        // Replies go to the sender's protocol socket, not its ephemeral one
        if let (Some(phys), Some(port)) = (
            msg.get_ip(OptionCode::RemotePhysAddr),
            msg.get_u32(OptionCode::RemotePhysComPort),
        ) {
            if self.local_addrs.contains(&phys) {
                return None;
            }
            msg.remote = SocketAddr::new(phys, port as u16);
        } else if msg.message_type() != Some(MessageType::InfoRequest) {
            tracing::debug!("Multicast {} is missing its physical address options", msg.describe());
            return None;
        }

        let local = self.pick_local(msg.remote.ip(), msg.message_type()).await?;
        msg.local = SocketAddr::new(local, self.port);
        if let (Some(header), IpAddr::V4(v4)) = (msg.v4_header_mut(), local) {
            header.server_addr = v4;
            header.server_port = self.port as u32;
        }

        tracing::debug!("Multicast {}", msg.describe());
        Some(msg)
    }

    /// First local address that has no tunnel to `remote` yet
    async fn pick_local(&self, remote: IpAddr, msg_type: Option<MessageType>) -> Option<IpAddr> {
        for local in &self.local_addrs {
            if msg_type == Some(MessageType::InfoRequest) {
                return Some(*local);
            }
            if self.registry.find_by_phys_pair(*local, remote).await.is_none() {
                return Some(*local);
            }
            tracing::debug!("Already have a tunnel {} <-> {}, ignoring discover", local, remote);
        }
        None
    }
}
