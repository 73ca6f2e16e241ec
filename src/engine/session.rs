//! Peer State Machine
//!
//! A session negotiates one tunnel with one peer. The client drives
//! Discover, Request and Tunnel Ping and waits for Offer, Ack and Tunnel
//! Ping Reply; the server does the opposite. Each message sent starts a
//! reply deadline. When it passes the message is sent once more, and when
//! the second deadline passes the session gives up.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::EngineContext;
use crate::device::{Interface, PeerConfig};
use crate::error::{Error, Result};
use crate::protocol::{Family, GenericResponse, Message, MessageType, OptionCode, Sender};
use crate::tunnel::{EndpointType, TunnelField, TunnelNetwork, TunnelRecord, TunnelState};

/// Options a Discover/Solicit must carry
const DISCOVER_REQUIRED: &[OptionCode] = &[
    OptionCode::GenericId,
    OptionCode::SpecificInfo,
    OptionCode::RemotePhysAddr,
    OptionCode::RemotePhysComPort,
    OptionCode::RemoteTunnelAddr,
    OptionCode::TunnelNetwork,
];

/// Options an accepting Offer/Advertise must carry
const OFFER_REQUIRED: &[OptionCode] = &[
    OptionCode::TunnelId,
    OptionCode::RemoteWgPublicKey,
    OptionCode::RemotePhysListenPort,
    OptionCode::RemoteTunnelAddr,
    OptionCode::LocalTunnelAddr,
    OptionCode::TunnelNetwork,
];

/// Options an accepting Request must carry
const REQUEST_REQUIRED: &[OptionCode] = &[
    OptionCode::RemoteWgPublicKey,
    OptionCode::RemotePhysListenPort,
];

const PING_REQUIRED: &[OptionCode] = &[
    OptionCode::TunnelId,
    OptionCode::PingAddr,
    OptionCode::PingPort,
];

/// Placeholder for string options that carry nothing
const BLANK: &str = " ";

pub(crate) struct Session {
    ctx: Arc<EngineContext>,
    role: EndpointType,
    xid: u32,
    /// Local protocol socket
    local: SocketAddr,
    /// Peer protocol socket, or the multicast group until a server answers
    remote: SocketAddr,
    network: TunnelNetwork,
    inbox: mpsc::Receiver<Message>,
    last_sent: Option<Message>,
    last_received: Option<MessageType>,
    /// Reply deadline of `last_sent`
    deadline: Instant,
    retried: bool,
    tunnel: Option<Uuid>,
}

impl Session {
    /// Client session from `local` to `remote` (multicast when `None`)
    pub(crate) fn client(
        ctx: Arc<EngineContext>,
        local: IpAddr,
        remote: Option<IpAddr>,
        inbox: mpsc::Receiver<Message>,
    ) -> Self {
        let remote = remote.unwrap_or(ctx.settings.multicast_group);
        Self {
            role: EndpointType::Client,
            xid: ctx.machine_id,
            local: ctx.protocol_addr(local),
            remote: ctx.protocol_addr(remote),
            network: ctx.settings.tunnel_network,
            inbox,
            last_sent: None,
            last_received: None,
            deadline: Instant::now(),
            retried: false,
            tunnel: None,
            ctx,
        }
    }

    /// Server session answering the discover `first`
    pub(crate) fn server(ctx: Arc<EngineContext>, first: &Message, inbox: mpsc::Receiver<Message>) -> Self {
        Self {
            role: EndpointType::Server,
            xid: first.xid,
            local: first.local,
            remote: first.remote,
            network: ctx.settings.tunnel_network,
            inbox,
            last_sent: None,
            last_received: None,
            deadline: Instant::now(),
            retried: false,
            tunnel: None,
            ctx,
        }
    }

    fn family(&self) -> Family {
        self.ctx.family()
    }

    fn port(&self) -> u16 {
        self.ctx.settings.port
    }

    fn sender(&self) -> Sender {
        match self.role {
            EndpointType::Client => Sender::Client,
            EndpointType::Server => Sender::Server,
        }
    }

    /// Empty message of this session between the protocol sockets
    fn message(&self, msg_type: MessageType) -> Message {
        let mut msg = Message::new(self.family(), msg_type, self.sender(), self.xid, self.local, self.remote);
        msg.put_str(OptionCode::GenericId, self.ctx.machine_id.to_string());
        msg
    }

    async fn send(&mut self, msg: Message) {
        tracing::debug!("Sending {}", msg.describe());
        if let Err(e) = self.ctx.transport.send(&msg).await {
            tracing::warn!("Failed to send {}: {}", msg.describe(), e);
        }
        self.last_sent = Some(msg);
        self.deadline = Instant::now() + self.ctx.settings.reply_timeout;
        self.retried = false;
    }

    async fn resend(&self) {
        if let Some(msg) = &self.last_sent {
            tracing::debug!("Resending {}", msg.describe());
            if let Err(e) = self.ctx.transport.send(msg).await {
                tracing::warn!("Failed to resend {}: {}", msg.describe(), e);
            }
        }
    }

    /// Wait for the next `expected` message carrying `required`.
    ///
    /// Invalid messages are dropped without moving the deadline. A repeat of
    /// the message we last answered is answered again. The first timeout
    /// resends the last message, the second ends the session.
    async fn wait_for(&mut self, expected: MessageType, required: &[OptionCode]) -> Result<Message> {
        let timeout = self.ctx.settings.reply_timeout;

        loop {
            let msg = match tokio::time::timeout_at(self.deadline, self.inbox.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(Error::ShuttingDown),
                Err(_) if self.retried => {
                    return Err(Error::Protocol(format!(
                        "no {} from {} after one retry",
                        expected.name(self.family()),
                        self.remote
                    )));
                }
                Err(_) => {
                    tracing::warn!(
                        "No {} from {} within {:?}, retrying",
                        expected.name(self.family()),
                        self.remote,
                        timeout
                    );
                    self.retried = true;
                    self.resend().await;
                    self.deadline = Instant::now() + timeout;
                    continue;
                }
            };

            let msg_type = msg.message_type();
            if msg_type != Some(expected) {
                if msg_type.is_some() && msg_type == self.last_received {
                    self.resend().await;
                } else {
                    tracing::debug!("Unexpected {} while waiting for {:?}", msg.describe(), expected);
                }
                continue;
            }

            if let Some(missing) = msg.first_missing(required) {
                tracing::debug!("Dropping {}: missing option {}", msg.describe(), missing);
                continue;
            }

            if let (Some(ours), Some(theirs)) = (self.tunnel, msg.get_str(OptionCode::TunnelId)) {
                if theirs.trim() != ours.to_string() {
                    tracing::debug!("Dropping {}: tunnel {} is not ours", msg.describe(), theirs);
                    continue;
                }
            }

            tracing::debug!("Received {}", msg.describe());
            self.last_received = Some(expected);
            return Ok(msg);
        }
    }

    // ---- client ------------------------------------------------------

    pub(crate) async fn run_client(mut self) -> Result<()> {
        self.network = self.ctx.current_network().await;
        let local_phys = self.local.ip();
        let mut local_tunnel = self.network.host_address(local_phys)?;
        let mut reuse = self.ctx.registry.find_interface(local_phys, &self.network).await;

        tracing::info!(
            "{} client negotiating {} from {} with {}",
            self.family(),
            self.network,
            self.local,
            self.remote
        );
        let discover = self.discover(local_tunnel, reuse.as_ref());
        self.send(discover).await;

        let offer = loop {
            let offer = self.wait_for(MessageType::Offer, &[OptionCode::GenericResponse]).await?;

            match offer.get_u32(OptionCode::GenericResponse).and_then(GenericResponse::from_code) {
                Some(GenericResponse::Accept) => {}
                Some(GenericResponse::DeclineRedundantTunnel) => {
                    tracing::info!("{} already has a tunnel with {}", offer.remote, self.local);
                    return Ok(());
                }
                Some(GenericResponse::DeclineRedundantPublicKey) => {
                    local_tunnel = self.advance_network().await?;
                    reuse = self.ctx.registry.find_interface(local_phys, &self.network).await;
                    let discover = self.discover(local_tunnel, reuse.as_ref());
                    self.send(discover).await;
                    continue;
                }
                other => {
                    tracing::debug!("Ignoring offer from {} ({:?})", offer.remote, other);
                    continue;
                }
            }

            if let Some(missing) = offer.first_missing(OFFER_REQUIRED) {
                tracing::debug!("Dropping {}: missing option {}", offer.describe(), missing);
                continue;
            }

            if self.remote.ip().is_multicast() {
                tracing::info!("Server {} answered multicast discovery", offer.remote);
                self.remote = offer.remote;
            }

            // the server's key must not already back one of our tunnels
            let server_key = offer.get_str(OptionCode::RemoteWgPublicKey).unwrap_or_default();
            if let Some(existing) = self.ctx.registry.find_by_remote_public_key(server_key).await {
                tracing::info!(
                    "Offered key of {} already backs tunnel {}, proposing another network",
                    offer.remote,
                    existing.id
                );
                local_tunnel = self.advance_network().await?;
                let mut decline = self.message(MessageType::Request);
                decline
                    .put_u32(OptionCode::GenericResponse, GenericResponse::DeclineRedundantPublicKey.code())
                    .put_str(OptionCode::TunnelId, offer.get_str(OptionCode::TunnelId).unwrap_or_default())
                    .put_str(OptionCode::TunnelNetwork, self.network.to_string())
                    .put_u32(OptionCode::RemotePhysListenPort, 0)
                    .put_u32(OptionCode::RemoteTunnelComPort, 0)
                    .put_str(OptionCode::RemoteWgPublicKey, BLANK)
                    .put_str(OptionCode::InterfaceName, BLANK);
                self.send(decline).await;
                continue;
            }

            break offer;
        };

        let tunnel_id = parse_tunnel_id(&offer)?;
        let network = parse_network(&offer)?;
        if network != self.network {
            tracing::info!("Adopting tunnel network {} from {}", network, self.remote);
            self.network = network;
        }
        if let Some(addr) = offer.get_ip(OptionCode::LocalTunnelAddr) {
            local_tunnel = addr;
        }

        let iface = match self.provision_interface(local_tunnel).await {
            Ok(iface) => iface,
            Err(e) => return self.fail(e).await,
        };

        let record = TunnelRecord {
            id: tunnel_id,
            remote_id: parse_generic_id(&offer),
            family: self.family(),
            local_endpoint_type: EndpointType::Client,
            remote_endpoint_type: EndpointType::Server,
            local_phys_addr: local_phys,
            local_phys_listen_port: iface.listen_port,
            local_phys_com_port: self.port(),
            remote_phys_addr: self.remote.ip(),
            remote_phys_listen_port: port_option(&offer, OptionCode::RemotePhysListenPort).unwrap_or(0),
            remote_phys_com_port: port_option(&offer, OptionCode::RemotePhysComPort)
                .unwrap_or(self.remote.port()),
            tunnel_network: self.network,
            local_tunnel_addr: local_tunnel,
            local_tunnel_com_port: self.port(),
            remote_tunnel_addr: offer
                .get_ip(OptionCode::RemoteTunnelAddr)
                .ok_or_else(|| Error::Protocol("offer without server tunnel address".into()))?,
            remote_tunnel_com_port: port_option(&offer, OptionCode::RemoteTunnelComPort)
                .unwrap_or(self.port()),
            local_interface_name: iface.name.clone(),
            remote_interface_name: offer.get_str(OptionCode::InterfaceName).unwrap_or_default().to_string(),
            local_public_key: iface.public_key.clone(),
            local_private_key: iface.private_key.clone(),
            remote_public_key: server_key_of(&offer),
            keepalive: self.ctx.settings.keepalive,
            state: TunnelState::after(self.family(), MessageType::Offer),
            updated_at: Utc::now(),
        };
        self.add_tunnel(record.clone()).await?;
        if let Err(e) = self.install_peer(&record).await {
            return self.fail(e).await;
        }

        let mut request = self.message(MessageType::Request);
        request
            .put_u32(OptionCode::GenericResponse, GenericResponse::Accept.code())
            .put_str(OptionCode::TunnelId, tunnel_id.to_string())
            .put_u32(OptionCode::RemotePhysListenPort, iface.listen_port as u32)
            .put_u32(OptionCode::RemoteTunnelComPort, self.port() as u32)
            .put_str(OptionCode::RemoteWgPublicKey, iface.public_key.clone())
            .put_str(OptionCode::InterfaceName, iface.name.clone())
            .put_str(OptionCode::TunnelNetwork, self.network.to_string())
            .put_u32(OptionCode::KeepalivePolicy, self.ctx.settings.keepalive as u32);
        self.send(request).await;
        self.set_state(TunnelState::Request).await;

        self.wait_for(MessageType::Ack, &[OptionCode::TunnelId]).await?;
        self.set_state(TunnelState::after(self.family(), MessageType::Ack)).await;

        // liveness check over the tunnel addresses
        self.ctx.transport.open(record.local_tunnel_sock_addr()).await?;
        let mut ping = Message::new(
            self.family(),
            MessageType::TunnelPing,
            Sender::Client,
            self.xid,
            record.local_tunnel_sock_addr(),
            record.remote_tunnel_sock_addr(),
        );
        ping.put_str(OptionCode::TunnelId, tunnel_id.to_string())
            .put_ip(OptionCode::PingAddr, local_tunnel)
            .put_u32(OptionCode::PingPort, self.port() as u32);
        self.send(ping).await;
        self.set_state(TunnelState::TunnelPing).await;

        self.wait_for(MessageType::TunnelPingReply, &[OptionCode::TunnelId]).await?;
        self.set_state(TunnelState::Up).await;
        tracing::info!(
            "Tunnel {} is up: {} <-> {} on {}",
            tunnel_id,
            local_tunnel,
            record.remote_tunnel_addr,
            record.local_interface_name
        );
        Ok(())
    }

    fn discover(&self, local_tunnel: IpAddr, reuse: Option<&Interface>) -> Message {
        let mut msg = self.message(MessageType::Discover);
        msg.put_str(OptionCode::SpecificInfo, BLANK)
            .put_ip(OptionCode::RemotePhysAddr, self.local.ip())
            .put_u32(OptionCode::RemotePhysComPort, self.local.port() as u32)
            .put_ip(OptionCode::RemoteTunnelAddr, local_tunnel)
            .put_str(OptionCode::TunnelNetwork, self.network.to_string());
        if let Some(iface) = reuse {
            msg.put_str(OptionCode::GenericPublicKey, iface.public_key.clone());
        }
        msg
    }

    /// Move to the next tunnel network whose local address is free
    async fn advance_network(&mut self) -> Result<IpAddr> {
        let local_phys = self.local.ip();
        let mut taken = self.ctx.registry.tunnel_addresses(self.family()).await;
        taken.extend(self.ctx.local_addrs.iter().copied());

        let next = self.network.next_free(|candidate| {
            candidate
                .host_address(local_phys)
                .map_or(true, |addr| taken.contains(&addr))
        })?;
        tracing::info!("Tunnel network {} declined, proposing {}", self.network, next);
        self.network = next;
        next.host_address(local_phys)
    }

    // ---- server ------------------------------------------------------

    pub(crate) async fn run_server(mut self, first: Message) -> Result<()> {
        if let Some(missing) = first.first_missing(DISCOVER_REQUIRED) {
            tracing::debug!("Ignoring {}: missing option {}", first.describe(), missing);
            return Ok(());
        }
        self.last_received = Some(MessageType::Discover);
        self.network = self.ctx.current_network().await;
        tracing::info!("{} server negotiating with {} on {}", self.family(), self.remote, self.local);

        let mut discover = first;
        loop {
            let client_tunnel = discover
                .get_ip(OptionCode::RemoteTunnelAddr)
                .ok_or_else(|| Error::Protocol("discover without tunnel address".into()))?;

            if let Some(existing) = self
                .ctx
                .registry
                .find_by_remote_phys_and_tunnel(self.remote.ip(), client_tunnel)
                .await
            {
                tracing::info!("Tunnel {} already connects {}, declining", existing.id, self.remote);
                let mut offer = self.message(MessageType::Offer);
                offer
                    .put_u32(OptionCode::GenericResponse, GenericResponse::DeclineRedundantTunnel.code())
                    .put_str(OptionCode::TunnelId, existing.id.to_string());
                self.send(offer).await;
                return Ok(());
            }

            let key = discover.get_str(OptionCode::GenericPublicKey).unwrap_or_default();
            if let Some(existing) = self.ctx.registry.find_by_remote_public_key(key).await {
                tracing::info!("Key of {} already backs tunnel {}, declining", self.remote, existing.id);
                let mut offer = self.message(MessageType::Offer);
                offer.put_u32(
                    OptionCode::GenericResponse,
                    GenericResponse::DeclineRedundantPublicKey.code(),
                );
                self.send(offer).await;
                discover = self.wait_for(MessageType::Discover, DISCOVER_REQUIRED).await?;
                continue;
            }

            break;
        }

        let proposed = parse_network(&discover)?;
        if proposed != self.network {
            self.network = proposed;
            self.ctx.adopt_network(proposed).await;
        }
        let remote_id = parse_generic_id(&discover);
        let client_tunnel = discover
            .get_ip(OptionCode::RemoteTunnelAddr)
            .ok_or_else(|| Error::Protocol("discover without tunnel address".into()))?;

        let mut record = match self.create_server_tunnel(client_tunnel, remote_id).await {
            Ok(record) => record,
            Err(e) => return self.fail(e).await,
        };
        let offer = self.offer(&record);
        self.send(offer).await;

        let request = loop {
            let request = self
                .wait_for(MessageType::Request, &[OptionCode::GenericResponse, OptionCode::TunnelId])
                .await?;

            match request.get_u32(OptionCode::GenericResponse).and_then(GenericResponse::from_code) {
                Some(GenericResponse::Accept) => {
                    if let Some(missing) = request.first_missing(REQUEST_REQUIRED) {
                        tracing::debug!("Dropping {}: missing option {}", request.describe(), missing);
                        continue;
                    }
                    break request;
                }
                Some(GenericResponse::DeclineRedundantPublicKey) => {
                    let proposed = parse_network(&request)?;
                    tracing::info!("{} asked for tunnel network {} instead", self.remote, proposed);
                    self.remove_tunnel(&record).await;
                    self.network = proposed;
                    self.ctx.adopt_network(proposed).await;

                    let client_tunnel = proposed.host_address(self.remote.ip())?;
                    record = match self.create_server_tunnel(client_tunnel, remote_id).await {
                        Ok(record) => record,
                        Err(e) => return self.fail(e).await,
                    };
                    let offer = self.offer(&record);
                    self.send(offer).await;
                }
                other => {
                    tracing::info!("{} declined tunnel {} ({:?})", self.remote, record.id, other);
                    self.remove_tunnel(&record).await;
                    return Ok(());
                }
            }
        };

        let keepalive = port_option(&request, OptionCode::KeepalivePolicy)
            .unwrap_or(0)
            .max(self.ctx.settings.keepalive);
        let client_key = server_key_of(&request);
        let listen_port = port_option(&request, OptionCode::RemotePhysListenPort).unwrap_or(0);
        let com_port = port_option(&request, OptionCode::RemoteTunnelComPort).unwrap_or(self.port());
        let iface_name = request.get_str(OptionCode::InterfaceName).unwrap_or_default().to_string();
        let record = self
            .update_tunnel(
                &[
                    TunnelField::RemotePublicKey,
                    TunnelField::RemoteListenPort,
                    TunnelField::RemoteInterfaceName,
                    TunnelField::Keepalive,
                ],
                |t| {
                    t.remote_public_key = client_key;
                    t.remote_phys_listen_port = listen_port;
                    t.remote_tunnel_com_port = com_port;
                    t.remote_interface_name = iface_name;
                    t.keepalive = keepalive;
                },
            )
            .await
            .ok_or_else(|| Error::Internal(format!("tunnel {} vanished", record.id)))?;

        if let Err(e) = self.install_peer(&record).await {
            return self.fail(e).await;
        }

        let mut ack = self.message(MessageType::Ack);
        ack.put_str(OptionCode::TunnelId, record.id.to_string())
            .put_u32(OptionCode::GenericResponse, GenericResponse::Accept.code());
        self.send(ack).await;
        self.set_state(TunnelState::after(self.family(), MessageType::Ack)).await;

        let ping = self.wait_for(MessageType::TunnelPing, PING_REQUIRED).await?;
        self.set_state(TunnelState::Up).await;

        let reply_to = SocketAddr::new(
            ping.get_ip(OptionCode::PingAddr).unwrap_or(record.remote_tunnel_addr),
            port_option(&ping, OptionCode::PingPort).unwrap_or(record.remote_tunnel_com_port),
        );
        let mut reply = Message::new(
            self.family(),
            MessageType::TunnelPingReply,
            Sender::Server,
            self.xid,
            record.local_tunnel_sock_addr(),
            reply_to,
        );
        reply.put_str(OptionCode::TunnelId, record.id.to_string());
        self.send(reply).await;

        tracing::info!(
            "Tunnel {} is up: {} <-> {} on {}",
            record.id,
            record.local_tunnel_addr,
            record.remote_tunnel_addr,
            record.local_interface_name
        );
        Ok(())
    }

    async fn create_server_tunnel(&mut self, client_tunnel: IpAddr, remote_id: u32) -> Result<TunnelRecord> {
        let local_phys = self.local.ip();
        let local_tunnel = self.network.host_address(local_phys)?;
        let iface = self.provision_interface(local_tunnel).await?;

        let record = TunnelRecord {
            id: Uuid::new_v4(),
            remote_id,
            family: self.family(),
            local_endpoint_type: EndpointType::Server,
            remote_endpoint_type: EndpointType::Client,
            local_phys_addr: local_phys,
            local_phys_listen_port: iface.listen_port,
            local_phys_com_port: self.port(),
            remote_phys_addr: self.remote.ip(),
            remote_phys_listen_port: 0,
            remote_phys_com_port: self.remote.port(),
            tunnel_network: self.network,
            local_tunnel_addr: local_tunnel,
            local_tunnel_com_port: self.port(),
            remote_tunnel_addr: client_tunnel,
            remote_tunnel_com_port: self.port(),
            local_interface_name: iface.name,
            remote_interface_name: String::new(),
            local_public_key: iface.public_key,
            local_private_key: iface.private_key,
            remote_public_key: String::new(),
            keepalive: self.ctx.settings.keepalive,
            state: TunnelState::after(self.family(), MessageType::Offer),
            updated_at: Utc::now(),
        };
        self.add_tunnel(record.clone()).await?;

        if let Err(e) = self.ctx.transport.open(record.local_tunnel_sock_addr()).await {
            tracing::warn!("Cannot receive tunnel pings on {}: {}", record.local_tunnel_sock_addr(), e);
        }
        Ok(record)
    }

    fn offer(&self, record: &TunnelRecord) -> Message {
        let mut offer = self.message(MessageType::Offer);
        offer
            .put_str(OptionCode::TunnelId, record.id.to_string())
            .put_str(OptionCode::RemoteWgPublicKey, record.local_public_key.clone())
            .put_ip(OptionCode::RemotePhysAddr, record.local_phys_addr)
            .put_u32(OptionCode::RemotePhysComPort, record.local_phys_com_port as u32)
            .put_u32(OptionCode::RemotePhysListenPort, record.local_phys_listen_port as u32)
            .put_ip(OptionCode::RemoteTunnelAddr, record.local_tunnel_addr)
            .put_u32(OptionCode::RemoteTunnelComPort, record.local_tunnel_com_port as u32)
            .put_ip(OptionCode::LocalTunnelAddr, record.remote_tunnel_addr)
            .put_str(OptionCode::InterfaceName, record.local_interface_name.clone())
            .put_str(OptionCode::TunnelNetwork, record.tunnel_network.to_string())
            .put_u32(OptionCode::GenericResponse, GenericResponse::Accept.code());
        offer
    }

    // ---- shared ------------------------------------------------------

    /// Reuse the interface serving this network or create a new one
    async fn provision_interface(&self, local_tunnel: IpAddr) -> Result<Interface> {
        let local_phys = self.local.ip();
        if let Some(iface) = self.ctx.registry.find_interface(local_phys, &self.network).await {
            tracing::debug!("Reusing {} for {}", iface.name, self.network);
            return Ok(iface);
        }

        let device = &self.ctx.device;
        let name = self.ctx.allocate_interface_name().await;
        if let Err(e) = device.create_interface(&name).await {
            self.ctx.release_interface_name(&name).await;
            return Err(e);
        }
        let configured = async {
            let keys = device.generate_key_pair().await?;
            device
                .set_interface_address(&name, local_tunnel, self.network.effective_prefix_len())
                .await?;
            device.set_private_key(&name, &keys.private_key).await?;
            device.bring_up(&name).await?;
            let listen_port = device.listen_port(&name).await?;
            Ok::<_, Error>((keys, listen_port))
        }
        .await;
        let (keys, listen_port) = match configured {
            Ok(configured) => configured,
            Err(e) => {
                if let Err(cleanup) = device.delete_interface(&name).await {
                    tracing::warn!("Failed to delete half-configured {}: {}", name, cleanup);
                }
                self.ctx.release_interface_name(&name).await;
                return Err(e);
            }
        };

        tracing::info!(
            "Created {} with {}/{} listening on {}",
            name,
            local_tunnel,
            self.network.effective_prefix_len(),
            listen_port
        );
        Ok(Interface {
            name,
            public_key: keys.public_key,
            private_key: keys.private_key,
            listen_port,
        })
    }

    async fn install_peer(&self, record: &TunnelRecord) -> Result<()> {
        let peer = PeerConfig {
            public_key: record.remote_public_key.clone(),
            allowed_ip: record.remote_tunnel_addr,
            allowed_prefix_len: record.tunnel_network.host_prefix_len(),
            endpoint: record.remote_endpoint(),
            keepalive: record.keepalive,
        };
        self.ctx.device.set_peer(&record.local_interface_name, &peer).await
    }

    async fn add_tunnel(&mut self, record: TunnelRecord) -> Result<()> {
        if let Err(existing) = self.ctx.registry.try_insert(record.clone()).await {
            return Err(Error::Protocol(format!(
                "tunnel {} conflicts with tunnel {}",
                record.id, existing.id
            )));
        }
        self.tunnel = Some(record.id);

        if let Err(e) = self.ctx.store.insert(&record).await {
            tracing::warn!("Failed to persist tunnel {}: {}", record.id, e);
        }
        self.ctx.notifier.tunnel_added(&record);
        Ok(())
    }

    async fn remove_tunnel(&mut self, record: &TunnelRecord) {
        self.ctx.registry.remove(&record.id).await;
        self.tunnel = None;

        if let Err(e) = self.ctx.store.remove(&record.id).await {
            tracing::warn!("Failed to forget tunnel {}: {}", record.id, e);
        }
        if !record.remote_public_key.trim().is_empty() {
            if let Err(e) = self
                .ctx
                .device
                .remove_peer(&record.local_interface_name, &record.remote_public_key)
                .await
            {
                tracing::warn!("Failed to remove peer of tunnel {}: {}", record.id, e);
            }
        }
        tracing::debug!("Removed provisional tunnel {}", record.id);
    }

    async fn update_tunnel<F>(&self, fields: &[TunnelField], f: F) -> Option<TunnelRecord>
    where
        F: FnOnce(&mut TunnelRecord),
    {
        let id = self.tunnel?;
        let record = self.ctx.registry.update(&id, f).await?;
        if let Err(e) = self.ctx.store.update(&record).await {
            tracing::warn!("Failed to persist tunnel {}: {}", id, e);
        }
        self.ctx.notifier.tunnel_state_changed(&record, fields);
        Some(record)
    }

    async fn set_state(&self, state: TunnelState) {
        self.update_tunnel(&[TunnelField::State], |t| t.state = state).await;
    }

    /// End the session; device failures leave the tunnel marked
    async fn fail(&self, e: Error) -> Result<()> {
        if matches!(e, Error::Device { .. }) {
            self.set_state(TunnelState::PeerConfigError).await;
        }
        Err(e)
    }
}

fn parse_tunnel_id(msg: &Message) -> Result<Uuid> {
    let raw = msg.get_str(OptionCode::TunnelId).unwrap_or_default();
    Uuid::parse_str(raw.trim()).map_err(|e| Error::Protocol(format!("invalid tunnel id {:?}: {}", raw, e)))
}

fn parse_network(msg: &Message) -> Result<TunnelNetwork> {
    msg.get_str(OptionCode::TunnelNetwork)
        .ok_or_else(|| Error::Protocol(format!("{} carries no tunnel network", msg.describe())))?
        .trim()
        .parse()
}

fn parse_generic_id(msg: &Message) -> u32 {
    msg.get_str(OptionCode::GenericId)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn port_option(msg: &Message, code: OptionCode) -> Option<u16> {
    msg.get_u32(code).and_then(|v| u16::try_from(v).ok())
}

/// Sender's WireGuard key, blank when absent
fn server_key_of(msg: &Message) -> String {
    msg.get_str(OptionCode::RemoteWgPublicKey)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::engine::tests::{settings, Node, CLIENT, SERVER};
    use crate::engine::DispatchItem;
    use crate::network::memory::MemoryNetwork;

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_session_retries_once() {
        let net = MemoryNetwork::new();
        let timeout = Duration::from_secs(30);
        let client = Node::start(&net, CLIENT, 42, settings(timeout)).await;

        let started = Instant::now();
        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        while client.engine.stats().finished() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout * 2, "gave up after {:?}", elapsed);
        assert!(elapsed < timeout * 2 + Duration::from_millis(100), "gave up after {:?}", elapsed);
        let discovers = net.sent_of(MessageType::Discover);
        assert_eq!(discovers.len(), 2);
        assert_eq!(discovers[0], discovers[1]);
        assert_eq!(client.engine.stats().spawned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_reply_keeps_deadline() {
        let net = MemoryNetwork::new();
        let timeout = Duration::from_secs(30);
        let client = Node::start(&net, CLIENT, 42, settings(timeout)).await;
        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // an accepting offer without any of the tunnel options
        let mut offer = Message::new(
            Family::V4,
            MessageType::Offer,
            Sender::Server,
            42,
            SocketAddr::new(CLIENT.parse().unwrap(), 268),
            SocketAddr::new(SERVER.parse().unwrap(), 268),
        );
        offer.put_u32(OptionCode::GenericResponse, 0);
        client.queue.send(DispatchItem::Message(offer)).await.unwrap();

        // still two discovers in total and the session ends on schedule
        let started = Instant::now();
        while client.engine.stats().finished() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started.elapsed() < timeout * 2);
        assert_eq!(net.sent_of(MessageType::Discover).len(), 2);
        assert!(client.registry.is_empty().await);
    }

    #[test]
    fn test_option_helpers() {
        let mut msg = Message::new(
            Family::V4,
            MessageType::Request,
            Sender::Client,
            1,
            "10.0.0.1:268".parse().unwrap(),
            "10.0.0.2:268".parse().unwrap(),
        );
        msg.put_u32(OptionCode::RemotePhysListenPort, 70000)
            .put_u32(OptionCode::PingPort, 268)
            .put_str(OptionCode::GenericId, " 42 ")
            .put_str(OptionCode::TunnelNetwork, "10.1.0.0/16");

        assert_eq!(port_option(&msg, OptionCode::RemotePhysListenPort), None);
        assert_eq!(port_option(&msg, OptionCode::PingPort), Some(268));
        assert_eq!(parse_generic_id(&msg), 42);
        assert_eq!(parse_network(&msg).unwrap().to_string(), "10.1.0.0/16");
        assert!(parse_tunnel_id(&msg).is_err());
    }
}
