//! Negotiation Engine
//!
//! One engine runs per address family. It owns the dispatch queue, the
//! dispatcher task and the shared [`EngineContext`] every session reads
//! its collaborators from.

mod dispatcher;
mod responder;
mod session;

pub use dispatcher::{DispatchStats, SessionKey};

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::FamilySettings;
use crate::device::DeviceConfig;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::notify::{LogNotifier, Notifier};
use crate::protocol::{Family, Message};
use crate::state::{TunnelRegistry, TunnelStore};
use crate::tunnel::TunnelNetwork;

use dispatcher::{Dispatcher, SessionCloser};

/// Depth of the dispatch queue
const QUEUE_DEPTH: usize = 1024;

/// Work for the dispatcher
#[derive(Debug)]
pub enum DispatchItem {
    /// Decoded inbound message
    Message(Message),
    /// Start a client negotiation
    NewSession(SessionRequest),
}

/// Request to negotiate a tunnel from `local` to `remote`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub local: IpAddr,
    /// `None` discovers a server through the multicast group
    pub remote: Option<IpAddr>,
}

/// Create the dispatch queue of an engine
pub fn queue() -> (mpsc::Sender<DispatchItem>, mpsc::Receiver<DispatchItem>) {
    mpsc::channel(QUEUE_DEPTH)
}

/// Everything a session needs, shared by all sessions of one family
pub struct EngineContext {
    pub settings: FamilySettings,
    /// Announced as generic id and used as client transaction id
    pub machine_id: u32,
    pub local_addrs: Vec<IpAddr>,
    pub registry: Arc<TunnelRegistry>,
    pub device: Arc<dyn DeviceConfig>,
    pub store: Arc<dyn TunnelStore>,
    pub notifier: Arc<dyn Notifier>,
    pub transport: Arc<dyn Transport>,
    /// Tunnel network new sessions start from; peers can move it
    current_network: RwLock<TunnelNetwork>,
    /// Interface names handed out by this process
    allocated_names: Mutex<HashSet<String>>,
}

impl EngineContext {
    pub fn new(
        settings: FamilySettings,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceConfig>,
        store: Arc<dyn TunnelStore>,
    ) -> Self {
        Self {
            current_network: RwLock::new(settings.tunnel_network),
            local_addrs: settings.local_addresses.clone(),
            settings,
            machine_id: rand::random(),
            registry: Arc::new(TunnelRegistry::new()),
            device,
            store,
            notifier: Arc::new(LogNotifier),
            transport,
            allocated_names: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_machine_id(mut self, machine_id: u32) -> Self {
        self.machine_id = machine_id;
        self
    }

    pub fn with_local_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.local_addrs = addrs;
        self
    }

    pub fn with_registry(mut self, registry: Arc<TunnelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn family(&self) -> Family {
        self.settings.family
    }

    /// Protocol socket on a local address
    pub fn protocol_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.settings.port)
    }

    pub async fn current_network(&self) -> TunnelNetwork {
        *self.current_network.read().await
    }

    /// Adopt a peer's tunnel network; the last peer to propose one wins
    pub async fn adopt_network(&self, network: TunnelNetwork) {
        let mut current = self.current_network.write().await;
        if *current != network {
            tracing::info!("{} tunnel network {} -> {}", self.family(), *current, network);
            *current = network;
        }
    }

    /// Lowest free interface name of this family
    pub async fn allocate_interface_name(&self) -> String {
        let in_use = self.registry.interface_names(self.family()).await;
        let mut allocated = self.allocated_names.lock().await;
        let name = (0..)
            .map(|i| self.settings.interface_name(i))
            .find(|name| !in_use.contains(name) && !allocated.contains(name))
            .unwrap_or_default();
        allocated.insert(name.clone());
        name
    }

    /// Give back a name whose interface was never completed
    pub async fn release_interface_name(&self, name: &str) {
        self.allocated_names.lock().await.remove(name);
    }
}

/// A running negotiation engine for one family
pub struct Engine {
    ctx: Arc<EngineContext>,
    queue: mpsc::Sender<DispatchItem>,
    stats: Arc<DispatchStats>,
    sessions: SessionCloser,
    dispatcher: JoinHandle<()>,
}

impl Engine {
    /// Open the protocol channels and start dispatching.
    ///
    /// `queue`/`items` must be the pair the transport delivers into.
    pub async fn start(
        ctx: EngineContext,
        queue: mpsc::Sender<DispatchItem>,
        items: mpsc::Receiver<DispatchItem>,
    ) -> Result<Self> {
        let ctx = Arc::new(ctx);

        let mut opened = 0;
        for addr in &ctx.local_addrs {
            match ctx.transport.open(ctx.protocol_addr(*addr)).await {
                Ok(()) => opened += 1,
                Err(e) => tracing::warn!("{} engine cannot listen on {}: {}", ctx.family(), addr, e),
            }
        }
        if opened == 0 && !ctx.local_addrs.is_empty() {
            return Err(Error::Network(format!(
                "no {} protocol channel could be opened",
                ctx.family()
            )));
        }

        let dispatcher = Dispatcher::new(Arc::clone(&ctx), items);
        let stats = dispatcher.stats();
        let sessions = dispatcher.closer();
        let dispatcher = tokio::spawn(dispatcher.run());

        tracing::info!(
            "{} engine started on port {} ({} local addresses, machine id {})",
            ctx.family(),
            ctx.settings.port,
            ctx.local_addrs.len(),
            ctx.machine_id
        );

        Ok(Self {
            ctx,
            queue,
            stats,
            sessions,
            dispatcher,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Queue a client negotiation
    pub async fn connect(&self, local: IpAddr, remote: Option<IpAddr>) -> Result<()> {
        self.queue
            .send(DispatchItem::NewSession(SessionRequest { local, remote }))
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Negotiate with every configured peer, or discover one per local
    /// address when none is configured
    pub async fn connect_configured(&self) -> Result<usize> {
        let mut started = 0;
        for local in &self.ctx.local_addrs {
            if self.ctx.settings.remote_addresses.is_empty() {
                self.connect(*local, None).await?;
                started += 1;
                continue;
            }
            for remote in &self.ctx.settings.remote_addresses {
                if self.ctx.registry.find_by_phys_pair(*local, *remote).await.is_some() {
                    tracing::debug!("Tunnel {} <-> {} already known", local, remote);
                    continue;
                }
                self.connect(*local, Some(*remote)).await?;
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stop dispatching, end the running sessions and close the transport
    pub async fn shutdown(self) {
        self.dispatcher.abort();
        let closed = self.sessions.close_all().await;
        if closed > 0 {
            tracing::info!("{} engine ending {} running sessions", self.ctx.family(), closed);
        }
        self.ctx.transport.close().await;
        tracing::info!("{} engine stopped", self.ctx.family());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::device::{MemoryDevice, PeerConfig};
    use crate::network::memory::MemoryNetwork;
    use crate::notify::{BroadcastNotifier, TunnelEvent};
    use crate::protocol::{GenericResponse, MessageType, OptionCode, Sender};
    use crate::state::TunnelTracker;
    use crate::tunnel::tests::sample_record;
    use crate::tunnel::{EndpointType, TunnelRecord, TunnelState};

    pub(crate) const SERVER: &str = "192.168.1.1";
    pub(crate) const CLIENT: &str = "192.168.1.2";

    pub(crate) fn settings(reply_timeout: Duration) -> FamilySettings {
        settings_for(Family::V4, reply_timeout)
    }

    pub(crate) fn settings_for(family: Family, reply_timeout: Duration) -> FamilySettings {
        let mut settings = FamilySettings::defaults(family);
        settings.reply_timeout = reply_timeout;
        settings
    }

    pub(crate) struct Node {
        pub engine: Engine,
        pub device: Arc<MemoryDevice>,
        pub registry: Arc<TunnelRegistry>,
        pub queue: mpsc::Sender<DispatchItem>,
        pub events: tokio::sync::broadcast::Receiver<TunnelEvent>,
    }

    impl Node {
        pub(crate) async fn start(
            net: &Arc<MemoryNetwork>,
            addr: &str,
            machine_id: u32,
            settings: FamilySettings,
        ) -> Node {
            Self::start_with(net, addr, machine_id, settings, Arc::new(TunnelRegistry::new())).await
        }

        pub(crate) async fn start_with(
            net: &Arc<MemoryNetwork>,
            addr: &str,
            machine_id: u32,
            settings: FamilySettings,
            registry: Arc<TunnelRegistry>,
        ) -> Node {
            let (queue, items) = queue();
            let device = Arc::new(MemoryDevice::new());
            let store = Arc::new(TunnelTracker::in_memory().unwrap());
            let notifier = Arc::new(BroadcastNotifier::new(64));
            let events = notifier.subscribe();
            let ctx = EngineContext::new(settings, net.transport(queue.clone()), device.clone(), store)
                .with_machine_id(machine_id)
                .with_local_addresses(vec![addr.parse().unwrap()])
                .with_registry(Arc::clone(&registry))
                .with_notifier(notifier);
            let engine = Engine::start(ctx, queue.clone(), items).await.unwrap();
            Node {
                engine,
                device,
                registry,
                queue,
                events,
            }
        }

        pub(crate) async fn wait_for_state(&self, state: TunnelState) -> TunnelRecord {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                if let Some(t) = self.registry.list(None).await.into_iter().find(|t| t.state == state) {
                    return t;
                }
                assert!(tokio::time::Instant::now() < deadline, "no tunnel reached {}", state);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        /// Receive discovers sent to the family multicast group
        pub(crate) fn join_multicast(&self, net: &MemoryNetwork) {
            let ctx = self.engine.context();
            net.join(
                &ctx.settings,
                ctx.local_addrs.clone(),
                Arc::clone(&self.registry),
                self.queue.clone(),
            );
        }

        pub(crate) async fn wait_idle(&self) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while self.engine.stats().spawned() == 0 || self.engine.stats().active() > 0 {
                assert!(tokio::time::Instant::now() < deadline, "sessions still running");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn response(msg: &Message) -> Option<u32> {
        msg.get_u32(OptionCode::GenericResponse)
    }

    async fn next_message(items: &mut mpsc::Receiver<DispatchItem>) -> Message {
        match tokio::time::timeout(Duration::from_secs(5), items.recv()).await {
            Ok(Some(DispatchItem::Message(m))) => m,
            other => panic!("no message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_reaches_up() {
        let net = MemoryNetwork::new();
        let server = Node::start(&net, SERVER, 7, settings(Duration::from_secs(2))).await;
        let mut client = Node::start(&net, CLIENT, 42, settings(Duration::from_secs(2))).await;

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();

        let client_tunnel = client.wait_for_state(TunnelState::Up).await;
        let server_tunnel = server.wait_for_state(TunnelState::Up).await;

        // every step of the exchange carries the client's transaction id
        for msg_type in [
            MessageType::Discover,
            MessageType::Offer,
            MessageType::Request,
            MessageType::Ack,
            MessageType::TunnelPing,
            MessageType::TunnelPingReply,
        ] {
            let sent = net.sent_of(msg_type);
            assert!(!sent.is_empty(), "no {:?} sent", msg_type);
            assert!(sent.iter().all(|m| m.xid == 42), "{:?} xid", msg_type);
        }

        let discover = &net.sent_of(MessageType::Discover)[0];
        assert_eq!(discover.sender(), Some(Sender::Client));
        assert_eq!(discover.v4_header().unwrap().client_addr.to_string(), CLIENT);

        let offer = &net.sent_of(MessageType::Offer)[0];
        assert_eq!(response(offer), Some(0));
        let tunnel_id = offer.get_str(OptionCode::TunnelId).unwrap().to_string();
        for msg_type in [MessageType::Request, MessageType::Ack, MessageType::TunnelPingReply] {
            assert_eq!(net.sent_of(msg_type)[0].get_str(OptionCode::TunnelId), Some(tunnel_id.as_str()));
        }

        // tunnel pings travel over the tunnel addresses
        let ping = &net.sent_of(MessageType::TunnelPing)[0];
        assert_eq!(ping.local, client_tunnel.local_tunnel_sock_addr());
        assert_eq!(ping.remote, server_tunnel.local_tunnel_sock_addr());

        assert_eq!(client_tunnel.id.to_string(), tunnel_id);
        assert_eq!(server_tunnel.id, client_tunnel.id);
        assert_eq!(client_tunnel.local_endpoint_type, EndpointType::Client);
        assert_eq!(server_tunnel.local_endpoint_type, EndpointType::Server);
        assert_eq!(client_tunnel.local_tunnel_addr.to_string(), "10.168.1.2");
        assert_eq!(server_tunnel.local_tunnel_addr.to_string(), "10.168.1.1");
        assert_eq!(server_tunnel.remote_public_key, client_tunnel.local_public_key);
        assert_eq!(client_tunnel.remote_public_key, server_tunnel.local_public_key);
        assert_eq!(server_tunnel.remote_id, 42);
        assert_eq!(client_tunnel.remote_id, 7);

        // both devices carry the other side as a peer
        let iface = client.device.interface(&client_tunnel.local_interface_name).unwrap();
        assert!(iface.up);
        assert_eq!(iface.private_key.as_deref(), Some(client_tunnel.local_private_key.as_str()));
        assert_eq!(
            iface.peers,
            vec![PeerConfig {
                public_key: server_tunnel.local_public_key.clone(),
                allowed_ip: server_tunnel.local_tunnel_addr,
                allowed_prefix_len: 32,
                endpoint: SocketAddr::new(SERVER.parse().unwrap(), server_tunnel.local_phys_listen_port),
                keepalive: 0,
            }]
        );
        let iface = server.device.interface(&server_tunnel.local_interface_name).unwrap();
        assert_eq!(
            iface.peers,
            vec![PeerConfig {
                public_key: client_tunnel.local_public_key.clone(),
                allowed_ip: client_tunnel.local_tunnel_addr,
                allowed_prefix_len: 32,
                endpoint: SocketAddr::new(CLIENT.parse().unwrap(), client_tunnel.local_phys_listen_port),
                keepalive: 0,
            }]
        );
        assert_eq!(iface.addresses, vec![(server_tunnel.local_tunnel_addr, 8)]);

        client.wait_idle().await;
        server.wait_idle().await;
        assert_eq!(server.engine.stats().spawned(), 1);

        assert!(matches!(client.events.try_recv(), Ok(TunnelEvent::Added(t)) if t.state == TunnelState::Offer));
        let mut states = Vec::new();
        while let Ok(TunnelEvent::StateChanged(t, _)) = client.events.try_recv() {
            states.push(t.state);
        }
        assert_eq!(
            states,
            vec![
                TunnelState::Request,
                TunnelState::Acknowledge,
                TunnelState::TunnelPing,
                TunnelState::Up
            ]
        );
    }

    #[tokio::test]
    async fn test_redundant_public_key_moves_network() {
        let net = MemoryNetwork::new();

        // the client already serves 10.0.0.0/8 from an interface whose key the server knows
        let client_registry = Arc::new(TunnelRegistry::new());
        let mut existing = sample_record();
        existing.local_endpoint_type = EndpointType::Client;
        existing.remote_endpoint_type = EndpointType::Server;
        existing.local_phys_addr = CLIENT.parse().unwrap();
        existing.remote_phys_addr = "192.168.1.9".parse().unwrap();
        existing.local_tunnel_addr = "10.168.1.2".parse().unwrap();
        existing.remote_tunnel_addr = "10.168.1.9".parse().unwrap();
        existing.local_public_key = "Y2xpZW50LWludGVyZmFjZS1rZXk=".into();
        client_registry.try_insert(existing.clone()).await.unwrap();

        let server_registry = Arc::new(TunnelRegistry::new());
        let mut known = sample_record();
        known.local_phys_addr = SERVER.parse().unwrap();
        known.remote_phys_addr = CLIENT.parse().unwrap();
        known.local_tunnel_addr = "10.99.1.1".parse().unwrap();
        known.remote_tunnel_addr = "10.99.1.2".parse().unwrap();
        known.remote_public_key = existing.local_public_key.clone();
        server_registry.try_insert(known).await.unwrap();

        let server = Node::start_with(&net, SERVER, 7, settings(Duration::from_secs(2)), server_registry).await;
        let client = Node::start_with(&net, CLIENT, 42, settings(Duration::from_secs(2)), client_registry).await;

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        let tunnel = client.wait_for_state(TunnelState::Up).await;
        server.wait_for_state(TunnelState::Up).await;

        let offers = net.sent_of(MessageType::Offer);
        assert_eq!(response(&offers[0]), Some(1));

        let discovers = net.sent_of(MessageType::Discover);
        assert!(discovers.len() >= 2);
        assert_eq!(discovers[0].get_str(OptionCode::GenericPublicKey), Some(existing.local_public_key.as_str()));
        let networks: Vec<TunnelNetwork> = discovers
            .iter()
            .map(|d| d.get_str(OptionCode::TunnelNetwork).unwrap().parse().unwrap())
            .collect();
        assert_eq!(networks[0].to_string(), "10.0.0.0/8");
        assert_eq!(networks[1].to_string(), "11.0.0.0/16");
        assert!(!networks[1..].contains(&networks[0]));

        assert_eq!(tunnel.tunnel_network, networks[1]);
        assert_eq!(tunnel.local_tunnel_addr.to_string(), "11.0.1.2");
        assert_eq!(tunnel.local_interface_name, "v4wolfc1");
        assert_eq!(server.engine.context().current_network().await, networks[1]);
    }

    #[tokio::test]
    async fn test_redundant_tunnel_is_declined() {
        let net = MemoryNetwork::new();
        let server_registry = Arc::new(TunnelRegistry::new());
        let mut known = sample_record();
        known.remote_phys_addr = CLIENT.parse().unwrap();
        known.remote_tunnel_addr = "10.168.1.2".parse().unwrap();
        server_registry.try_insert(known.clone()).await.unwrap();

        let server = Node::start_with(&net, SERVER, 7, settings(Duration::from_secs(2)), server_registry).await;
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_secs(2))).await;

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();

        client.wait_idle().await;
        server.wait_idle().await;

        let offers = net.sent_of(MessageType::Offer);
        assert_eq!(offers.len(), 1);
        assert_eq!(response(&offers[0]), Some(3));
        assert_eq!(offers[0].get_str(OptionCode::TunnelId), Some(known.id.to_string().as_str()));
        assert!(net.sent_of(MessageType::Request).is_empty());
        assert!(client.registry.is_empty().await);
        assert_eq!(server.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_device_failure_marks_peer_config_error() {
        let net = MemoryNetwork::new();
        let server = Node::start(&net, SERVER, 7, settings(Duration::from_millis(300))).await;
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_millis(300))).await;
        server.device.fail_on("set_peer");

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();

        let failed = server.wait_for_state(TunnelState::PeerConfigError).await;
        assert_eq!(failed.remote_phys_addr.to_string(), CLIENT);
        server.wait_idle().await;
        client.wait_idle().await;

        // no ack was ever sent, the client gave up at Request
        assert!(net.sent_of(MessageType::Ack).is_empty());
        let tunnel = client.registry.list(None).await.pop().unwrap();
        assert_eq!(tunnel.state, TunnelState::Request);
    }

    #[tokio::test]
    async fn test_info_request_lists_tunnels() {
        let net = MemoryNetwork::new();
        let registry = Arc::new(TunnelRegistry::new());
        let record = sample_record();
        registry.try_insert(record.clone()).await.unwrap();
        let _server = Node::start_with(&net, SERVER, 7, settings(Duration::from_secs(2)), registry).await;

        let (ctl_queue, mut ctl_items) = queue();
        let ctl = net.transport(ctl_queue);
        let ctl_addr: SocketAddr = "192.168.1.50:40000".parse().unwrap();
        ctl.open(ctl_addr).await.unwrap();

        let request = Message::new(
            Family::V4,
            MessageType::InfoRequest,
            Sender::Client,
            99,
            ctl_addr,
            SocketAddr::new(SERVER.parse().unwrap(), 268),
        );
        ctl.send(&request).await.unwrap();

        let reply = match tokio::time::timeout(Duration::from_secs(5), ctl_items.recv()).await {
            Ok(Some(DispatchItem::Message(m))) => m,
            other => panic!("no info reply: {:?}", other),
        };
        assert_eq!(reply.message_type(), Some(MessageType::InfoRequestReply));
        assert_eq!(reply.xid, 99);
        assert_eq!(reply.get_str(OptionCode::TunnelId), Some(record.id.to_string().as_str()));
        assert_eq!(reply.get_str(OptionCode::TunnelStatus), Some("Offer"));
        assert_eq!(reply.get_str(OptionCode::TunnelNetwork), Some("10.0.0.0/8"));
        assert_eq!(reply.get_ip(OptionCode::LocalTunnelAddr), Some(record.local_tunnel_addr));
    }

    #[tokio::test]
    async fn test_adopt_network_and_interface_names() {
        let net = MemoryNetwork::new();
        let registry = Arc::new(TunnelRegistry::new());
        registry.try_insert(sample_record()).await.unwrap();
        let node = Node::start_with(&net, SERVER, 7, settings(Duration::from_secs(1)), registry).await;
        let ctx = node.engine.context();

        assert_eq!(ctx.allocate_interface_name().await, "v4wolfc1");
        assert_eq!(ctx.allocate_interface_name().await, "v4wolfc2");

        let net16: TunnelNetwork = "172.16.0.0/16".parse().unwrap();
        ctx.adopt_network(net16).await;
        assert_eq!(ctx.current_network().await, net16);
    }

    #[tokio::test]
    async fn test_v6_handshake_reaches_up() {
        let server_addr = "fd00:1::1";
        let client_addr = "fd00:1::2";
        let net = MemoryNetwork::new();
        let server = Node::start(&net, server_addr, 7, settings_for(Family::V6, Duration::from_secs(2))).await;
        let mut client = Node::start(&net, client_addr, 42, settings_for(Family::V6, Duration::from_secs(2))).await;

        client
            .engine
            .connect(client_addr.parse().unwrap(), Some(server_addr.parse().unwrap()))
            .await
            .unwrap();
        let client_tunnel = client.wait_for_state(TunnelState::Up).await;
        let server_tunnel = server.wait_for_state(TunnelState::Up).await;

        // the handshake carries its type in the V6 header byte
        for (msg_type, name) in [
            (MessageType::Discover, "Solicit"),
            (MessageType::Offer, "Advertise"),
            (MessageType::Request, "Request"),
            (MessageType::Ack, "Reply"),
        ] {
            let sent = net.sent_of(msg_type);
            assert!(!sent.is_empty(), "no {} sent", name);
            for msg in &sent {
                assert_eq!(msg.family(), Family::V6);
                assert_eq!(msg.encode()[0], msg_type.code(Family::V6));
                assert_eq!(msg.xid, 42);
                assert_eq!(msg.local.port(), 547);
                assert!(msg.describe().contains(name), "{}", msg.describe());
            }
        }

        assert_eq!(client_tunnel.family, Family::V6);
        assert_eq!(client_tunnel.tunnel_network.to_string(), "fc00::/64");
        assert_eq!(client_tunnel.local_tunnel_addr.to_string(), "fc00::2");
        assert_eq!(server_tunnel.local_tunnel_addr.to_string(), "fc00::1");
        assert_eq!(client_tunnel.remote_tunnel_addr, server_tunnel.local_tunnel_addr);
        assert_eq!(server_tunnel.remote_tunnel_addr, client_tunnel.local_tunnel_addr);

        let ping = &net.sent_of(MessageType::TunnelPing)[0];
        assert_eq!(ping.local.to_string(), "[fc00::2]:547");
        assert_eq!(ping.remote.to_string(), "[fc00::1]:547");

        let iface = client.device.interface(&client_tunnel.local_interface_name).unwrap();
        assert_eq!(client_tunnel.local_interface_name, "v6wolfc0");
        assert_eq!(iface.addresses, vec![(client_tunnel.local_tunnel_addr, 64)]);
        assert_eq!(iface.peers[0].allowed_ip, server_tunnel.local_tunnel_addr);
        assert_eq!(iface.peers[0].allowed_prefix_len, 128);
        let iface = server.device.interface(&server_tunnel.local_interface_name).unwrap();
        assert_eq!(iface.addresses, vec![(server_tunnel.local_tunnel_addr, 64)]);

        assert!(matches!(client.events.try_recv(), Ok(TunnelEvent::Added(t)) if t.state == TunnelState::Advertise));
        let mut states = Vec::new();
        while let Ok(TunnelEvent::StateChanged(t, _)) = client.events.try_recv() {
            states.push(t.state);
        }
        assert_eq!(
            states,
            vec![TunnelState::Request, TunnelState::Reply, TunnelState::TunnelPing, TunnelState::Up]
        );
    }

    #[tokio::test]
    async fn test_client_declines_offer_with_known_key() {
        let net = MemoryNetwork::new();

        // the server answers from an interface it already shares with another peer
        let server_registry = Arc::new(TunnelRegistry::new());
        let mut shared = sample_record();
        shared.remote_phys_addr = "192.168.1.9".parse().unwrap();
        shared.remote_tunnel_addr = "10.168.1.9".parse().unwrap();
        server_registry.try_insert(shared.clone()).await.unwrap();

        // the client already uses that interface key as a peer on another network
        let client_registry = Arc::new(TunnelRegistry::new());
        let mut known = sample_record();
        known.local_endpoint_type = EndpointType::Client;
        known.remote_endpoint_type = EndpointType::Server;
        known.local_phys_addr = CLIENT.parse().unwrap();
        known.remote_phys_addr = "192.168.1.9".parse().unwrap();
        known.tunnel_network = "172.16.0.0/16".parse().unwrap();
        known.local_tunnel_addr = "172.16.1.2".parse().unwrap();
        known.remote_tunnel_addr = "172.16.1.9".parse().unwrap();
        known.local_public_key = "Y2xpZW50LWludGVyZmFjZS1rZXk=".into();
        known.remote_public_key = shared.local_public_key.clone();
        client_registry.try_insert(known).await.unwrap();

        let server = Node::start_with(&net, SERVER, 7, settings(Duration::from_secs(2)), server_registry).await;
        let client = Node::start_with(&net, CLIENT, 42, settings(Duration::from_secs(2)), client_registry).await;

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        let tunnel = client.wait_for_state(TunnelState::Up).await;
        server.wait_for_state(TunnelState::Up).await;

        let offers = net.sent_of(MessageType::Offer);
        assert_eq!(offers.len(), 2);
        assert_eq!(response(&offers[0]), Some(0));
        assert_eq!(
            offers[0].get_str(OptionCode::RemoteWgPublicKey),
            Some(shared.local_public_key.as_str())
        );
        let first_id = offers[0].get_str(OptionCode::TunnelId).unwrap().to_string();

        let requests = net.sent_of(MessageType::Request);
        assert_eq!(response(&requests[0]), Some(GenericResponse::DeclineRedundantPublicKey.code()));
        assert_eq!(requests[0].get_str(OptionCode::TunnelId), Some(first_id.as_str()));
        assert_eq!(requests[0].get_str(OptionCode::TunnelNetwork), Some("11.0.0.0/16"));
        assert_eq!(response(&requests[1]), Some(0));

        // a fresh offer on a new interface for the proposed network
        let second_id = offers[1].get_str(OptionCode::TunnelId).unwrap();
        assert_ne!(second_id, first_id);
        assert_eq!(response(&offers[1]), Some(0));
        assert_eq!(offers[1].get_str(OptionCode::TunnelNetwork), Some("11.0.0.0/16"));
        assert_ne!(
            offers[1].get_str(OptionCode::RemoteWgPublicKey),
            Some(shared.local_public_key.as_str())
        );

        assert_eq!(tunnel.id.to_string(), second_id);
        assert_eq!(tunnel.tunnel_network.to_string(), "11.0.0.0/16");
        assert_eq!(tunnel.local_tunnel_addr.to_string(), "11.0.1.2");

        let first_id = uuid::Uuid::parse_str(&first_id).unwrap();
        assert!(server.registry.get(&first_id).await.is_none());
        assert!(server.registry.get(&shared.id).await.is_some());
        assert_eq!(server.registry.len().await, 2);
        assert_eq!(server.engine.context().current_network().await.to_string(), "11.0.0.0/16");
    }

    #[tokio::test]
    async fn test_client_waits_past_network_decline() {
        let net = MemoryNetwork::new();
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_secs(5))).await;

        // a hand-driven server on the protocol port
        let server_addr = SocketAddr::new(SERVER.parse().unwrap(), 268);
        let client_addr = SocketAddr::new(CLIENT.parse().unwrap(), 268);
        let (peer_queue, mut peer_items) = queue();
        let peer = net.transport(peer_queue);
        peer.open(server_addr).await.unwrap();

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        let discover = next_message(&mut peer_items).await;
        assert_eq!(discover.message_type(), Some(MessageType::Discover));

        let mut decline = Message::new(Family::V4, MessageType::Offer, Sender::Server, 42, server_addr, client_addr);
        decline.put_u32(OptionCode::GenericResponse, GenericResponse::DeclineTunnelNetwork.code());
        peer.send(&decline).await.unwrap();
        // let the session take it before the next offer arrives
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.registry.is_empty().await);
        assert_eq!(client.engine.stats().active(), 1);

        let tunnel_id = uuid::Uuid::new_v4();
        let server_key = "c2VydmVyLWludGVyZmFjZS1rZXk=";
        let mut offer = Message::new(Family::V4, MessageType::Offer, Sender::Server, 42, server_addr, client_addr);
        offer
            .put_str(OptionCode::GenericId, "7")
            .put_str(OptionCode::TunnelId, tunnel_id.to_string())
            .put_str(OptionCode::RemoteWgPublicKey, server_key)
            .put_u32(OptionCode::RemotePhysListenPort, 51820)
            .put_ip(OptionCode::RemoteTunnelAddr, "10.168.1.1".parse().unwrap())
            .put_ip(OptionCode::LocalTunnelAddr, "10.168.1.2".parse().unwrap())
            .put_str(OptionCode::TunnelNetwork, "10.0.0.0/8")
            .put_u32(OptionCode::GenericResponse, GenericResponse::Accept.code());
        peer.send(&offer).await.unwrap();

        let request = next_message(&mut peer_items).await;
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(response(&request), Some(0));
        assert_eq!(request.get_str(OptionCode::TunnelId), Some(tunnel_id.to_string().as_str()));

        let tunnel = client.wait_for_state(TunnelState::Request).await;
        assert_eq!(tunnel.id, tunnel_id);
        assert_eq!(tunnel.remote_public_key, server_key);
        assert_eq!(tunnel.remote_id, 7);
        assert_eq!(net.sent_of(MessageType::Discover).len(), 1);
    }

    #[tokio::test]
    async fn test_multicast_discovery_binds_first_server() {
        let net = MemoryNetwork::new();
        let timeout = Duration::from_millis(500);
        let first = Node::start(&net, SERVER, 7, settings(timeout)).await;
        let second = Node::start(&net, "192.168.1.3", 8, settings(timeout)).await;
        first.join_multicast(&net);
        second.join_multicast(&net);
        let client = Node::start(&net, CLIENT, 42, settings(timeout)).await;

        client.engine.connect(CLIENT.parse().unwrap(), None).await.unwrap();
        let tunnel = client.wait_for_state(TunnelState::Up).await;
        client.wait_idle().await;
        first.wait_idle().await;
        second.wait_idle().await;

        let discovers = net.sent_of(MessageType::Discover);
        assert_eq!(discovers.len(), 1);
        assert_eq!(discovers[0].remote.to_string(), "224.0.0.1:268");

        // both servers answered, the session went with one of them
        let answered: HashSet<IpAddr> = net.sent_of(MessageType::Offer).iter().map(|m| m.local.ip()).collect();
        assert_eq!(answered.len(), 2);
        assert_eq!(client.engine.stats().rebound(), 1);
        assert_eq!(client.engine.stats().spawned(), 1);

        let tunnels = client.registry.list(None).await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].state, TunnelState::Up);

        let mut up = Vec::new();
        for server in [&first, &second] {
            for t in server.registry.list(None).await {
                if t.state == TunnelState::Up {
                    up.push(t);
                }
            }
        }
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].local_phys_addr, tunnel.remote_phys_addr);
        assert_eq!(up[0].id, tunnel.id);
        assert!(net
            .sent_of(MessageType::Request)
            .iter()
            .all(|m| m.remote.ip() == tunnel.remote_phys_addr));
    }

    #[tokio::test]
    async fn test_failed_provisioning_releases_interface() {
        let net = MemoryNetwork::new();
        let _server = Node::start(&net, SERVER, 7, settings(Duration::from_millis(300))).await;
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_millis(300))).await;
        client.device.fail_on("bring_up");

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        client.wait_idle().await;

        assert!(!net.sent_of(MessageType::Offer).is_empty());
        assert!(net.sent_of(MessageType::Request).is_empty());
        assert!(client.registry.is_empty().await);
        assert_eq!(client.device.interface_count(), 0);
        assert_eq!(client.engine.context().allocate_interface_name().await, "v4wolfc0");
    }

    #[tokio::test]
    async fn test_shutdown_ends_waiting_sessions() {
        let net = MemoryNetwork::new();
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_secs(300))).await;

        client
            .engine
            .connect(CLIENT.parse().unwrap(), Some(SERVER.parse().unwrap()))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while net.sent_of(MessageType::Discover).is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no discover sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = Arc::clone(client.engine.stats());
        assert_eq!(stats.active(), 1);
        client.engine.shutdown().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stats.finished() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "session outlived shutdown");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.active(), 0);
        assert_eq!(net.sent_of(MessageType::Discover).len(), 1);
    }
}
