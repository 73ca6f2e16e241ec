//! Message Dispatcher
//!
//! Routes every inbound message to the session it belongs to, starts new
//! sessions and hands stateless queries to the responder. A session is
//! identified by its role, transaction id and physical address pair; at
//! most one session exists per key.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Semaphore};
use uuid::Uuid;

use super::responder::Responder;
use super::session::Session;
use super::{DispatchItem, EngineContext, SessionRequest};
use crate::error::{Error, Result};
use crate::protocol::{Message, MessageType, OptionCode, Sender};
use crate::tunnel::EndpointType;

/// Messages buffered per session while it is busy
const INBOX_DEPTH: usize = 1;

/// Identity of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Role of the local side
    pub role: EndpointType,
    pub xid: u32,
    pub local: IpAddr,
    /// `None` while a multicast discovery has not been answered
    pub remote: Option<IpAddr>,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote {
            Some(remote) => write!(f, "{} {:#010x} {} -> {}", self.role, self.xid, self.local, remote),
            None => write!(f, "{} {:#010x} {} -> multicast", self.role, self.xid, self.local),
        }
    }
}

/// Session counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    spawned: AtomicUsize,
    finished: AtomicUsize,
    rebound: AtomicUsize,
}

impl DispatchStats {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Multicast discoveries bound to the server that answered first
    pub fn rebound(&self) -> usize {
        self.rebound.load(Ordering::SeqCst)
    }

    /// Sessions started and not yet finished
    pub fn active(&self) -> usize {
        self.spawned().saturating_sub(self.finished())
    }
}

struct SessionHandle {
    id: u64,
    tx: mpsc::Sender<Message>,
}

type SessionMap = Arc<Mutex<HashMap<SessionKey, SessionHandle>>>;

/// Ends the running sessions of a dispatcher
#[derive(Clone)]
pub(crate) struct SessionCloser {
    sessions: SessionMap,
    workers: Arc<Semaphore>,
}

impl SessionCloser {
    /// Drop every session inbox so waiting sessions stop; returns how many
    pub(crate) async fn close_all(&self) -> usize {
        self.workers.close();
        let mut sessions = self.sessions.lock().await;
        let closed = sessions.len();
        sessions.clear();
        closed
    }
}

pub(crate) struct Dispatcher {
    ctx: Arc<EngineContext>,
    items: mpsc::Receiver<DispatchItem>,
    sessions: SessionMap,
    /// Bounds the sessions doing work at the same time
    workers: Arc<Semaphore>,
    stats: Arc<DispatchStats>,
    responder: Responder,
    next_id: u64,
}

impl Dispatcher {
    pub(crate) fn new(ctx: Arc<EngineContext>, items: mpsc::Receiver<DispatchItem>) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(ctx.settings.max_sessions)),
            responder: Responder::new(Arc::clone(&ctx)),
            ctx,
            items,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(DispatchStats::default()),
            next_id: 0,
        }
    }

    pub(crate) fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn closer(&self) -> SessionCloser {
        SessionCloser {
            sessions: Arc::clone(&self.sessions),
            workers: Arc::clone(&self.workers),
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(item) = self.items.recv().await {
            match item {
                DispatchItem::Message(msg) => self.dispatch(msg).await,
                DispatchItem::NewSession(req) => self.start_client(req).await,
            }
        }
        tracing::debug!("{} dispatch queue closed", self.ctx.family());
    }

    async fn dispatch(&mut self, msg: Message) {
        let (Some(sender), Some(msg_type)) = (msg.sender(), msg.message_type()) else {
            tracing::debug!("Dropping {} without sender or type", msg.describe());
            return;
        };

        match msg_type {
            MessageType::InfoRequest => {
                self.responder.answer_info(&msg).await;
                return;
            }
            MessageType::InfoRequestReply => {
                tracing::debug!("Ignoring {}", msg.describe());
                return;
            }
            _ => {}
        }

        let role = match sender {
            Sender::Client => EndpointType::Server,
            Sender::Server => EndpointType::Client,
        };
        let (local, remote) = self.phys_pair(&msg).await;
        let key = SessionKey {
            role,
            xid: msg.xid,
            local,
            remote: Some(remote),
        };

        let msg = match self.deliver(key, msg).await {
            None => return,
            Some(msg) => msg,
        };

        if role == EndpointType::Server && msg_type == MessageType::Discover {
            self.start_server(key, msg).await;
        } else if msg_type == MessageType::TunnelPing {
            self.responder.answer_ping(&msg).await;
        } else {
            tracing::debug!("No session {} for {}, dropping", key, msg.describe());
        }
    }

    /// Physical addresses the message's tunnel runs between
    async fn phys_pair(&self, msg: &Message) -> (IpAddr, IpAddr) {
        let tunnel = msg
            .get_str(OptionCode::TunnelId)
            .and_then(|id| Uuid::parse_str(id.trim()).ok());
        if let Some(id) = tunnel {
            if let Some(record) = self.ctx.registry.get(&id).await {
                return (record.local_phys_addr, record.remote_phys_addr);
            }
        }
        (msg.local.ip(), msg.remote.ip())
    }

    /// Hand `msg` to its session; gives it back when there is none
    async fn deliver(&self, key: SessionKey, msg: Message) -> Option<Message> {
        let mut sessions = self.sessions.lock().await;

        if !sessions.contains_key(&key) && key.role == EndpointType::Client {
            // first answer to a multicast discovery binds the session to the server
            let wildcard = SessionKey { remote: None, ..key };
            if let Some(handle) = sessions.remove(&wildcard) {
                tracing::debug!("Session {} bound to {}", wildcard, key);
                sessions.insert(key, handle);
                self.stats.rebound.fetch_add(1, Ordering::SeqCst);
            }
        }

        let Some(handle) = sessions.get(&key) else {
            return Some(msg);
        };
        match handle.tx.try_send(msg) {
            Ok(()) => None,
            Err(TrySendError::Full(msg)) => {
                tracing::debug!("Session {} busy, dropping {}", key, msg.describe());
                None
            }
            Err(TrySendError::Closed(msg)) => {
                sessions.remove(&key);
                Some(msg)
            }
        }
    }

    async fn start_client(&mut self, req: SessionRequest) {
        let key = SessionKey {
            role: EndpointType::Client,
            xid: self.ctx.machine_id,
            local: req.local,
            remote: req.remote,
        };
        let Some(inbox) = self.register(key).await else {
            tracing::debug!("Session {} already running", key);
            return;
        };

        let session = Session::client(Arc::clone(&self.ctx), req.local, req.remote, inbox);
        self.spawn(key, session.run_client());
    }

    async fn start_server(&mut self, key: SessionKey, first: Message) {
        let Some(inbox) = self.register(key).await else {
            return;
        };

        let session = Session::server(Arc::clone(&self.ctx), &first, inbox);
        self.spawn(key, session.run_server(first));
    }

    /// Claim `key` for a new session and return its inbox
    async fn register(&mut self, key: SessionKey) -> Option<mpsc::Receiver<Message>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&key) {
            return None;
        }

        self.next_id += 1;
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        sessions.insert(key, SessionHandle { id: self.next_id, tx });
        Some(rx)
    }

    fn spawn<F>(&self, key: SessionKey, session: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id;
        let sessions = Arc::clone(&self.sessions);
        let workers = Arc::clone(&self.workers);
        let stats = Arc::clone(&self.stats);
        stats.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Session {} started", key);

        tokio::spawn(async move {
            let result = match workers.acquire_owned().await {
                Ok(_permit) => session.await,
                Err(_) => Err(Error::ShuttingDown),
            };

            match result {
                Ok(()) => tracing::debug!("Session {} finished", key),
                Err(Error::ShuttingDown) => tracing::debug!("Session {} stopped", key),
                Err(e) if e.is_fatal_to_session() => tracing::error!("Session {} failed: {}", key, e),
                Err(e) => tracing::warn!("Session {} ended: {}", key, e),
            }

            // the key may have been rebound from the multicast wildcard
            sessions.lock().await.retain(|_, h| h.id != id);
            stats.finished.fetch_add(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::engine::tests::{settings, Node, CLIENT, SERVER};
    use crate::network::memory::MemoryNetwork;
    use crate::protocol::Family;

    fn discover(xid: u32) -> Message {
        let mut msg = Message::new(
            Family::V4,
            MessageType::Discover,
            Sender::Client,
            xid,
            SocketAddr::new(SERVER.parse().unwrap(), 268),
            SocketAddr::new(CLIENT.parse().unwrap(), 268),
        );
        msg.put_str(OptionCode::GenericId, xid.to_string())
            .put_str(OptionCode::SpecificInfo, " ")
            .put_ip(OptionCode::RemotePhysAddr, CLIENT.parse().unwrap())
            .put_u32(OptionCode::RemotePhysComPort, 268)
            .put_ip(OptionCode::RemoteTunnelAddr, "10.168.1.2".parse().unwrap())
            .put_str(OptionCode::TunnelNetwork, "10.0.0.0/8");
        msg
    }

    async fn wait_for_offers(net: &MemoryNetwork, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while net.sent_of(MessageType::Offer).len() < count {
            assert!(tokio::time::Instant::now() < deadline, "expected {} offers", count);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_one_session_per_key() {
        let net = MemoryNetwork::new();
        let server = Node::start(&net, SERVER, 7, settings(Duration::from_secs(30))).await;

        server.queue.send(DispatchItem::Message(discover(42))).await.unwrap();
        wait_for_offers(&net, 1).await;
        server.queue.send(DispatchItem::Message(discover(42))).await.unwrap();

        // the repeat reaches the running session, which answers it again
        wait_for_offers(&net, 2).await;
        assert_eq!(server.engine.stats().spawned(), 1);
        let offers = net.sent_of(MessageType::Offer);
        assert_eq!(offers[0], offers[1]);

        // same peer, new transaction asking for another tunnel address
        let mut second = discover(43);
        second.put_ip(OptionCode::RemoteTunnelAddr, "10.168.1.9".parse().unwrap());
        server.queue.send(DispatchItem::Message(second)).await.unwrap();
        wait_for_offers(&net, 3).await;
        assert_eq!(server.engine.stats().spawned(), 2);
        assert_eq!(server.engine.stats().active(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_messages_are_dropped() {
        let net = MemoryNetwork::new();
        let node = Node::start(&net, SERVER, 7, settings(Duration::from_secs(30))).await;

        // an offer nobody asked for and a discover sent by a server
        let mut offer = discover(42);
        offer.set_message_type(MessageType::Offer);
        offer.set_sender(Sender::Server);
        node.queue.send(DispatchItem::Message(offer)).await.unwrap();
        let mut discover = discover(43);
        discover.set_sender(Sender::Server);
        node.queue.send(DispatchItem::Message(discover)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.engine.stats().spawned(), 0);
        assert!(net.sent().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_ignored() {
        let net = MemoryNetwork::new();
        let client = Node::start(&net, CLIENT, 42, settings(Duration::from_secs(30))).await;

        let server: IpAddr = SERVER.parse().unwrap();
        client.engine.connect(CLIENT.parse().unwrap(), Some(server)).await.unwrap();
        client.engine.connect(CLIENT.parse().unwrap(), Some(server)).await.unwrap();
        client.engine.connect(CLIENT.parse().unwrap(), None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while net.sent_of(MessageType::Discover).len() < 2 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.engine.stats().spawned(), 2);
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey {
            role: EndpointType::Client,
            xid: 42,
            local: CLIENT.parse().unwrap(),
            remote: None,
        };
        assert_eq!(key.to_string(), "Client 0x0000002a 192.168.1.2 -> multicast");
    }
}
