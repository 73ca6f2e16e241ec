//! In-process datagram switch for engine tests

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::multicast::Inbound;
use super::Transport;
use crate::config::FamilySettings;
use crate::engine::DispatchItem;
use crate::error::Result;
use crate::protocol::{Message, MessageType};
use crate::state::TunnelRegistry;

type Member = (Arc<Inbound>, mpsc::Sender<DispatchItem>);

/// Routes encoded messages between the engines attached to it
#[derive(Default)]
pub(crate) struct MemoryNetwork {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::Sender<DispatchItem>>>,
    groups: Mutex<HashMap<SocketAddr, Vec<Member>>>,
    sent: Mutex<Vec<Message>>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport delivering inbound datagrams into `queue`
    pub(crate) fn transport(self: &Arc<Self>, queue: mpsc::Sender<DispatchItem>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            queue,
        })
    }

    /// Deliver datagrams sent to the settings' multicast group into `queue`,
    /// filtered the way the multicast listener filters them
    pub(crate) fn join(
        &self,
        settings: &FamilySettings,
        local_addrs: Vec<IpAddr>,
        registry: Arc<TunnelRegistry>,
        queue: mpsc::Sender<DispatchItem>,
    ) {
        let group = SocketAddr::new(settings.multicast_group, settings.port);
        let inbound = Arc::new(Inbound::new(settings, local_addrs, registry));
        self.groups.lock().unwrap().entry(group).or_default().push((inbound, queue));
    }

    /// Every message sent so far, in order
    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_of(&self, msg_type: MessageType) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|m| m.message_type() == Some(msg_type))
            .collect()
    }
}

pub(crate) struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    queue: mpsc::Sender<DispatchItem>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, local: SocketAddr) -> Result<()> {
        self.network
            .endpoints
            .lock()
            .unwrap()
            .entry(local)
            .or_insert_with(|| self.queue.clone());
        Ok(())
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        self.network.sent.lock().unwrap().push(msg.clone());

        let members = self.network.groups.lock().unwrap().get(&msg.remote).cloned();
        if let Some(members) = members {
            let bytes = msg.encode();
            for (inbound, queue) in members {
                if let Some(received) = inbound.accept(&bytes, msg.local).await {
                    let _ = queue.send(DispatchItem::Message(received)).await;
                }
            }
            return Ok(());
        }

        let target = self.network.endpoints.lock().unwrap().get(&msg.remote).cloned();
        let Some(target) = target else {
            tracing::debug!("No endpoint at {}, dropping {}", msg.remote, msg.describe());
            return Ok(());
        };

        // through the wire format, as the receiver sees it
        let received = Message::decode(msg.family(), &msg.encode(), msg.remote, msg.local)?;
        let _ = target.send(DispatchItem::Message(received)).await;
        Ok(())
    }
}
