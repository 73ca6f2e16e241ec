//! UDP Transport
//!
//! One bound socket ("channel") per local address/port, opened lazily and
//! shared by every session of the family. Each channel has a receiver task
//! that decodes datagrams and queues them for the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::Transport;
use crate::engine::DispatchItem;
use crate::error::{Error, Result};
use crate::protocol::{Family, Message};

/// UDP implementation of [`Transport`]
pub struct UdpTransport {
    family: Family,
    buffer_size: usize,
    queue: mpsc::Sender<DispatchItem>,
    /// Open channels; the lock is held across bind so each address gets one socket
    channels: Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(family: Family, buffer_size: usize, queue: mpsc::Sender<DispatchItem>) -> Self {
        Self {
            family,
            buffer_size,
            queue,
            channels: Mutex::new(HashMap::new()),
            receivers: Mutex::new(Vec::new()),
        }
    }

    /// Channel bound to `local`, binding it on first use
    async fn channel(&self, local: SocketAddr) -> Result<Arc<UdpSocket>> {
        let mut channels = self.channels.lock().await;
        if let Some(socket) = channels.get(&local) {
            return Ok(Arc::clone(socket));
        }

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", local, e)))?;
        // key by the bound address so that port 0 requests resolve
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        channels.insert(local, Arc::clone(&socket));
        drop(channels);

        tracing::info!("{} channel open on {}", self.family, local);
        let handle = self.spawn_receiver(local, Arc::clone(&socket));
        self.receivers.lock().await.push(handle);
        Ok(socket)
    }

    fn spawn_receiver(&self, local: SocketAddr, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let family = self.family;
        let queue = self.queue.clone();
        let mut buf = vec![0u8; self.buffer_size];

        tokio::spawn(async move {
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Receive on {} failed, closing channel: {}", local, e);
                        break;
                    }
                };

                let msg = match Message::decode(family, &buf[..len], local, src) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!("Dropping datagram from {} on {}: {}", src, local, e);
                        continue;
                    }
                };
                tracing::trace!("Received {}", msg.describe());

                if queue.send(DispatchItem::Message(msg)).await.is_err() {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&self, local: SocketAddr) -> Result<()> {
        self.channel(local).await.map(|_| ())
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.encode();

        if msg.remote.ip().is_multicast() {
            // multicast goes out from an ephemeral socket on the local address
            let socket = UdpSocket::bind(SocketAddr::new(msg.local.ip(), 0))
                .await
                .map_err(|e| Error::Network(format!("Failed to bind multicast sender: {}", e)))?;
            socket.send_to(&bytes, msg.remote).await.map_err(|e| Error::ConnectionFailed {
                address: msg.remote.to_string(),
                reason: e.to_string(),
            })?;
        } else {
            let socket = self.channel(msg.local).await?;
            socket.send_to(&bytes, msg.remote).await.map_err(|e| Error::ConnectionFailed {
                address: msg.remote.to_string(),
                reason: e.to_string(),
            })?;
        }

        tracing::trace!("Sent {}", msg.describe());
        Ok(())
    }

    async fn close(&self) {
        for handle in self.receivers.lock().await.drain(..) {
            handle.abort();
        }
        self.channels.lock().await.clear();
    }
}
