//! Stateless answers
//!
//! Info requests and tunnel pings for tunnels that are already up do not
//! need a session; they are answered straight from the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use super::EngineContext;
use crate::protocol::{Message, MessageType, OptionCode, Sender};
use crate::tunnel::TunnelRecord;

pub(crate) struct Responder {
    ctx: Arc<EngineContext>,
}

impl Responder {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// One reply per tunnel of the family, or a bare reply when there are none
    pub(crate) async fn answer_info(&self, request: &Message) {
        let tunnels = self.ctx.registry.list(Some(self.ctx.family())).await;
        tracing::debug!("Info request from {}, {} tunnels", request.remote, tunnels.len());

        if tunnels.is_empty() {
            let reply = self.reply(request);
            self.send(&reply).await;
            return;
        }
        for tunnel in &tunnels {
            let mut reply = self.reply(request);
            describe_tunnel(&mut reply, tunnel);
            self.send(&reply).await;
        }
    }

    /// Answer a ping on a tunnel whose session has already finished
    pub(crate) async fn answer_ping(&self, ping: &Message) {
        let Some(id) = ping
            .get_str(OptionCode::TunnelId)
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
        else {
            return;
        };
        let Some(tunnel) = self.ctx.registry.get(&id).await.filter(TunnelRecord::is_up) else {
            tracing::debug!("Ping for tunnel {} that is not up, dropping", id);
            return;
        };

        let reply_to = SocketAddr::new(
            ping.get_ip(OptionCode::PingAddr).unwrap_or(tunnel.remote_tunnel_addr),
            ping.get_u32(OptionCode::PingPort)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(tunnel.remote_tunnel_com_port),
        );
        let mut reply = Message::new(
            self.ctx.family(),
            MessageType::TunnelPingReply,
            Sender::Server,
            ping.xid,
            tunnel.local_tunnel_sock_addr(),
            reply_to,
        );
        reply.put_str(OptionCode::TunnelId, tunnel.id.to_string());
        self.send(&reply).await;
    }

    fn reply(&self, request: &Message) -> Message {
        let mut reply = Message::new(
            self.ctx.family(),
            MessageType::InfoRequestReply,
            Sender::Server,
            request.xid,
            request.local,
            request.remote,
        );
        reply.put_str(OptionCode::GenericId, self.ctx.machine_id.to_string());
        reply
    }

    async fn send(&self, msg: &Message) {
        if let Err(e) = self.ctx.transport.send(msg).await {
            tracing::warn!("Failed to send {}: {}", msg.describe(), e);
        }
    }
}

fn describe_tunnel(msg: &mut Message, t: &TunnelRecord) {
    msg.put_str(OptionCode::TunnelId, t.id.to_string())
        .put_str(OptionCode::TunnelStatus, t.state.label())
        .put_str(OptionCode::LocalEndpointType, t.local_endpoint_type.label())
        .put_str(OptionCode::RemoteEndpointType, t.remote_endpoint_type.label())
        .put_ip(OptionCode::LocalPhysAddr, t.local_phys_addr)
        .put_ip(OptionCode::RemotePhysAddr, t.remote_phys_addr)
        .put_ip(OptionCode::LocalTunnelAddr, t.local_tunnel_addr)
        .put_ip(OptionCode::RemoteTunnelAddr, t.remote_tunnel_addr)
        .put_u32(OptionCode::LocalPhysComPort, t.local_phys_com_port as u32)
        .put_u32(OptionCode::RemotePhysComPort, t.remote_phys_com_port as u32)
        .put_u32(OptionCode::LocalPhysListenPort, t.local_phys_listen_port as u32)
        .put_u32(OptionCode::RemotePhysListenPort, t.remote_phys_listen_port as u32)
        .put_u32(OptionCode::RemoteTunnelComPort, t.remote_tunnel_com_port as u32)
        .put_str(OptionCode::InterfaceName, t.local_interface_name.clone())
        .put_str(OptionCode::TunnelNetwork, t.tunnel_network.to_string())
        .put_u32(OptionCode::KeepalivePolicy, t.keepalive as u32)
        .put_str(OptionCode::LocalWgPublicKey, t.local_public_key.clone());
    if !t.remote_public_key.is_empty() {
        msg.put_str(OptionCode::RemoteWgPublicKey, t.remote_public_key.clone());
    }
}
