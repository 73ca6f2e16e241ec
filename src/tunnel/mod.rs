//! Tunnel Records
//!
//! A tunnel record is the outcome of one negotiation: both physical
//! endpoints, both tunnel addresses, the tunnel network, the keys and the
//! current state label. Records are created when a handshake accepts and
//! are updated as later steps learn more about the peer.

pub mod network;

pub use network::TunnelNetwork;

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Family, MessageType};

/// Human readable tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelState {
    Discover,
    Offer,
    Request,
    Acknowledge,
    Solicit,
    Advertise,
    Reply,
    TunnelPing,
    TunnelPingReply,
    PeerConfigError,
    Up,
    Down,
}

impl TunnelState {
    const ALL: [TunnelState; 12] = [
        TunnelState::Discover,
        TunnelState::Offer,
        TunnelState::Request,
        TunnelState::Acknowledge,
        TunnelState::Solicit,
        TunnelState::Advertise,
        TunnelState::Reply,
        TunnelState::TunnelPing,
        TunnelState::TunnelPingReply,
        TunnelState::PeerConfigError,
        TunnelState::Up,
        TunnelState::Down,
    ];

    /// State reached once a step of the given type has been handled
    pub fn after(family: Family, msg_type: MessageType) -> TunnelState {
        match (msg_type, family) {
            (MessageType::Discover, Family::V4) => TunnelState::Discover,
            (MessageType::Discover, Family::V6) => TunnelState::Solicit,
            (MessageType::Offer, Family::V4) => TunnelState::Offer,
            (MessageType::Offer, Family::V6) => TunnelState::Advertise,
            (MessageType::Request, _) => TunnelState::Request,
            (MessageType::Ack, Family::V4) => TunnelState::Acknowledge,
            (MessageType::Ack, Family::V6) => TunnelState::Reply,
            (MessageType::TunnelPing, _) => TunnelState::TunnelPing,
            (MessageType::TunnelPingReply, _) => TunnelState::TunnelPingReply,
            (MessageType::InfoRequest | MessageType::InfoRequestReply, _) => TunnelState::Up,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TunnelState::Discover => "Discover",
            TunnelState::Offer => "Offer",
            TunnelState::Request => "Request",
            TunnelState::Acknowledge => "Acknowledge",
            TunnelState::Solicit => "Solicit",
            TunnelState::Advertise => "Advertise",
            TunnelState::Reply => "Reply",
            TunnelState::TunnelPing => "Tunnel Ping",
            TunnelState::TunnelPingReply => "Tunnel Ping Reply",
            TunnelState::PeerConfigError => "Peer Config Error",
            TunnelState::Up => "Up",
            TunnelState::Down => "Down",
        }
    }

    pub fn from_label(label: &str) -> Option<TunnelState> {
        Self::ALL.iter().copied().find(|s| s.label() == label)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Which side of the handshake an endpoint played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    Server,
    Client,
}

impl EndpointType {
    pub fn label(&self) -> &'static str {
        match self {
            EndpointType::Server => "Server",
            EndpointType::Client => "Client",
        }
    }

    pub fn from_label(label: &str) -> Option<EndpointType> {
        match label {
            "Server" => Some(EndpointType::Server),
            "Client" => Some(EndpointType::Client),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Record fields reported through state-change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelField {
    State,
    RemotePublicKey,
    RemoteListenPort,
    RemoteInterfaceName,
    TunnelNetwork,
    Keepalive,
}

/// Negotiated tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: Uuid,
    /// Generic id the peer announced for itself
    pub remote_id: u32,
    pub family: Family,

    pub local_endpoint_type: EndpointType,
    pub remote_endpoint_type: EndpointType,

    pub local_phys_addr: IpAddr,
    pub local_phys_listen_port: u16,
    pub local_phys_com_port: u16,

    pub remote_phys_addr: IpAddr,
    pub remote_phys_listen_port: u16,
    pub remote_phys_com_port: u16,

    pub tunnel_network: TunnelNetwork,
    pub local_tunnel_addr: IpAddr,
    pub local_tunnel_com_port: u16,
    pub remote_tunnel_addr: IpAddr,
    pub remote_tunnel_com_port: u16,

    pub local_interface_name: String,
    pub remote_interface_name: String,

    pub local_public_key: String,
    /// Never leaves the process in serialized form
    #[serde(skip_serializing, default)]
    pub local_private_key: String,
    pub remote_public_key: String,

    /// Persistent keepalive in seconds (0 = off)
    pub keepalive: u16,
    pub state: TunnelState,
    pub updated_at: DateTime<Utc>,
}

impl TunnelRecord {
    /// Local tunnel socket used for tunnel pings
    pub fn local_tunnel_sock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_tunnel_addr, self.local_tunnel_com_port)
    }

    /// Remote tunnel socket used for tunnel pings
    pub fn remote_tunnel_sock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_tunnel_addr, self.remote_tunnel_com_port)
    }

    /// WireGuard endpoint of the peer
    pub fn remote_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.remote_phys_addr, self.remote_phys_listen_port)
    }

    pub fn set_state(&mut self, state: TunnelState) {
        self.state = state;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_up(&self) -> bool {
        self.state == TunnelState::Up
    }
}
