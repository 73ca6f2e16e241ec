//! Negotiation Protocol
//!
//! Constants and small enumerations shared by the V4 and V6 variants of the
//! tunnel negotiation protocol. The wire layout lives in [`message`] and the
//! option TLVs in [`option`].

pub mod message;
pub mod option;

pub use message::{Message, V4Header};
pub use option::{Opaque, OptionCode, OptionValue};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Default V4 protocol port
pub const V4_PORT: u16 = 268;

/// Default V6 protocol port
pub const V6_PORT: u16 = 547;

/// V4 magic cookie following the fixed header
pub const V4_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// V4 op codes
pub const V4_OP_REQUEST: u8 = 101;
pub const V4_OP_REPLY: u8 = 102;

/// V4 hardware type written into every header
pub const V4_HTYPE: u8 = 1;

/// Transaction wait before a step is retried or abandoned
pub const WAIT_FOR_REPLY_SECS: u64 = 300;

/// Upper bound on concurrently running sessions per family
pub const MAX_SESSIONS: usize = 32;

/// Datagram receive buffer size
pub const BUFFER_SIZE: usize = 51200;

/// Address family of a protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Default UDP port for this family
    pub fn default_port(&self) -> u16 {
        match self {
            Family::V4 => V4_PORT,
            Family::V6 => V6_PORT,
        }
    }

    /// Default multicast group used when no remote address is configured
    pub fn default_multicast_group(&self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1)),
            Family::V6 => IpAddr::V6(Ipv6Addr::new(0xff7e, 0x230, 0, 0, 0, 0, 0, 0x1234)),
        }
    }

    /// Width of one address segment in bits
    pub fn segment_bits(&self) -> u8 {
        match self {
            Family::V4 => 8,
            Family::V6 => 16,
        }
    }

    /// Total address width in bits
    pub fn address_bits(&self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Length in bytes of an encoded address
    pub fn address_len(&self) -> usize {
        match self {
            Family::V4 => 4,
            Family::V6 => 16,
        }
    }

    /// Accepted tunnel network prefix lengths (inclusive)
    pub fn prefix_bounds(&self) -> (u8, u8) {
        match self {
            Family::V4 => (8, 24),
            Family::V6 => (16, 112),
        }
    }

    /// Prefix used for tunnel interface names of this family
    pub fn interface_tag(&self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }

    /// Family of an address
    pub fn of(addr: &IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(&self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "V4"),
            Family::V6 => write!(f, "V6"),
        }
    }
}

/// Negotiation message types, shared by both families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Discover (V4) / Solicit (V6)
    Discover,
    /// Offer (V4) / Advertise (V6)
    Offer,
    Request,
    /// Ack (V4) / Reply (V6)
    Ack,
    TunnelPing,
    TunnelPingReply,
    InfoRequest,
    InfoRequestReply,
}

impl MessageType {
    const ALL: [MessageType; 8] = [
        MessageType::Discover,
        MessageType::Offer,
        MessageType::Request,
        MessageType::Ack,
        MessageType::TunnelPing,
        MessageType::TunnelPingReply,
        MessageType::InfoRequest,
        MessageType::InfoRequestReply,
    ];

    fn ordinal(&self) -> u8 {
        match self {
            MessageType::Discover => 0,
            MessageType::Offer => 1,
            MessageType::Request => 2,
            MessageType::Ack => 3,
            MessageType::TunnelPing => 4,
            MessageType::TunnelPingReply => 5,
            MessageType::InfoRequest => 6,
            MessageType::InfoRequestReply => 7,
        }
    }

    /// Wire code of this message type
    pub fn code(&self, family: Family) -> u8 {
        match family {
            Family::V4 => 103 + self.ordinal(),
            Family::V6 => 3 + self.ordinal(),
        }
    }

    /// Message type for a wire code, if the code is in range
    pub fn from_code(family: Family, code: u8) -> Option<MessageType> {
        let base = match family {
            Family::V4 => 103,
            Family::V6 => 3,
        };
        code.checked_sub(base)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }

    /// Human readable name as used in logs and status labels
    pub fn name(&self, family: Family) -> &'static str {
        match (self, family) {
            (MessageType::Discover, Family::V4) => "Discover",
            (MessageType::Discover, Family::V6) => "Solicit",
            (MessageType::Offer, Family::V4) => "Offer",
            (MessageType::Offer, Family::V6) => "Advertise",
            (MessageType::Request, _) => "Request",
            (MessageType::Ack, Family::V4) => "Ack",
            (MessageType::Ack, Family::V6) => "Reply",
            (MessageType::TunnelPing, _) => "Tunnel Ping",
            (MessageType::TunnelPingReply, _) => "Tunnel Ping Reply",
            (MessageType::InfoRequest, _) => "Info Request",
            (MessageType::InfoRequestReply, _) => "Info Request Reply",
        }
    }
}

/// Role of the endpoint that sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    Server,
    Client,
}

impl Sender {
    pub fn code(&self, family: Family) -> u8 {
        match (self, family) {
            (Sender::Server, Family::V4) => 101,
            (Sender::Client, Family::V4) => 102,
            (Sender::Server, Family::V6) => 1,
            (Sender::Client, Family::V6) => 2,
        }
    }

    pub fn from_code(family: Family, code: u8) -> Option<Sender> {
        match (family, code) {
            (Family::V4, 101) | (Family::V6, 1) => Some(Sender::Server),
            (Family::V4, 102) | (Family::V6, 2) => Some(Sender::Client),
            _ => None,
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sender::Server => write!(f, "Server"),
            Sender::Client => write!(f, "Client"),
        }
    }
}

/// Accept/decline code exchanged in offers and requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericResponse {
    Accept,
    DeclineRedundantPublicKey,
    DeclineTunnelNetwork,
    DeclineRedundantTunnel,
}

impl GenericResponse {
    pub fn code(&self) -> u32 {
        match self {
            GenericResponse::Accept => 0,
            GenericResponse::DeclineRedundantPublicKey => 1,
            GenericResponse::DeclineTunnelNetwork => 2,
            GenericResponse::DeclineRedundantTunnel => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<GenericResponse> {
        match code {
            0 => Some(GenericResponse::Accept),
            1 => Some(GenericResponse::DeclineRedundantPublicKey),
            2 => Some(GenericResponse::DeclineTunnelNetwork),
            3 => Some(GenericResponse::DeclineRedundantTunnel),
            _ => None,
        }
    }
}

impl std::fmt::Display for GenericResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenericResponse::Accept => write!(f, "ACCEPT"),
            GenericResponse::DeclineRedundantPublicKey => write!(f, "DECLINE_REDUNDANT_PUBLIC_KEY"),
            GenericResponse::DeclineTunnelNetwork => write!(f, "DECLINE_TUNNEL_NETWORK"),
            GenericResponse::DeclineRedundantTunnel => write!(f, "DECLINE_REDUNDANT_TUNNEL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::Discover.code(Family::V4), 103);
        assert_eq!(MessageType::InfoRequestReply.code(Family::V4), 110);
        assert_eq!(MessageType::Discover.code(Family::V6), 3);
        assert_eq!(MessageType::InfoRequestReply.code(Family::V6), 10);

        assert_eq!(MessageType::from_code(Family::V4, 106), Some(MessageType::Ack));
        assert_eq!(MessageType::from_code(Family::V6, 6), Some(MessageType::Ack));
        assert_eq!(MessageType::from_code(Family::V6, 2), None);
        assert_eq!(MessageType::from_code(Family::V6, 11), None);
        assert_eq!(MessageType::from_code(Family::V4, 111), None);
    }

    #[test]
    fn test_sender_codes() {
        assert_eq!(Sender::from_code(Family::V4, 101), Some(Sender::Server));
        assert_eq!(Sender::from_code(Family::V6, 2), Some(Sender::Client));
        assert_eq!(Sender::from_code(Family::V6, 101), None);
    }

    #[test]
    fn test_generic_response_codes() {
        for r in [
            GenericResponse::Accept,
            GenericResponse::DeclineRedundantPublicKey,
            GenericResponse::DeclineTunnelNetwork,
            GenericResponse::DeclineRedundantTunnel,
        ] {
            assert_eq!(GenericResponse::from_code(r.code()), Some(r));
        }
        assert_eq!(GenericResponse::from_code(9), None);
    }
}
