//! Negotiation Messages
//!
//! V4 datagrams carry a 24-byte header, a magic cookie, the options and a
//! terminating EOF code. V6 datagrams carry an 8-byte header followed by the
//! options, without cookie or terminator.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::option::{
    decode_option_value, encode_option, ensure_remaining, OptionCode, OptionValue,
    OPTION_CODE_MAX, OPTION_CODE_MIN, OPTION_EOF,
};
use super::{Family, MessageType, Sender, V4_HTYPE, V4_MAGIC_COOKIE, V4_OP_REPLY, V4_OP_REQUEST};
use crate::error::DecodeError;

/// Size of the fixed V4 header
pub const V4_HEADER_LEN: usize = 24;

/// Size of the fixed V6 header
pub const V6_HEADER_LEN: usize = 8;

/// Fixed part of a V4 datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V4Header {
    pub op: u8,
    pub htype: u8,
    pub client_addr: Ipv4Addr,
    pub client_port: u32,
    pub server_addr: Ipv4Addr,
    pub server_port: u32,
}

impl V4Header {
    /// Client endpoint named in the header
    pub fn client(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.client_addr), self.client_port as u16)
    }

    /// Server endpoint named in the header
    pub fn server(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.server_addr), self.server_port as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    V4(V4Header),
    V6 { msg_type: u8 },
}

/// A decoded or under-construction negotiation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    /// Transaction id
    pub xid: u32,
    options: BTreeMap<OptionCode, OptionValue>,
    /// Local socket the message was received on or will be sent from
    pub local: SocketAddr,
    /// Remote socket the message came from or will be sent to
    pub remote: SocketAddr,
}

impl Message {
    /// Build an empty message of the given type.
    ///
    /// For V4 the header op follows the sender (clients send requests,
    /// servers send replies) and the header endpoints are filled from
    /// `local`/`remote` according to the sender's role.
    pub fn new(
        family: Family,
        msg_type: MessageType,
        sender: Sender,
        xid: u32,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        let header = match family {
            Family::V4 => {
                let (client, server) = match sender {
                    Sender::Client => (local, remote),
                    Sender::Server => (remote, local),
                };
                Header::V4(V4Header {
                    op: match sender {
                        Sender::Client => V4_OP_REQUEST,
                        Sender::Server => V4_OP_REPLY,
                    },
                    htype: V4_HTYPE,
                    client_addr: ipv4_or_unspecified(client.ip()),
                    client_port: client.port() as u32,
                    server_addr: ipv4_or_unspecified(server.ip()),
                    server_port: server.port() as u32,
                })
            }
            Family::V6 => Header::V6 { msg_type: msg_type.code(Family::V6) },
        };

        let mut msg = Self {
            header,
            xid,
            options: BTreeMap::new(),
            local,
            remote,
        };
        msg.set_message_type(msg_type);
        msg.set_sender(sender);
        msg
    }

    /// Build a V4 message with an explicit header and no options
    pub fn with_v4_header(header: V4Header, xid: u32, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            header: Header::V4(header),
            xid,
            options: BTreeMap::new(),
            local,
            remote,
        }
    }

    /// Build a V6 message with a raw header type byte and no options
    pub fn with_v6_header(msg_type: u8, xid: u32, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            header: Header::V6 { msg_type },
            xid,
            options: BTreeMap::new(),
            local,
            remote,
        }
    }

    pub fn family(&self) -> Family {
        match self.header {
            Header::V4(_) => Family::V4,
            Header::V6 { .. } => Family::V6,
        }
    }

    pub fn v4_header(&self) -> Option<&V4Header> {
        match &self.header {
            Header::V4(h) => Some(h),
            Header::V6 { .. } => None,
        }
    }

    pub fn v4_header_mut(&mut self) -> Option<&mut V4Header> {
        match &mut self.header {
            Header::V4(h) => Some(h),
            Header::V6 { .. } => None,
        }
    }

    /// Message type, read from option 153 (V4) or the header byte (V6)
    pub fn message_type(&self) -> Option<MessageType> {
        match self.header {
            Header::V4(_) => match self.get(OptionCode::MessageType) {
                Some(OptionValue::UnsignedByte(code)) => MessageType::from_code(Family::V4, *code),
                _ => None,
            },
            Header::V6 { msg_type } => MessageType::from_code(Family::V6, msg_type),
        }
    }

    pub fn set_message_type(&mut self, msg_type: MessageType) {
        match &mut self.header {
            Header::V4(_) => {
                self.options.insert(
                    OptionCode::MessageType,
                    OptionValue::UnsignedByte(msg_type.code(Family::V4)),
                );
            }
            Header::V6 { msg_type: byte } => *byte = msg_type.code(Family::V6),
        }
    }

    /// Role of the sender, read from option 154
    pub fn sender(&self) -> Option<Sender> {
        match self.get(OptionCode::MessageSender) {
            Some(OptionValue::UnsignedByte(code)) => Sender::from_code(self.family(), *code),
            _ => None,
        }
    }

    pub fn set_sender(&mut self, sender: Sender) {
        let code = sender.code(self.family());
        self.options.insert(OptionCode::MessageSender, OptionValue::UnsignedByte(code));
    }

    /// Insert or replace an option.
    ///
    /// The value variant must match the code's wire kind.
    pub fn put(&mut self, code: OptionCode, value: OptionValue) -> &mut Self {
        debug_assert_eq!(code.kind(), value.kind(), "option {} value kind", code);
        self.options.insert(code, value);
        self
    }

    pub fn put_str(&mut self, code: OptionCode, value: impl Into<String>) -> &mut Self {
        self.put(code, OptionValue::String(value.into()))
    }

    pub fn put_u32(&mut self, code: OptionCode, value: u32) -> &mut Self {
        self.put(code, OptionValue::UnsignedInt(value))
    }

    pub fn put_ip(&mut self, code: OptionCode, value: IpAddr) -> &mut Self {
        self.put(code, OptionValue::IpAddress(value))
    }

    pub fn get(&self, code: OptionCode) -> Option<&OptionValue> {
        self.options.get(&code)
    }

    pub fn remove(&mut self, code: OptionCode) -> Option<OptionValue> {
        self.options.remove(&code)
    }

    pub fn has(&self, code: OptionCode) -> bool {
        self.options.contains_key(&code)
    }

    pub fn get_str(&self, code: OptionCode) -> Option<&str> {
        match self.get(code) {
            Some(OptionValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_u32(&self, code: OptionCode) -> Option<u32> {
        match self.get(code) {
            Some(OptionValue::UnsignedInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ip(&self, code: OptionCode) -> Option<IpAddr> {
        match self.get(code) {
            Some(OptionValue::IpAddress(ip)) => Some(*ip),
            _ => None,
        }
    }

    /// Options in code order
    pub fn options(&self) -> impl Iterator<Item = (&OptionCode, &OptionValue)> {
        self.options.iter()
    }

    /// First code of `required` that is absent
    pub fn first_missing(&self, required: &[OptionCode]) -> Option<OptionCode> {
        required.iter().copied().find(|code| !self.has(*code))
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match &self.header {
            Header::V4(h) => {
                buf.put_u8(h.op);
                buf.put_u8(h.htype);
                buf.put_u16(0);
                buf.put_u32(self.xid);
                buf.put_slice(&h.client_addr.octets());
                buf.put_u32(h.client_port);
                buf.put_slice(&h.server_addr.octets());
                buf.put_u32(h.server_port);
                buf.put_slice(&V4_MAGIC_COOKIE);
                for (code, value) in &self.options {
                    encode_option(&mut buf, *code, value);
                }
                buf.put_u32(OPTION_EOF);
            }
            Header::V6 { msg_type } => {
                buf.put_u8(*msg_type);
                buf.put_slice(&[0, 0, 0]);
                buf.put_u32(self.xid);
                for (code, value) in &self.options {
                    encode_option(&mut buf, *code, value);
                }
            }
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        let options: usize = self.options.values().map(|v| 8 + v.encoded_len()).sum();
        match self.header {
            Header::V4(_) => V4_HEADER_LEN + V4_MAGIC_COOKIE.len() + options + 4,
            Header::V6 { .. } => V6_HEADER_LEN + options,
        }
    }

    /// Decode a datagram received on `local` from `remote`
    pub fn decode(
        family: Family,
        bytes: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Message, DecodeError> {
        match family {
            Family::V4 => Self::decode_v4(bytes, local, remote),
            Family::V6 => Self::decode_v6(bytes, local, remote),
        }
    }

    fn decode_v4(mut buf: &[u8], local: SocketAddr, remote: SocketAddr) -> Result<Message, DecodeError> {
        ensure_remaining(&buf, V4_HEADER_LEN)?;

        let op = buf.get_u8();
        if op != V4_OP_REQUEST && op != V4_OP_REPLY {
            return Err(DecodeError::UnsupportedOp(op));
        }
        let htype = buf.get_u8();
        buf.advance(2);
        let xid = buf.get_u32();
        let client_addr = Ipv4Addr::from(buf.get_u32());
        let client_port = buf.get_u32();
        let server_addr = Ipv4Addr::from(buf.get_u32());
        let server_port = buf.get_u32();

        ensure_remaining(&buf, V4_MAGIC_COOKIE.len())?;
        let mut cookie = [0u8; 4];
        buf.copy_to_slice(&mut cookie);
        if cookie != V4_MAGIC_COOKIE {
            return Err(DecodeError::BadCookie(cookie));
        }

        let header = V4Header {
            op,
            htype,
            client_addr,
            client_port,
            server_addr,
            server_port,
        };
        let mut msg = Message::with_v4_header(header, xid, local, remote);

        while buf.remaining() >= 4 {
            let code = buf.get_u32();
            if code == OPTION_EOF {
                break;
            }
            let Some(option) = OptionCode::from_code(code) else {
                tracing::debug!("Unknown V4 option code {}, ignoring the rest of the message", code);
                break;
            };
            let value = decode_option_value(&mut buf, Family::V4, option)?;
            msg.options.insert(option, value);
        }

        if let Some(OptionValue::UnsignedByte(code)) = msg.get(OptionCode::MessageType) {
            if MessageType::from_code(Family::V4, *code).is_none() {
                return Err(DecodeError::UnsupportedMessageType(*code));
            }
        }

        Ok(msg)
    }

    fn decode_v6(mut buf: &[u8], local: SocketAddr, remote: SocketAddr) -> Result<Message, DecodeError> {
        ensure_remaining(&buf, 1)?;
        let msg_type = buf[0];
        if MessageType::from_code(Family::V6, msg_type).is_none() {
            return Err(DecodeError::UnsupportedMessageType(msg_type));
        }
        ensure_remaining(&buf, V6_HEADER_LEN)?;
        buf.advance(4);
        let xid = buf.get_u32();

        let mut msg = Message::with_v6_header(msg_type, xid, local, remote);

        while buf.remaining() >= 4 {
            let code = buf.get_u32();
            if !(OPTION_CODE_MIN..=OPTION_CODE_MAX).contains(&code) || code == OPTION_EOF {
                tracing::debug!("V6 option code {} outside the option window, stopping", code);
                break;
            }
            let Some(option) = OptionCode::from_code(code) else {
                tracing::debug!("Unknown V6 option code {}, ignoring the rest of the message", code);
                break;
            };
            let value = decode_option_value(&mut buf, Family::V6, option)?;
            msg.options.insert(option, value);
        }

        Ok(msg)
    }

    /// One-line summary for logs
    pub fn describe(&self) -> String {
        let family = self.family();
        let sender = self.sender().map(|s| s.to_string()).unwrap_or_else(|| "Unknown".into());
        let msg_type = self
            .message_type()
            .map(|t| t.name(family))
            .unwrap_or("Unknown");
        format!("{} {} {} (xid = {}) {} -> {}", family, sender, msg_type, self.xid, self.remote, self.local)
    }
}

fn ipv4_or_unspecified(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}
