//! Negotiation Options
//!
//! Every option is a TLV: a 4-byte code, a 4-byte length and `length` bytes
//! of value. The code alone decides how the value is interpreted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use super::Family;
use crate::error::DecodeError;

/// Lowest option code accepted by the V6 decoder
pub const OPTION_CODE_MIN: u32 = 153;

/// Highest option code accepted by the V6 decoder
pub const OPTION_CODE_MAX: u32 = 255;

/// Terminates a V4 option list
pub const OPTION_EOF: u32 = 255;

/// Known option codes, declared in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionCode {
    MessageType,
    MessageSender,
    RemotePhysAddr,
    LocalPhysAddr,
    LocalTunnelAddr,
    RemoteTunnelAddr,
    RemoteTunnelComPort,
    InterfaceName,
    RemoteWgPublicKey,
    LocalWgPublicKey,
    RemoteEndpointType,
    LocalEndpointType,
    RemotePhysListenPort,
    LocalPhysListenPort,
    RemotePhysComPort,
    LocalPhysComPort,
    TunnelId,
    GenericId,
    KeepalivePolicy,
    TunnelStatus,
    GenericResponse,
    SpecificInfo,
    ClientOtherPhysAddrs,
    GenericPublicKey,
    LocalGenericPublicKey,
    PingAddr,
    PingPort,
    TunnelNetwork,
}

/// How an option value is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    UnsignedByte,
    UnsignedInt,
    IpAddress,
    String,
    ByteArray,
    Opaque,
}

impl OptionCode {
    pub fn code(&self) -> u32 {
        match self {
            OptionCode::MessageType => 153,
            OptionCode::MessageSender => 154,
            OptionCode::RemotePhysAddr => 155,
            OptionCode::LocalPhysAddr => 156,
            OptionCode::LocalTunnelAddr => 157,
            OptionCode::RemoteTunnelAddr => 158,
            OptionCode::RemoteTunnelComPort => 159,
            OptionCode::InterfaceName => 160,
            OptionCode::RemoteWgPublicKey => 161,
            OptionCode::LocalWgPublicKey => 162,
            OptionCode::RemoteEndpointType => 163,
            OptionCode::LocalEndpointType => 164,
            OptionCode::RemotePhysListenPort => 165,
            OptionCode::LocalPhysListenPort => 166,
            OptionCode::RemotePhysComPort => 167,
            OptionCode::LocalPhysComPort => 168,
            OptionCode::TunnelId => 169,
            OptionCode::GenericId => 170,
            OptionCode::KeepalivePolicy => 171,
            OptionCode::TunnelStatus => 172,
            OptionCode::GenericResponse => 173,
            OptionCode::SpecificInfo => 174,
            OptionCode::ClientOtherPhysAddrs => 175,
            OptionCode::GenericPublicKey => 176,
            OptionCode::LocalGenericPublicKey => 177,
            OptionCode::PingAddr => 178,
            OptionCode::PingPort => 179,
            OptionCode::TunnelNetwork => 180,
        }
    }

    pub fn from_code(code: u32) -> Option<OptionCode> {
        let option = match code {
            153 => OptionCode::MessageType,
            154 => OptionCode::MessageSender,
            155 => OptionCode::RemotePhysAddr,
            156 => OptionCode::LocalPhysAddr,
            157 => OptionCode::LocalTunnelAddr,
            158 => OptionCode::RemoteTunnelAddr,
            159 => OptionCode::RemoteTunnelComPort,
            160 => OptionCode::InterfaceName,
            161 => OptionCode::RemoteWgPublicKey,
            162 => OptionCode::LocalWgPublicKey,
            163 => OptionCode::RemoteEndpointType,
            164 => OptionCode::LocalEndpointType,
            165 => OptionCode::RemotePhysListenPort,
            166 => OptionCode::LocalPhysListenPort,
            167 => OptionCode::RemotePhysComPort,
            168 => OptionCode::LocalPhysComPort,
            169 => OptionCode::TunnelId,
            170 => OptionCode::GenericId,
            171 => OptionCode::KeepalivePolicy,
            172 => OptionCode::TunnelStatus,
            173 => OptionCode::GenericResponse,
            174 => OptionCode::SpecificInfo,
            175 => OptionCode::ClientOtherPhysAddrs,
            176 => OptionCode::GenericPublicKey,
            177 => OptionCode::LocalGenericPublicKey,
            178 => OptionCode::PingAddr,
            179 => OptionCode::PingPort,
            180 => OptionCode::TunnelNetwork,
            _ => return None,
        };
        Some(option)
    }

    pub fn kind(&self) -> OptionKind {
        use OptionCode::*;
        match self {
            MessageType | MessageSender => OptionKind::UnsignedByte,
            RemotePhysAddr | LocalPhysAddr | LocalTunnelAddr | RemoteTunnelAddr | PingAddr => {
                OptionKind::IpAddress
            }
            RemoteTunnelComPort | RemotePhysListenPort | LocalPhysListenPort
            | RemotePhysComPort | LocalPhysComPort | KeepalivePolicy | GenericResponse
            | PingPort => OptionKind::UnsignedInt,
            InterfaceName | RemoteWgPublicKey | LocalWgPublicKey | RemoteEndpointType
            | LocalEndpointType | TunnelId | GenericId | TunnelStatus | SpecificInfo
            | GenericPublicKey | TunnelNetwork => OptionKind::String,
            LocalGenericPublicKey => OptionKind::ByteArray,
            ClientOtherPhysAddrs => OptionKind::Opaque,
        }
    }
}

impl std::fmt::Display for OptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Raw option bytes; shown as text when printable and as hex otherwise
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Opaque(Vec<u8>);

impl Opaque {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Opaque(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn is_printable(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ')
    }
}

impl From<&str> for Opaque {
    fn from(text: &str) -> Self {
        Opaque(text.as_bytes().to_vec())
    }
}

impl std::fmt::Display for Opaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_printable() {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

/// Decoded option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    UnsignedByte(u8),
    UnsignedInt(u32),
    IpAddress(IpAddr),
    String(String),
    ByteArray(Vec<u8>),
    Opaque(Opaque),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::UnsignedByte(_) => OptionKind::UnsignedByte,
            OptionValue::UnsignedInt(_) => OptionKind::UnsignedInt,
            OptionValue::IpAddress(_) => OptionKind::IpAddress,
            OptionValue::String(_) => OptionKind::String,
            OptionValue::ByteArray(_) => OptionKind::ByteArray,
            OptionValue::Opaque(_) => OptionKind::Opaque,
        }
    }

    /// Number of value bytes this option occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            OptionValue::UnsignedByte(_) => 1,
            OptionValue::UnsignedInt(_) => 4,
            OptionValue::IpAddress(IpAddr::V4(_)) => 4,
            OptionValue::IpAddress(IpAddr::V6(_)) => 16,
            OptionValue::String(s) => s.len(),
            OptionValue::ByteArray(b) => b.len(),
            OptionValue::Opaque(o) => o.as_bytes().len(),
        }
    }
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::UnsignedByte(v) => write!(f, "{}", v),
            OptionValue::UnsignedInt(v) => write!(f, "{}", v),
            OptionValue::IpAddress(ip) => write!(f, "{}", ip),
            OptionValue::String(s) => write!(f, "{}", s),
            OptionValue::ByteArray(b) => write!(f, "0x{}", hex::encode(b)),
            OptionValue::Opaque(o) => write!(f, "{}", o),
        }
    }
}

/// Append one option TLV to `buf`
pub fn encode_option(buf: &mut BytesMut, code: OptionCode, value: &OptionValue) {
    buf.put_u32(code.code());
    buf.put_u32(value.encoded_len() as u32);
    match value {
        OptionValue::UnsignedByte(v) => buf.put_u8(*v),
        OptionValue::UnsignedInt(v) => buf.put_u32(*v),
        OptionValue::IpAddress(IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
        OptionValue::IpAddress(IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
        OptionValue::String(s) => buf.put_slice(s.as_bytes()),
        OptionValue::ByteArray(b) => buf.put_slice(b),
        OptionValue::Opaque(o) => buf.put_slice(o.as_bytes()),
    }
}

/// Decode the length and value of an option whose code has already been read
pub fn decode_option_value<B: Buf>(
    buf: &mut B,
    family: Family,
    code: OptionCode,
) -> Result<OptionValue, DecodeError> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len)?;

    let invalid = |reason: String| DecodeError::InvalidOption { code: code.code(), reason };

    let value = match code.kind() {
        OptionKind::UnsignedByte => {
            if len != 1 {
                return Err(invalid(format!("expected 1 byte, got {}", len)));
            }
            OptionValue::UnsignedByte(buf.get_u8())
        }
        OptionKind::UnsignedInt => {
            if len != 4 {
                return Err(invalid(format!("expected 4 bytes, got {}", len)));
            }
            OptionValue::UnsignedInt(buf.get_u32())
        }
        OptionKind::IpAddress => match len {
            4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                OptionValue::IpAddress(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                OptionValue::IpAddress(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => {
                return Err(invalid(format!(
                    "expected a {}-byte {} address, got {} bytes",
                    family.address_len(),
                    family,
                    other
                )))
            }
        },
        OptionKind::String => {
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            let s = String::from_utf8(raw).map_err(|e| invalid(e.to_string()))?;
            OptionValue::String(s)
        }
        OptionKind::ByteArray => {
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            OptionValue::ByteArray(raw)
        }
        OptionKind::Opaque => {
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            OptionValue::Opaque(Opaque::from_bytes(&raw))
        }
    };

    Ok(value)
}

pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
