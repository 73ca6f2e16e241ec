//! WolfConnect - Automatic WireGuard Tunnel Negotiation
//!
//! Hosts running WolfConnect find each other over UDP, either through
//! configured peer addresses or a multicast group, and negotiate a
//! point-to-point WireGuard tunnel per pair of physical addresses.
//!
//! # Architecture
//!
//! One negotiation engine runs per address family. Its dispatcher routes
//! inbound messages to per-peer sessions, each of which walks the
//! Discover, Offer, Request, Ack and Tunnel Ping handshake (Solicit,
//! Advertise and Reply for V6) in the client or server role. Finished
//! tunnels live in a shared registry and are persisted to SQLite.
//!
//! # Features
//!
//! - DHCP-style V4 and V6 wire formats with typed options
//! - Multicast peer discovery
//! - Tunnel network allocation with conflict resolution between peers
//! - One retry per handshake step, bounded concurrent sessions
//! - Interface and key management through `ip` and `wg`

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod network;
pub mod notify;
pub mod protocol;
pub mod state;
pub mod tunnel;

pub use config::WolfConnectConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FamilySettings, WolfConnectConfig};
    pub use crate::engine::{Engine, EngineContext};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{Family, Message, MessageType, OptionCode, Sender};
    pub use crate::state::{TunnelRegistry, TunnelTracker};
    pub use crate::tunnel::{TunnelNetwork, TunnelRecord, TunnelState};
}
