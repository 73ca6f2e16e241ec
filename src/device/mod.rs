//! Tunnel Device Configuration
//!
//! The negotiation engine never touches network devices directly. It asks a
//! [`DeviceConfig`] implementation to create interfaces, assign addresses,
//! install keys and peers. [`WgDevice`] drives the `ip` and `wg` utilities;
//! [`MemoryDevice`] keeps everything in process for dry runs and tests.

mod memory;
mod wg;

pub use memory::MemoryDevice;
pub use wg::WgDevice;

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Result;

/// Keys for one tunnel interface, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Generate a fresh X25519 key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    /// Derive the public key for a base64 private key
    pub fn public_from_private(private_key: &str) -> Option<String> {
        let bytes = BASE64.decode(private_key.trim()).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        let secret = StaticSecret::from(bytes);
        Some(BASE64.encode(PublicKey::from(&secret).as_bytes()))
    }
}

/// A configured tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    pub listen_port: u16,
}

/// Peer entry installed on an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ip: IpAddr,
    pub allowed_prefix_len: u8,
    pub endpoint: SocketAddr,
    /// Persistent keepalive in seconds (0 = off)
    pub keepalive: u16,
}

/// Device-config collaborator
#[async_trait]
pub trait DeviceConfig: Send + Sync {
    async fn create_interface(&self, name: &str) -> Result<()>;

    async fn delete_interface(&self, name: &str) -> Result<()>;

    async fn set_interface_address(&self, name: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;

    async fn set_private_key(&self, name: &str, private_key: &str) -> Result<()>;

    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()>;

    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()>;

    async fn bring_up(&self, name: &str) -> Result<()>;

    async fn listen_port(&self, name: &str) -> Result<u16>;

    async fn generate_key_pair(&self) -> Result<KeyPair> {
        Ok(KeyPair::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_consistent() {
        let keys = KeyPair::generate();
        assert_eq!(BASE64.decode(&keys.private_key).unwrap().len(), 32);
        assert_eq!(KeyPair::public_from_private(&keys.private_key), Some(keys.public_key.clone()));
        assert_ne!(KeyPair::generate().public_key, keys.public_key);
        assert_eq!(KeyPair::public_from_private("not base64"), None);
    }
}
