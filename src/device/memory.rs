//! In-process device configuration used for dry runs and tests

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DeviceConfig, PeerConfig};
use crate::error::{Error, Result};

/// First listen port handed out
const BASE_LISTEN_PORT: u16 = 51820;

/// State of one simulated interface
#[derive(Debug, Clone, Default)]
pub struct MemoryInterface {
    pub addresses: Vec<(IpAddr, u8)>,
    pub private_key: Option<String>,
    pub peers: Vec<PeerConfig>,
    pub up: bool,
    pub listen_port: u16,
}

/// Records every device operation instead of performing it
#[derive(Default)]
pub struct MemoryDevice {
    interfaces: Mutex<HashMap<String, MemoryInterface>>,
    failing_op: Mutex<Option<&'static str>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail (e.g. `"set_peer"`)
    pub fn fail_on(&self, op: &'static str) {
        if let Ok(mut failing) = self.failing_op.lock() {
            *failing = Some(op);
        }
    }

    /// Snapshot of an interface
    pub fn interface(&self, name: &str) -> Option<MemoryInterface> {
        self.interfaces.lock().ok()?.get(name).cloned()
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.lock().map(|i| i.len()).unwrap_or(0)
    }

    fn with_interface<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&mut MemoryInterface) -> T,
    ) -> Result<T> {
        let failing = self.failing_op.lock().map(|f| *f).unwrap_or(None);
        if failing == Some(op) {
            return Err(Error::Device {
                interface: name.to_string(),
                reason: format!("{} rejected", op),
            });
        }

        let mut interfaces = self
            .interfaces
            .lock()
            .map_err(|_| Error::Internal("memory device lock poisoned".into()))?;
        let iface = interfaces.get_mut(name).ok_or_else(|| Error::Device {
            interface: name.to_string(),
            reason: "no such interface".into(),
        })?;
        Ok(f(iface))
    }
}

#[async_trait]
impl DeviceConfig for MemoryDevice {
    async fn create_interface(&self, name: &str) -> Result<()> {
        if self.failing_op.lock().map(|f| *f).unwrap_or(None) == Some("create_interface") {
            return Err(Error::Device {
                interface: name.to_string(),
                reason: "create_interface rejected".into(),
            });
        }
        let mut interfaces = self
            .interfaces
            .lock()
            .map_err(|_| Error::Internal("memory device lock poisoned".into()))?;
        if interfaces.contains_key(name) {
            return Err(Error::Device {
                interface: name.to_string(),
                reason: "interface exists".into(),
            });
        }
        let listen_port = BASE_LISTEN_PORT + interfaces.len() as u16;
        interfaces.insert(
            name.to_string(),
            MemoryInterface {
                listen_port,
                ..Default::default()
            },
        );
        tracing::info!("Created in-memory interface {} (listen port {})", name, listen_port);
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> Result<()> {
        let mut interfaces = self
            .interfaces
            .lock()
            .map_err(|_| Error::Internal("memory device lock poisoned".into()))?;
        if interfaces.remove(name).is_none() {
            return Err(Error::Device {
                interface: name.to_string(),
                reason: "no such interface".into(),
            });
        }
        Ok(())
    }

    async fn set_interface_address(&self, name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        self.with_interface("set_interface_address", name, |i| i.addresses.push((addr, prefix_len)))
    }

    async fn set_private_key(&self, name: &str, private_key: &str) -> Result<()> {
        self.with_interface("set_private_key", name, |i| {
            i.private_key = Some(private_key.to_string())
        })
    }

    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()> {
        self.with_interface("set_peer", name, |i| {
            i.peers.retain(|p| p.public_key != peer.public_key);
            i.peers.push(peer.clone());
        })
    }

    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()> {
        self.with_interface("remove_peer", name, |i| i.peers.retain(|p| p.public_key != public_key))
    }

    async fn bring_up(&self, name: &str) -> Result<()> {
        self.with_interface("bring_up", name, |i| i.up = true)
    }

    async fn listen_port(&self, name: &str) -> Result<u16> {
        self.with_interface("listen_port", name, |i| i.listen_port)
    }
}
