//! Tunnel Registry
//!
//! The in-memory collection of tunnel records shared by every session of an
//! engine. Every lookup and mutation happens under one lock so that
//! lookup-before-create is atomic.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::device::Interface;
use crate::protocol::Family;
use crate::tunnel::{TunnelNetwork, TunnelRecord};

/// Shared set of tunnel records keyed by tunnel id
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<Uuid, TunnelRecord>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless one already exists for the same id or the
    /// same (local tunnel address, remote tunnel address) pair.
    ///
    /// Returns the conflicting record on failure.
    pub async fn try_insert(&self, record: TunnelRecord) -> Result<(), Box<TunnelRecord>> {
        let mut tunnels = self.tunnels.write().await;
        if let Some(existing) = tunnels.values().find(|t| {
            t.id == record.id
                || (t.local_tunnel_addr == record.local_tunnel_addr
                    && t.remote_tunnel_addr == record.remote_tunnel_addr)
        }) {
            return Err(Box::new(existing.clone()));
        }
        tracing::debug!("Registered tunnel {} on {}", record.id, record.local_interface_name);
        tunnels.insert(record.id, record);
        Ok(())
    }

    /// Load previously persisted records, skipping duplicates
    pub async fn restore(&self, records: Vec<TunnelRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            let id = record.id;
            match self.try_insert(record).await {
                Ok(()) => restored += 1,
                Err(existing) => tracing::warn!(
                    "Not restoring tunnel {}: conflicts with tunnel {}",
                    id,
                    existing.id
                ),
            }
        }
        restored
    }

    pub async fn get(&self, id: &Uuid) -> Option<TunnelRecord> {
        self.tunnels.read().await.get(id).cloned()
    }

    /// Apply `f` to a record and return the updated copy
    pub async fn update<F>(&self, id: &Uuid, f: F) -> Option<TunnelRecord>
    where
        F: FnOnce(&mut TunnelRecord),
    {
        let mut tunnels = self.tunnels.write().await;
        let record = tunnels.get_mut(id)?;
        f(record);
        record.touch();
        Some(record.clone())
    }

    pub async fn remove(&self, id: &Uuid) -> Option<TunnelRecord> {
        self.tunnels.write().await.remove(id)
    }

    /// Tunnel to a peer identified by its physical and tunnel address
    pub async fn find_by_remote_phys_and_tunnel(
        &self,
        remote_phys: IpAddr,
        remote_tunnel: IpAddr,
    ) -> Option<TunnelRecord> {
        self.find(|t| t.remote_phys_addr == remote_phys && t.remote_tunnel_addr == remote_tunnel)
            .await
    }

    /// Tunnel whose peer uses `key`
    pub async fn find_by_remote_public_key(&self, key: &str) -> Option<TunnelRecord> {
        if key.trim().is_empty() {
            return None;
        }
        self.find(|t| t.remote_public_key == key).await
    }

    /// Tunnel between two physical addresses
    pub async fn find_by_phys_pair(&self, local_phys: IpAddr, remote_phys: IpAddr) -> Option<TunnelRecord> {
        self.find(|t| t.local_phys_addr == local_phys && t.remote_phys_addr == remote_phys)
            .await
    }

    async fn find<P>(&self, predicate: P) -> Option<TunnelRecord>
    where
        P: Fn(&TunnelRecord) -> bool,
    {
        self.tunnels.read().await.values().find(|t| predicate(t)).cloned()
    }

    /// Existing interface serving `network` from `local_phys`
    pub async fn find_interface(&self, local_phys: IpAddr, network: &TunnelNetwork) -> Option<Interface> {
        self.find(|t| t.local_phys_addr == local_phys && t.tunnel_network == *network)
            .await
            .map(|t| Interface {
                name: t.local_interface_name,
                public_key: t.local_public_key,
                private_key: t.local_private_key,
                listen_port: t.local_phys_listen_port,
            })
    }

    /// Interface names in use for a family
    pub async fn interface_names(&self, family: Family) -> HashSet<String> {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|t| t.family == family)
            .map(|t| t.local_interface_name.clone())
            .collect()
    }

    /// Every tunnel address (local and remote) already handed out
    pub async fn tunnel_addresses(&self, family: Family) -> HashSet<IpAddr> {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|t| t.family == family)
            .flat_map(|t| [t.local_tunnel_addr, t.remote_tunnel_addr])
            .collect()
    }

    /// Records of a family, oldest update first
    pub async fn list(&self, family: Option<Family>) -> Vec<TunnelRecord> {
        let mut records: Vec<TunnelRecord> = self
            .tunnels
            .read()
            .await
            .values()
            .filter(|t| family.map_or(true, |f| t.family == f))
            .cloned()
            .collect();
        records.sort_by_key(|t| t.updated_at);
        records
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}
