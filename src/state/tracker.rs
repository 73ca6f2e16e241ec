//! Tunnel Tracker
//!
//! Persistent storage for negotiated tunnels so that conflict checks and
//! interface reuse survive a restart.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::TunnelStore;
use crate::error::{Error, Result};
use crate::protocol::Family;
use crate::tunnel::{EndpointType, TunnelRecord, TunnelState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tunnels (
    id TEXT PRIMARY KEY,
    remote_id INTEGER NOT NULL,
    family TEXT NOT NULL,
    local_endpoint_type TEXT NOT NULL,
    remote_endpoint_type TEXT NOT NULL,
    local_phys_addr TEXT NOT NULL,
    local_phys_listen_port INTEGER NOT NULL,
    local_phys_com_port INTEGER NOT NULL,
    remote_phys_addr TEXT NOT NULL,
    remote_phys_listen_port INTEGER NOT NULL,
    remote_phys_com_port INTEGER NOT NULL,
    tunnel_network TEXT NOT NULL,
    local_tunnel_addr TEXT NOT NULL,
    local_tunnel_com_port INTEGER NOT NULL,
    remote_tunnel_addr TEXT NOT NULL,
    remote_tunnel_com_port INTEGER NOT NULL,
    local_interface_name TEXT NOT NULL,
    remote_interface_name TEXT NOT NULL,
    local_public_key TEXT NOT NULL,
    local_private_key TEXT NOT NULL,
    remote_public_key TEXT NOT NULL,
    keepalive INTEGER NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tunnels_remote_phys
    ON tunnels(remote_phys_addr);
"#;

const UPSERT: &str = r#"
INSERT INTO tunnels (
    id, remote_id, family, local_endpoint_type, remote_endpoint_type,
    local_phys_addr, local_phys_listen_port, local_phys_com_port,
    remote_phys_addr, remote_phys_listen_port, remote_phys_com_port,
    tunnel_network, local_tunnel_addr, local_tunnel_com_port,
    remote_tunnel_addr, remote_tunnel_com_port,
    local_interface_name, remote_interface_name,
    local_public_key, local_private_key, remote_public_key,
    keepalive, state, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
          ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
ON CONFLICT(id) DO UPDATE SET
    remote_id = ?2,
    local_phys_listen_port = ?7,
    remote_phys_listen_port = ?10,
    remote_phys_com_port = ?11,
    tunnel_network = ?12,
    local_tunnel_addr = ?13,
    remote_tunnel_addr = ?15,
    remote_tunnel_com_port = ?16,
    remote_interface_name = ?18,
    remote_public_key = ?21,
    keepalive = ?22,
    state = ?23,
    updated_at = ?24
"#;

/// SQLite backed tunnel store
pub struct TunnelTracker {
    conn: Mutex<Connection>,
}

impl TunnelTracker {
    /// Create or open `tunnels.db` under `data_dir`
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("tunnels.db"))?;
        Self::with_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn upsert(&self, t: &TunnelRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            UPSERT,
            params![
                t.id.to_string(),
                t.remote_id,
                family_label(t.family),
                t.local_endpoint_type.label(),
                t.remote_endpoint_type.label(),
                t.local_phys_addr.to_string(),
                t.local_phys_listen_port,
                t.local_phys_com_port,
                t.remote_phys_addr.to_string(),
                t.remote_phys_listen_port,
                t.remote_phys_com_port,
                t.tunnel_network.to_string(),
                t.local_tunnel_addr.to_string(),
                t.local_tunnel_com_port,
                t.remote_tunnel_addr.to_string(),
                t.remote_tunnel_com_port,
                t.local_interface_name,
                t.remote_interface_name,
                t.local_public_key,
                t.local_private_key,
                t.remote_public_key,
                t.keepalive,
                t.state.label(),
                t.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TunnelStore for TunnelTracker {
    async fn insert(&self, record: &TunnelRecord) -> Result<()> {
        self.upsert(record).await
    }

    async fn update(&self, record: &TunnelRecord) -> Result<()> {
        self.upsert(record).await
    }

    async fn remove(&self, id: &Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM tunnels WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<TunnelRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM tunnels ORDER BY updated_at")?;
        let rows = stmt.query_map([], |row| Ok(read_row(row)))?;

        let mut records = Vec::new();
        for row in rows {
            match row? {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable tunnel row: {}", e),
            }
        }
        Ok(records)
    }
}

fn family_label(family: Family) -> &'static str {
    match family {
        Family::V4 => "v4",
        Family::V6 => "v6",
    }
}

fn parse_column<T: std::str::FromStr>(row: &Row<'_>, column: &str) -> Result<T> {
    let text: String = row.get(column)?;
    text.parse::<T>()
        .map_err(|_| Error::Store(format!("invalid {} value: {}", column, text)))
}

fn read_row(row: &Row<'_>) -> Result<TunnelRecord> {
    let family = match row.get::<_, String>("family")?.as_str() {
        "v4" => Family::V4,
        "v6" => Family::V6,
        other => return Err(Error::Store(format!("invalid family: {}", other))),
    };
    let endpoint = |column: &str| -> Result<EndpointType> {
        let label: String = row.get(column)?;
        EndpointType::from_label(&label)
            .ok_or_else(|| Error::Store(format!("invalid {}: {}", column, label)))
    };
    let state_label: String = row.get("state")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(TunnelRecord {
        id: parse_column::<Uuid>(row, "id")?,
        remote_id: row.get("remote_id")?,
        family,
        local_endpoint_type: endpoint("local_endpoint_type")?,
        remote_endpoint_type: endpoint("remote_endpoint_type")?,
        local_phys_addr: parse_column(row, "local_phys_addr")?,
        local_phys_listen_port: row.get("local_phys_listen_port")?,
        local_phys_com_port: row.get("local_phys_com_port")?,
        remote_phys_addr: parse_column(row, "remote_phys_addr")?,
        remote_phys_listen_port: row.get("remote_phys_listen_port")?,
        remote_phys_com_port: row.get("remote_phys_com_port")?,
        tunnel_network: parse_column(row, "tunnel_network")?,
        local_tunnel_addr: parse_column(row, "local_tunnel_addr")?,
        local_tunnel_com_port: row.get("local_tunnel_com_port")?,
        remote_tunnel_addr: parse_column(row, "remote_tunnel_addr")?,
        remote_tunnel_com_port: row.get("remote_tunnel_com_port")?,
        local_interface_name: row.get("local_interface_name")?,
        remote_interface_name: row.get("remote_interface_name")?,
        local_public_key: row.get("local_public_key")?,
        local_private_key: row.get("local_private_key")?,
        remote_public_key: row.get("remote_public_key")?,
        keepalive: row.get("keepalive")?,
        state: TunnelState::from_label(&state_label)
            .ok_or_else(|| Error::Store(format!("invalid state: {}", state_label)))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Store(format!("invalid updated_at {}: {}", updated_at, e)))?
            .with_timezone(&Utc),
    })
}
