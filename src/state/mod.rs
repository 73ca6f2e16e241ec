//! State Module
//!
//! In-memory tunnel registry and persistent tunnel storage.

pub mod registry;
pub mod tracker;

pub use registry::TunnelRegistry;
pub use tracker::TunnelTracker;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::tunnel::TunnelRecord;

/// Persistence collaborator for tunnel records
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn insert(&self, record: &TunnelRecord) -> Result<()>;

    async fn update(&self, record: &TunnelRecord) -> Result<()>;

    async fn remove(&self, id: &Uuid) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<TunnelRecord>>;
}
