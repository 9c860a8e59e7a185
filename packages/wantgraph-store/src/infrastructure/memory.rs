//! In-memory snapshot store
//!
//! Keeps only the latest snapshot. Used by tests and by engines that want
//! restart-in-process recovery without touching disk.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{GraphSnapshot, SnapshotStore};
use crate::{Result, StorageError};

#[derive(Default)]
pub struct MemorySnapshotStore {
    latest: RwLock<Option<GraphSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        *self.latest.write().await = None;
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &GraphSnapshot) -> Result<()> {
        *self.latest.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<GraphSnapshot> {
        self.latest
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::snapshot_not_found("memory"))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
