//! Domain layer for the snapshot store
//!
//! # Domain Models
//!
//! - `GraphSnapshot`: the full want graph at one point in time
//! - `WantRecord`: one want with its spec, state, status and history
//! - `HistoryRecord`: one versioned history entry
//!
//! # Port Trait
//!
//! - `SnapshotStore`: save/load of the latest snapshot
//!
//! Records are plain data. Statuses and history kinds are kept as their
//! string tags so the store never depends on the engine's enums.
//!
//! # Examples
//!
//! ```rust,ignore
//! use wantgraph_store::{GraphSnapshot, SnapshotStore};
//!
//! async fn example(store: impl SnapshotStore) -> wantgraph_store::Result<()> {
//!     let snapshot = GraphSnapshot::new(records);
//!     store.save(&snapshot).await?;
//!
//!     let restored = store.load().await?;
//!     assert_eq!(restored.checksum(), snapshot.checksum());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::Result;

/// Snapshot format written by this crate
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// One versioned entry of a want's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// `state`, `parameter`, `parameter_conflict`, `status` or `restart`
    pub kind: String,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Parent reference of a want
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Persisted subscription of a want to another want's state keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub target: String,
    /// Empty means every key
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub retrigger: bool,
}

/// A want as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WantRecord {
    pub id: String,
    pub name: String,
    pub want_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_refs: Vec<OwnerRecord>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Label selectors, one map of required labels per selector
    #[serde(default)]
    pub using: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,
    /// Periodic restart intervals, e.g. `"30s"`
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
    pub status: String,
    #[serde(default)]
    pub run_generation: u64,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

impl WantRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        want_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            want_type: want_type.into(),
            labels: BTreeMap::new(),
            owner_refs: Vec::new(),
            params: BTreeMap::new(),
            using: Vec::new(),
            subscriptions: Vec::new(),
            when: Vec::new(),
            state: BTreeMap::new(),
            status: status.into(),
            run_generation: 0,
            suspended: false,
            history: Vec::new(),
        }
    }
}

/// The whole want graph at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub wants: Vec<WantRecord>,
}

impl GraphSnapshot {
    pub fn new(wants: Vec<WantRecord>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            wants,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wants.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&WantRecord> {
        self.wants.iter().find(|w| w.name == name)
    }

    /// SHA-256 over the wants only, so two snapshots of an unchanged graph
    /// taken at different times hash the same.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.format_version.to_le_bytes());
        for want in &self.wants {
            // Records are plain maps and strings; serialization cannot fail.
            if let Ok(bytes) = serde_json::to_vec(want) {
                hasher.update(&bytes);
            }
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Reject snapshots written by a newer format
    pub fn ensure_supported(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(crate::StorageError::unsupported_format(
                self.format_version,
                SNAPSHOT_FORMAT_VERSION,
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Persistence port for want graph snapshots
///
/// `load` returns the most recently saved snapshot, or a
/// `snapshot_not_found` error when nothing was saved yet.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &GraphSnapshot) -> Result<()>;

    async fn load(&self) -> Result<GraphSnapshot>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}
