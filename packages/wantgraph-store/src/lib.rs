//! wantgraph-store - snapshot persistence for want graphs
//!
//! Holds the persisted shape of a want graph and the `SnapshotStore` port the
//! engine saves to and restores from. The engine decides *when* to save and
//! how a loaded snapshot is merged with fresh configuration; this crate only
//! moves `GraphSnapshot`s in and out of a backend.
//!
//! ## Backends
//!
//! - `MemorySnapshotStore`: latest snapshot in process
//! - `FileSnapshotStore`: a single JSON file, replaced atomically
//! - `SqliteSnapshotStore`: snapshot history in SQLite (`sqlite` feature, on by default)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wantgraph_store::{FileSnapshotStore, GraphSnapshot, SnapshotStore};
//!
//! let store = FileSnapshotStore::new("/var/lib/wantgraph/graph.json")?;
//! store.save(&GraphSnapshot::new(records)).await?;
//! let latest = store.load().await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    GraphSnapshot, HistoryRecord, OwnerRecord, SnapshotStore, SubscriptionRecord, WantRecord,
    SNAPSHOT_FORMAT_VERSION,
};
pub use infrastructure::{FileSnapshotStore, MemorySnapshotStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteSnapshotStore;
