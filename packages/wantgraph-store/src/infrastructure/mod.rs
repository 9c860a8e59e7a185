//! Infrastructure layer - Snapshot store adapters
//!
//! - memory: latest snapshot kept in process
//! - file: JSON document, atomic replace
//! - sqlite: snapshot history in SQLite (default feature)

pub mod file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSnapshotStore;
