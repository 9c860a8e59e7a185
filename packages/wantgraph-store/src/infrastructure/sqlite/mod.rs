//! SQLite snapshot store
//!
//! Every save inserts a new snapshot row plus one row per want inside a
//! single transaction. Only the newest `retain` snapshots are kept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{GraphSnapshot, SnapshotStore, WantRecord};
use crate::{Result, StorageError};

const DEFAULT_RETAIN: usize = 10;

/// SQLite-based SnapshotStore implementation
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
    retain: usize,
}

impl SqliteSnapshotStore {
    /// Create a new SQLite store at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            retain: DEFAULT_RETAIN,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Number of snapshots kept after each save (minimum 1)
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::database("SQLite connection mutex poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
                format_version INTEGER NOT NULL,
                saved_at TEXT NOT NULL,
                checksum TEXT NOT NULL,
                want_count INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshot_wants (
                snapshot_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                want_type TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (snapshot_id, position),
                FOREIGN KEY (snapshot_id) REFERENCES snapshots(snapshot_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshot_wants_name
             ON snapshot_wants(snapshot_id, name)",
            [],
        )?;

        Ok(())
    }

    /// Number of snapshots currently stored
    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn save_sync(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO snapshots (format_version, saved_at, checksum, want_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.format_version,
                snapshot.saved_at,
                snapshot.checksum(),
                snapshot.wants.len() as i64,
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_wants (snapshot_id, position, name, want_type, status, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, want) in snapshot.wants.iter().enumerate() {
                let record = serde_json::to_string(want)?;
                stmt.execute(params![
                    snapshot_id,
                    position as i64,
                    want.name,
                    want.want_type,
                    want.status,
                    record,
                ])?;
            }
        }

        // Retention: drop everything older than the newest `retain` snapshots
        tx.execute(
            "DELETE FROM snapshot_wants WHERE snapshot_id NOT IN (
                SELECT snapshot_id FROM snapshots ORDER BY snapshot_id DESC LIMIT ?1
            )",
            params![self.retain as i64],
        )?;
        tx.execute(
            "DELETE FROM snapshots WHERE snapshot_id NOT IN (
                SELECT snapshot_id FROM snapshots ORDER BY snapshot_id DESC LIMIT ?1
            )",
            params![self.retain as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_sync(&self) -> Result<GraphSnapshot> {
        let conn = self.lock()?;

        let header: Option<(i64, u32, DateTime<Utc>)> = conn
            .query_row(
                "SELECT snapshot_id, format_version, saved_at
                 FROM snapshots ORDER BY snapshot_id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (snapshot_id, format_version, saved_at) =
            header.ok_or_else(|| StorageError::snapshot_not_found("sqlite"))?;

        let mut stmt = conn.prepare(
            "SELECT record FROM snapshot_wants
             WHERE snapshot_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| row.get::<_, String>(0))?;

        let mut wants = Vec::new();
        for row in rows {
            let record: WantRecord = serde_json::from_str(&row?)?;
            wants.push(record);
        }

        let snapshot = GraphSnapshot {
            format_version,
            saved_at,
            wants,
        };
        snapshot.ensure_supported()?;
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &GraphSnapshot) -> Result<()> {
        self.save_sync(snapshot)
    }

    async fn load(&self) -> Result<GraphSnapshot> {
        self.load_sync()
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HistoryRecord, OwnerRecord, SubscriptionRecord};
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshot_with(names: &[&str]) -> GraphSnapshot {
        let wants = names
            .iter()
            .map(|name| {
                let mut w = WantRecord::new(format!("id-{}", name), *name, "owner", "achieved");
                w.owner_refs.push(OwnerRecord {
                    name: "root".to_string(),
                    id: None,
                });
                w.params.insert("count".to_string(), json!(2));
                w.subscriptions.push(SubscriptionRecord {
                    target: "flight".to_string(),
                    keys: vec!["flight_status".to_string()],
                    retrigger: true,
                });
                w.history.push(HistoryRecord {
                    version: 1,
                    timestamp: Utc::now(),
                    kind: "parameter".to_string(),
                    key: "count".to_string(),
                    value: json!(2),
                    previous: Some(json!(1)),
                });
                w
            })
            .collect();
        GraphSnapshot::new(wants)
    }

    #[tokio::test]
    async fn test_empty_store_is_not_found() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        assert!(store.load().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_order_and_content() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let snapshot = snapshot_with(&["c", "a", "b"]);
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.wants, snapshot.wants);
        assert_eq!(loaded.checksum(), snapshot.checksum());
    }

    #[tokio::test]
    async fn test_load_returns_latest() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        store.save(&snapshot_with(&["old"])).await.unwrap();
        store.save(&snapshot_with(&["new1", "new2"])).await.unwrap();

        let loaded = store.load().await.unwrap();
        let names: Vec<_> = loaded.wants.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["new1", "new2"]);
    }

    #[tokio::test]
    async fn test_retention_limits_history() {
        let store = SqliteSnapshotStore::new_in_memory()
            .unwrap()
            .with_retention(2);
        for i in 0..5 {
            let name = format!("w{}", i);
            store.save(&snapshot_with(&[name.as_str()])).await.unwrap();
        }
        assert_eq!(store.snapshot_count().unwrap(), 2);
        assert_eq!(store.load().await.unwrap().wants[0].name, "w4");
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wants.db");
        {
            let store = SqliteSnapshotStore::new(&path).unwrap();
            store.save(&snapshot_with(&["persisted"])).await.unwrap();
        }
        let reopened = SqliteSnapshotStore::new(&path).unwrap();
        assert_eq!(reopened.load().await.unwrap().wants[0].name, "persisted");
    }
}
