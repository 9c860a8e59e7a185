//! JSON file snapshot store
//!
//! Writes go to a sibling `*.tmp` file first and are renamed into place, so a
//! crash mid-write leaves the previous snapshot readable.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::domain::{GraphSnapshot, SnapshotStore};
use crate::{Result, StorageError};

pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(
            "Saved snapshot of {} wants to {}",
            snapshot.wants.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<GraphSnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::snapshot_not_found(
                    self.path.display().to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: GraphSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.ensure_supported()?;
        Ok(snapshot)
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HistoryRecord, WantRecord};
    use crate::ErrorKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> GraphSnapshot {
        let mut w = WantRecord::new("7f1c", "flight", "flight", "achieved");
        w.state.insert("flight_status".to_string(), json!("delayed"));
        w.history.push(HistoryRecord {
            version: 1,
            timestamp: chrono::Utc::now(),
            kind: "state".to_string(),
            key: "flight_status".to_string(),
            value: json!("delayed"),
            previous: Some(json!("confirmed")),
        });
        GraphSnapshot::new(vec![w])
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("state/wants.json")).unwrap();

        let snapshot = sample();
        store.save(&snapshot).await.unwrap();
        assert!(!store.tmp_path().exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("none.json")).unwrap();
        assert!(store.load().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wants.json");
        std::fs::write(&path, b"{ truncated").unwrap();

        let store = FileSnapshotStore::new(&path).unwrap();
        let err = store.load().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }
}
