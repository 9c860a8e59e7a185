//! Snapshot store errors
//!
//! Every adapter reports the same [`StorageError`]: a coarse [`ErrorKind`]
//! the engine can branch on, a message, and the backend error behind it.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQLite backend failure
    Database,
    /// A snapshot document or row that does not decode
    Serialization,
    /// Nothing saved yet; callers start from configuration
    SnapshotNotFound,
    UnsupportedFormat,
    /// The engine has no store attached
    Config,
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::SnapshotNotFound => "snapshot_not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    fn caused_by(
        kind: ErrorKind,
        what: &str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: format!("{}: {}", what, err),
            source: Some(Box::new(err)),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// `location` names the backend or path that had nothing to load
    pub fn snapshot_not_found(location: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SnapshotNotFound,
            format!("no snapshot saved in {}", location.into()),
        )
    }

    pub fn unsupported_format(found: u32, supported: u32) -> Self {
        Self::new(
            ErrorKind::UnsupportedFormat,
            format!(
                "snapshot format version {} cannot be read (supported: {})",
                found, supported
            ),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// True when the store is simply empty, as on a first start
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::SnapshotNotFound
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::caused_by(ErrorKind::Database, "SQLite error", err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::caused_by(ErrorKind::Serialization, "snapshot JSON error", err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::caused_by(ErrorKind::IO, "snapshot I/O error", err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_not_found_names_location() {
        let err = StorageError::snapshot_not_found("/var/lib/wants.json");
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "[snapshot_not_found] no snapshot saved in /var/lib/wants.json"
        );
        assert!(!StorageError::unsupported_format(7, 1).is_not_found());
    }

    #[test]
    fn test_backend_errors_keep_their_source() {
        let io: StorageError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume").into();
        assert_eq!(io.kind, ErrorKind::IO);
        assert!(io.source().unwrap().to_string().contains("read-only volume"));

        let json: StorageError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(json.kind, ErrorKind::Serialization);
        assert!(json.message.starts_with("snapshot JSON error"));
        assert!(json.source.is_some());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_error_is_database_kind() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.starts_with("SQLite error"));
    }
}
