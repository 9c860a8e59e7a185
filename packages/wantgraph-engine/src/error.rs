use thiserror::Error;
use wantgraph_store::StorageError;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Wiring error for want '{want}': {reason}")]
    Wiring { want: String, reason: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Execution fault in '{want}': {reason}")]
    ExecutionFault { want: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Want not found: {0}")]
    WantNotFound(String),

    #[error("Duplicate want name: {0}")]
    DuplicateName(String),

    #[error("Unknown want type: {0}")]
    UnknownType(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn fault(want: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFault {
            want: want.into(),
            reason: reason.into(),
        }
    }

    /// Classification used in diagnostics and history
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            EngineError::Wiring { .. } | EngineError::InvalidSelector(_) => FaultKind::Wiring,
            EngineError::Cycle(_) => FaultKind::Cycle,
            EngineError::Persistence(_) => FaultKind::Persistence,
            _ => FaultKind::Execution,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e)
    }
}

/// Fault classification surfaced through state inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Selector malformed or never matched; want stays pending
    Wiring,
    /// Mutual dependency; members are marked failed
    Cycle,
    /// Step function error or panic; want is marked failed
    Execution,
    /// Snapshot load/save failure; engine keeps running
    Persistence,
    /// Overlapping parameter updates; last writer wins
    ParameterConflict,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Wiring => "wiring",
            FaultKind::Cycle => "cycle",
            FaultKind::Execution => "execution",
            FaultKind::Persistence => "persistence",
            FaultKind::ParameterConflict => "parameter_conflict",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "wiring" => Ok(FaultKind::Wiring),
            "cycle" => Ok(FaultKind::Cycle),
            "execution" => Ok(FaultKind::Execution),
            "persistence" => Ok(FaultKind::Persistence),
            "parameter_conflict" => Ok(FaultKind::ParameterConflict),
            _ => Err(EngineError::parse(format!("Invalid fault kind: {}", s))),
        }
    }

    /// Structural faults are resolved locally into pending/failed status
    pub fn is_structural(&self) -> bool {
        matches!(self, FaultKind::Wiring | FaultKind::Cycle)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_roundtrip() {
        for kind in &[
            FaultKind::Wiring,
            FaultKind::Cycle,
            FaultKind::Execution,
            FaultKind::Persistence,
            FaultKind::ParameterConflict,
        ] {
            let parsed = FaultKind::from_str(kind.as_str()).unwrap();
            assert_eq!(*kind, parsed);
        }
    }

    #[test]
    fn test_fault_kind_invalid() {
        assert!(FaultKind::from_str("meltdown").is_err());
    }

    #[test]
    fn test_error_classification() {
        let cycle = EngineError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(cycle.fault_kind(), FaultKind::Cycle);
        assert_eq!(cycle.to_string(), "Dependency cycle: a -> b -> a");

        let wiring = EngineError::Wiring {
            want: "sink".into(),
            reason: "no want matches {role=source}".into(),
        };
        assert_eq!(wiring.fault_kind(), FaultKind::Wiring);
        assert!(wiring.fault_kind().is_structural());

        let persistence: EngineError = StorageError::snapshot_not_found("memory").into();
        assert_eq!(persistence.fault_kind(), FaultKind::Persistence);

        assert_eq!(
            EngineError::fault("sink", "boom").fault_kind(),
            FaultKind::Execution
        );
    }
}
