use crate::error::{EngineError, Result};
use crate::selector::LabelSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Want status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WantStatus {
    Idle,
    Running,
    Achieved,
    Failed,
}

impl WantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WantStatus::Idle => "idle",
            WantStatus::Running => "running",
            WantStatus::Achieved => "achieved",
            WantStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(WantStatus::Idle),
            "running" => Ok(WantStatus::Running),
            "achieved" => Ok(WantStatus::Achieved),
            "failed" => Ok(WantStatus::Failed),
            _ => Err(EngineError::parse(format!("Invalid want status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WantStatus::Achieved | WantStatus::Failed)
    }
}

impl std::fmt::Display for WantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a history entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    State,
    Parameter,
    ParameterConflict,
    Status,
    Restart,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::State => "state",
            HistoryKind::Parameter => "parameter",
            HistoryKind::ParameterConflict => "parameter_conflict",
            HistoryKind::Status => "status",
            HistoryKind::Restart => "restart",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "state" => Ok(HistoryKind::State),
            "parameter" => Ok(HistoryKind::Parameter),
            "parameter_conflict" => Ok(HistoryKind::ParameterConflict),
            "status" => Ok(HistoryKind::Status),
            "restart" => Ok(HistoryKind::Restart),
            _ => Err(EngineError::parse(format!("Invalid history kind: {}", s))),
        }
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One versioned history entry; versions increase by one per want
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: HistoryKind,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Parent of a want, referenced by name (id filled in once known)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub want_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_refs: Vec<OwnerReference>,
}

/// Interest in another want's state keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub target: String,
    /// Empty means every key
    #[serde(default)]
    pub keys: Vec<String>,
    /// Re-open this want when it is achieved and a matching key changes
    #[serde(default)]
    pub retrigger: bool,
}

/// Scheduling hint consumed by the companion scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhenHint {
    pub every: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WantSpec {
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub using: Vec<LabelSelector>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
    #[serde(default)]
    pub when: Vec<WhenHint>,
}

/// A desired-state unit of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Want {
    pub metadata: Metadata,
    pub spec: WantSpec,
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
    pub status: WantStatus,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Incremented on every Idle -> Running transition
    #[serde(default)]
    pub run_generation: u64,
    #[serde(default)]
    pub suspended: bool,
}

impl Want {
    pub fn new(name: impl Into<String>, want_type: impl Into<String>) -> Self {
        Self {
            metadata: Metadata {
                id: Uuid::new_v4(),
                name: name.into(),
                want_type: want_type.into(),
                labels: BTreeMap::new(),
                owner_refs: Vec::new(),
            },
            spec: WantSpec::default(),
            state: BTreeMap::new(),
            status: WantStatus::Idle,
            history: Vec::new(),
            run_generation: 0,
            suspended: false,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.params.insert(key.into(), value.into());
        self
    }

    pub fn using(mut self, selector: LabelSelector) -> Self {
        self.spec.using.push(selector);
        self
    }

    pub fn owned_by(mut self, parent: impl Into<String>) -> Self {
        self.metadata.owner_refs.push(OwnerReference {
            name: parent.into(),
            id: None,
        });
        self
    }

    pub fn subscribe(
        mut self,
        target: impl Into<String>,
        keys: &[&str],
        retrigger: bool,
    ) -> Self {
        self.spec.subscriptions.push(SubscriptionSpec {
            target: target.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            retrigger,
        });
        self
    }

    pub fn every(mut self, interval: impl Into<String>) -> Self {
        self.spec.when.push(WhenHint {
            every: interval.into(),
        });
        self
    }

    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn want_type(&self) -> &str {
        &self.metadata.want_type
    }

    pub fn is_owned_by(&self, parent: &str) -> bool {
        self.metadata.owner_refs.iter().any(|r| r.name == parent)
    }

    pub fn is_source(&self) -> bool {
        self.spec.using.is_empty()
    }

    pub fn next_history_version(&self) -> u64 {
        self.history.last().map(|h| h.version + 1).unwrap_or(1)
    }

    /// Append a history entry, dropping the oldest beyond `limit`
    pub fn record(
        &mut self,
        kind: HistoryKind,
        key: impl Into<String>,
        value: Value,
        previous: Option<Value>,
        limit: usize,
    ) -> u64 {
        let version = self.next_history_version();
        self.history.push(HistoryEntry {
            version,
            timestamp: Utc::now(),
            kind,
            key: key.into(),
            value,
            previous,
        });
        let limit = limit.max(1);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
        version
    }

    pub fn history_of(&self, kind: HistoryKind) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(move |h| h.kind == kind)
    }

    /// Status values in the order they were recorded
    pub fn status_trail(&self) -> Vec<WantStatus> {
        self.history_of(HistoryKind::Status)
            .filter_map(|h| h.value.get("status").and_then(|s| s.as_str()))
            .filter_map(|s| WantStatus::from_str(s).ok())
            .collect()
    }
}
