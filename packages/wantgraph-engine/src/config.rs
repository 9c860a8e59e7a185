//! Engine configuration and want definitions
//!
//! Definitions are read from versioned YAML:
//!
//! ```yaml
//! version: 1
//! engine:
//!   reconcile_interval_ms: 100
//! wants:
//!   - name: source
//!     type: numbers
//!     labels: { role: source }
//!     params: { count: 5 }
//!   - name: sink
//!     type: collector
//!     using:
//!       - role: source
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::selector::LabelSelector;
use crate::want::{OwnerReference, SubscriptionSpec, Want, WhenHint};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing 'version' field in want configuration. Add 'version: 1' to the top of the file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Tuning knobs of one engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub reconcile_interval_ms: u64,
    /// Period of the background snapshot task (0 disables it)
    pub snapshot_interval_ms: u64,
    pub queue_capacity: usize,
    pub notification_history: usize,
    pub state_history_limit: usize,
    /// Notifications kept per want for its step function to inspect
    pub inbox_limit: usize,
    /// Drop snapshot wants that are absent from fresh configuration
    pub prune_on_restore: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 100,
            snapshot_interval_ms: 1000,
            queue_capacity: 10,
            notification_history: 1000,
            state_history_limit: 500,
            inbox_limit: 64,
            prune_on_restore: false,
        }
    }
}

impl EngineConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn snapshot_interval(&self) -> Option<Duration> {
        if self.snapshot_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.snapshot_interval_ms))
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.state_history_limit == 0 {
            return Err(ConfigError::Invalid(
                "state_history_limit must be at least 1".to_string(),
            ));
        }
        if self.notification_history == 0 {
            return Err(ConfigError::Invalid(
                "notification_history must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A want as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WantDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub want_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Names of owning wants
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub using: Vec<LabelSelector>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
    #[serde(default)]
    pub when: Vec<WhenHint>,
}

impl WantDefinition {
    pub fn into_want(self) -> Want {
        let mut want = Want::new(self.name, self.want_type);
        want.metadata.labels = self.labels;
        want.metadata.owner_refs = self
            .owners
            .into_iter()
            .map(|name| OwnerReference { name, id: None })
            .collect();
        want.spec.params = self.params;
        want.spec.using = self.using;
        want.spec.subscriptions = self.subscriptions;
        want.spec.when = self.when;
        want
    }
}

/// Versioned configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WantsConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub wants: Vec<WantDefinition>,
}

impl WantsConfig {
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: WantsConfig = serde_yaml::from_str(content)?;
        match config.version {
            None => return Err(ConfigError::MissingVersion),
            Some(found) if !SUPPORTED_VERSIONS.contains(&found) => {
                return Err(ConfigError::UnsupportedVersion {
                    found,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }
        config.engine.validate()?;

        let mut names = std::collections::BTreeSet::new();
        for def in &config.wants {
            if !names.insert(def.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "want '{}' is defined twice",
                    def.name
                )));
            }
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn into_wants(self) -> Vec<Want> {
        self.wants.into_iter().map(WantDefinition::into_want).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TRAVEL: &str = r#"
version: 1
engine:
  reconcile_interval_ms: 50
wants:
  - name: flight
    type: flight
    labels: { role: booking }
    params: { status: confirmed }
  - name: coordinator
    type: coordinator
    owners: [trip]
    using:
      - role: booking
    subscriptions:
      - target: flight
        keys: [flight_status]
        retrigger: true
    when:
      - every: 30s
  - name: trip
    type: owner
"#;

    #[test]
    fn test_yaml_loading() {
        let config = WantsConfig::from_yaml_str(TRAVEL).unwrap();
        assert_eq!(config.engine.reconcile_interval_ms, 50);
        assert_eq!(config.engine.queue_capacity, 10);

        let wants = config.into_wants();
        assert_eq!(wants.len(), 3);
        let coordinator = &wants[1];
        assert!(coordinator.is_owned_by("trip"));
        assert_eq!(
            coordinator.spec.using[0],
            LabelSelector::from_pairs([("role", "booking")])
        );
        assert!(coordinator.spec.subscriptions[0].retrigger);
        assert_eq!(coordinator.spec.when[0].every, "30s");
        assert_eq!(wants[0].spec.params["status"], json!("confirmed"));
    }

    #[test]
    fn test_yaml_missing_version() {
        let err = WantsConfig::from_yaml_str("wants: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVersion));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = WantsConfig::from_yaml_str("version: 9\n").unwrap_err();
        match err {
            ConfigError::UnsupportedVersion { found, supported } => {
                assert_eq!(found, 9);
                assert_eq!(supported, vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_yaml_rejects_unknown_fields_and_duplicates() {
        assert!(WantsConfig::from_yaml_str("version: 1\nbogus: true\n").is_err());

        let dup = "version: 1\nwants:\n  - {name: a, type: t}\n  - {name: a, type: t}\n";
        assert!(matches!(
            WantsConfig::from_yaml_str(dup),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_engine_config_validation() {
        let bad = "version: 1\nengine:\n  queue_capacity: 0\n";
        assert!(WantsConfig::from_yaml_str(bad).is_err());
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig {
            snapshot_interval_ms: 0,
            ..EngineConfig::default()
        }
        .snapshot_interval()
        .is_none());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TRAVEL.as_bytes()).unwrap();

        let config = WantsConfig::from_yaml_file(file.path()).unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        let again = WantsConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(again, config);
    }
}
