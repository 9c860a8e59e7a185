//! Label selectors and the label registry

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Set of `key=value` constraints; matches wants carrying all of them
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// An empty selector or a blank key/value is malformed
    pub fn validate(&self) -> Result<(), String> {
        if self.match_labels.is_empty() {
            return Err("selector has no labels".to_string());
        }
        for (k, v) in &self.match_labels {
            if k.trim().is_empty() {
                return Err(format!("selector has a blank key (value '{}')", v));
            }
            if v.trim().is_empty() {
                return Err(format!("selector key '{}' has a blank value", k));
            }
        }
        Ok(())
    }

    /// Canonical `k:v,k2:v2` form, stable across runs
    pub fn key(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.key())
    }
}

/// Every label key and value seen on any want of one engine
#[derive(Default)]
pub struct LabelRegistry {
    labels: DashMap<String, BTreeSet<String>>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.labels.entry(k.clone()).or_default().insert(v.clone());
        }
    }

    /// Sorted snapshot of key -> values
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.labels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.labels
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches_subset() {
        let sel = LabelSelector::from_pairs([("role", "source")]);
        assert!(sel.matches(&labels(&[("role", "source"), ("tier", "a")])));
        assert!(!sel.matches(&labels(&[("role", "sink")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn test_empty_selector_matches_nothing_and_is_malformed() {
        let sel = LabelSelector::new();
        assert!(!sel.matches(&labels(&[("role", "source")])));
        assert!(sel.validate().is_err());
        assert!(LabelSelector::new().with("role", " ").validate().is_err());
        assert!(LabelSelector::new().with("role", "x").validate().is_ok());
    }

    #[test]
    fn test_selector_key_is_sorted() {
        let sel = LabelSelector::new().with("z", "1").with("a", "2");
        assert_eq!(sel.key(), "a:2,z:1");
        assert_eq!(sel.to_string(), "{a:2,z:1}");
    }

    #[test]
    fn test_selector_yaml_shape() {
        let sel: LabelSelector = serde_yaml::from_str("role: source\n").unwrap();
        assert_eq!(sel, LabelSelector::from_pairs([("role", "source")]));
    }

    #[test]
    fn test_label_registry() {
        let registry = LabelRegistry::new();
        registry.record(&labels(&[("role", "source"), ("tier", "a")]));
        registry.record(&labels(&[("role", "sink")]));

        let snap = registry.snapshot();
        assert_eq!(snap["role"], vec!["sink".to_string(), "source".to_string()]);
        assert!(registry.contains("tier", "a"));
        assert!(!registry.contains("tier", "b"));
    }

    proptest! {
        #[test]
        fn prop_selector_matches_own_labels(
            pairs in proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{1,4}", 1..6)
        ) {
            let sel = LabelSelector { match_labels: pairs.clone() };
            prop_assert!(sel.matches(&pairs));
            prop_assert!(sel.validate().is_ok());
        }

        #[test]
        fn prop_selector_rejects_missing_key(
            pairs in proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{1,4}", 1..6)
        ) {
            let sel = LabelSelector { match_labels: pairs.clone() }.with("ZZ", "v");
            prop_assert!(!sel.matches(&pairs));
        }
    }
}
