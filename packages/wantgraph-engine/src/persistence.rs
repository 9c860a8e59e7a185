//! Snapshot conversion and restore merge
//!
//! On restore, fresh configuration is authoritative for *what* a want is
//! (type, labels, owners, params, selectors, subscriptions). The snapshot is
//! authoritative for *where* it got to (state, status, history, generation,
//! suspension). A want caught mid-run is brought back as idle so it runs
//! again.

use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;
use wantgraph_store::{
    GraphSnapshot, HistoryRecord, OwnerRecord, SubscriptionRecord, WantRecord,
};

use crate::error::{EngineError, Result};
use crate::lifecycle::WantStateMachine;
use crate::selector::LabelSelector;
use crate::want::{
    HistoryEntry, HistoryKind, Metadata, OwnerReference, SubscriptionSpec, Want, WantSpec,
    WantStatus, WhenHint,
};

pub fn to_record(want: &Want) -> WantRecord {
    let mut record = WantRecord::new(
        want.id().to_string(),
        want.name(),
        want.want_type(),
        want.status.as_str(),
    );
    record.labels = want.metadata.labels.clone();
    record.owner_refs = want
        .metadata
        .owner_refs
        .iter()
        .map(|r| OwnerRecord {
            name: r.name.clone(),
            id: r.id.map(|id| id.to_string()),
        })
        .collect();
    record.params = want.spec.params.clone();
    record.using = want
        .spec
        .using
        .iter()
        .map(|s| s.match_labels.clone())
        .collect();
    record.subscriptions = want
        .spec
        .subscriptions
        .iter()
        .map(|s| SubscriptionRecord {
            target: s.target.clone(),
            keys: s.keys.clone(),
            retrigger: s.retrigger,
        })
        .collect();
    record.when = want.spec.when.iter().map(|w| w.every.clone()).collect();
    record.state = want.state.clone();
    record.run_generation = want.run_generation;
    record.suspended = want.suspended;
    record.history = want
        .history
        .iter()
        .map(|h| HistoryRecord {
            version: h.version,
            timestamp: h.timestamp,
            kind: h.kind.as_str().to_string(),
            key: h.key.clone(),
            value: h.value.clone(),
            previous: h.previous.clone(),
        })
        .collect();
    record
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::parse(format!("Invalid want id '{}': {}", raw, e)))
}

pub fn from_record(record: WantRecord) -> Result<Want> {
    let owner_refs = record
        .owner_refs
        .into_iter()
        .map(|r| {
            Ok(OwnerReference {
                name: r.name,
                id: r.id.as_deref().map(parse_id).transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let history = record
        .history
        .into_iter()
        .map(|h| {
            Ok(HistoryEntry {
                version: h.version,
                timestamp: h.timestamp,
                kind: HistoryKind::from_str(&h.kind)?,
                key: h.key,
                value: h.value,
                previous: h.previous,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Want {
        metadata: Metadata {
            id: parse_id(&record.id)?,
            name: record.name,
            want_type: record.want_type,
            labels: record.labels,
            owner_refs,
        },
        spec: WantSpec {
            params: record.params,
            using: record
                .using
                .into_iter()
                .map(|match_labels| LabelSelector { match_labels })
                .collect(),
            subscriptions: record
                .subscriptions
                .into_iter()
                .map(|s| SubscriptionSpec {
                    target: s.target,
                    keys: s.keys,
                    retrigger: s.retrigger,
                })
                .collect(),
            when: record.when.into_iter().map(|every| WhenHint { every }).collect(),
        },
        state: record.state,
        status: WantStatus::from_str(&record.status)?,
        history,
        run_generation: record.run_generation,
        suspended: record.suspended,
    })
}

pub fn to_snapshot<'a>(wants: impl IntoIterator<Item = &'a Want>) -> GraphSnapshot {
    GraphSnapshot::new(wants.into_iter().map(to_record).collect())
}

/// Result of combining a snapshot with fresh configuration
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub wants: Vec<Want>,
    /// In both; runtime fields taken from the snapshot
    pub restored: Vec<String>,
    /// Only in configuration
    pub added: Vec<String>,
    /// Only in the snapshot, carried over
    pub kept: Vec<String>,
    /// Only in the snapshot, dropped
    pub pruned: Vec<String>,
    /// Saved records that could not be read back; configuration wins
    pub discarded: Vec<String>,
}

pub fn merge_snapshot(
    configured: Vec<Want>,
    snapshot: Option<&GraphSnapshot>,
    prune: bool,
    history_limit: usize,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    let Some(snapshot) = snapshot else {
        outcome.added = configured.iter().map(|w| w.name().to_string()).collect();
        outcome.wants = configured;
        return Ok(outcome);
    };

    let configured_names: BTreeSet<String> =
        configured.iter().map(|w| w.name().to_string()).collect();

    for mut want in configured {
        let Some(record) = snapshot.find(want.name()) else {
            outcome.added.push(want.name().to_string());
            outcome.wants.push(want);
            continue;
        };
        let saved = match from_record(record.clone()) {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Discarding saved record for '{}': {}", want.name(), e);
                outcome.discarded.push(want.name().to_string());
                outcome.added.push(want.name().to_string());
                outcome.wants.push(want);
                continue;
            }
        };
        if saved.want_type() != want.want_type() {
            warn!(
                "Want '{}' changed type ({} -> {}); discarding saved progress",
                want.name(),
                saved.want_type(),
                want.want_type()
            );
            outcome.added.push(want.name().to_string());
            outcome.wants.push(want);
            continue;
        }
        want.metadata.id = saved.metadata.id;
        want.state = saved.state;
        want.status = saved.status;
        want.history = saved.history;
        want.run_generation = saved.run_generation;
        want.suspended = saved.suspended;
        recover(&mut want, history_limit)?;
        outcome.restored.push(want.name().to_string());
        outcome.wants.push(want);
    }

    for record in &snapshot.wants {
        if configured_names.contains(&record.name) {
            continue;
        }
        if prune {
            outcome.pruned.push(record.name.clone());
            continue;
        }
        let mut want = match from_record(record.clone()) {
            Ok(want) => want,
            Err(e) => {
                warn!("Discarding saved record for '{}': {}", record.name, e);
                outcome.discarded.push(record.name.clone());
                continue;
            }
        };
        recover(&mut want, history_limit)?;
        outcome.kept.push(want.name().to_string());
        outcome.wants.push(want);
    }

    info!(
        "Snapshot merge: {} restored, {} added, {} kept, {} pruned, {} discarded",
        outcome.restored.len(),
        outcome.added.len(),
        outcome.kept.len(),
        outcome.pruned.len(),
        outcome.discarded.len()
    );
    Ok(outcome)
}

/// A run cannot be resumed mid-step; bring it back as idle
fn recover(want: &mut Want, history_limit: usize) -> Result<()> {
    if want.status == WantStatus::Running {
        WantStateMachine::new(want, history_limit).requeue("recovered")?;
    }
    Ok(())
}
