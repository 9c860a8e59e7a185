//! Reconciliation engine
//!
//! The engine owns the want map and drives it toward the declared graph. One
//! reconcile pass:
//!
//! 1. applies queued asynchronous additions and deletions
//! 2. re-resolves selectors when the want set changed
//! 3. marks idle members of a dependency cycle failed
//! 4. launches every idle, ready want in producer-first order, giving each a
//!    fresh set of input queues
//! 5. settles end-barrier reservations so `execute` waits exactly for the
//!    wants that can still make progress
//!
//! All mutations of the map go through one `parking_lot` write lock and never
//! await while holding it. Passes themselves are serialised by an async mutex.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wantgraph_store::{GraphSnapshot, SnapshotStore, StorageError};

use crate::chain::{queue, Chain, ChainContext, Handoff, Inbox, Outbox, StageFault};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{RestartReason, WantStateMachine};
use crate::metrics::EngineMetrics;
use crate::notification::{
    Delivery, KeyFilter, ListenerInfo, NotificationBus, NotificationEvent, NotificationKind,
    Subscription,
};
use crate::persistence::{self, MergeOutcome};
use crate::registry::{Progressable, TypeRegistry};
use crate::run::{RunContext, WantStage};
use crate::scheduler::{parse_every, Scheduler};
use crate::selector::LabelRegistry;
use crate::want::{HistoryKind, Want, WantStatus};
use crate::wiring::{WiringDiagnostic, WiringPlan};

// ═══════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of adding one want
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub name: String,
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AddOutcome {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub wiring_changed: bool,
    pub edges: usize,
    pub pending: Vec<String>,
    pub failed_cycles: Vec<String>,
    pub launched: Vec<String>,
    /// Achieved producers re-opened to replay output for a consumer
    pub replayed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        !self.wiring_changed
            && self.failed_cycles.is_empty()
            && self.launched.is_empty()
            && self.replayed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// False when loading failed and fresh configuration was used as is
    pub from_snapshot: bool,
    pub restored: Vec<String>,
    pub added: Vec<String>,
    pub kept: Vec<String>,
    pub pruned: Vec<String>,
    /// Saved records that could not be read; these wants start fresh
    pub discarded: Vec<String>,
    pub outcomes: Vec<AddOutcome>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared state
// ═══════════════════════════════════════════════════════════════════════════

/// Per-want runtime bookkeeping that is never persisted
#[derive(Default)]
pub(crate) struct Runtime {
    /// Present while the want is not running
    progressable: Option<Box<dyn Progressable>>,
    /// Receivers created by producer runs, not yet consumed by a run of ours
    pending_inputs: BTreeMap<String, Inbox>,
    /// Run again as soon as the current run finishes
    rerun: bool,
    /// Keeps `execute` waiting while this idle want still has to run
    reservation: Option<Handoff>,
    cancel: Option<CancellationToken>,
    inbox: VecDeque<NotificationEvent>,
    /// Parameter keys written since the last run started
    unobserved_params: BTreeSet<String>,
}

pub(crate) struct WantEntry {
    pub(crate) want: Want,
    rt: Runtime,
}

enum Mutation {
    Add(Vec<Want>, Handoff),
    Delete(Vec<String>, Handoff),
}

/// Everything a launched run needs, taken out under the write lock
struct Launch {
    name: String,
    generation: u64,
    progressable: Box<dyn Progressable>,
    params: BTreeMap<String, Value>,
    inputs: Vec<Inbox>,
    outputs: Vec<(String, Outbox)>,
    reservation: Option<Handoff>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Lifecycle {
    loop_cancel: Option<CancellationToken>,
    loop_handle: Option<JoinHandle<()>>,
    scheduler: Option<Arc<Scheduler>>,
}

pub(crate) enum RunEnd {
    Failed(String),
    Interrupted,
}

pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    registry: TypeRegistry,
    pub(crate) chain: Arc<ChainContext>,
    bus: NotificationBus,
    labels: LabelRegistry,
    wants: RwLock<BTreeMap<String, WantEntry>>,
    plan: RwLock<Arc<WiringPlan>>,
    topology_dirty: AtomicBool,
    pass: tokio::sync::Mutex<()>,
    queued: Mutex<VecDeque<Mutation>>,
    trigger: Notify,
    epoch: watch::Sender<u64>,
    store: RwLock<Option<Arc<dyn SnapshotStore>>>,
    last_checksum: Mutex<Option<String>>,
    run_cancel: Mutex<CancellationToken>,
    lifecycle: Mutex<Lifecycle>,
    metrics: Option<EngineMetrics>,
}

impl EngineShared {
    fn limit(&self) -> usize {
        self.config.state_history_limit
    }

    pub(crate) fn kick(&self) {
        self.trigger.notify_one();
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    pub(crate) fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn record_metric(&self, f: impl FnOnce(&EngineMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Notifications
    // ───────────────────────────────────────────────────────────────────────

    fn push_inbox(&self, map: &mut BTreeMap<String, WantEntry>, event: NotificationEvent) {
        if let Some(entry) = map.get_mut(&event.target) {
            if entry.rt.inbox.len() >= self.config.inbox_limit.max(1) {
                entry.rt.inbox.pop_front();
            }
            entry.rt.inbox.push_back(event);
        }
    }

    /// Hand deliveries to their subscribers and re-open achieved ones that asked for it
    fn dispatch(
        &self,
        map: &mut BTreeMap<String, WantEntry>,
        deliveries: Vec<Delivery>,
        restarted: &mut Vec<String>,
    ) {
        self.record_metric(|m| m.notified(deliveries.len()));
        for delivery in deliveries {
            let target = delivery.event.target.clone();
            self.push_inbox(map, delivery.event);
            if delivery.retrigger {
                self.restart_locked(map, &target, RestartReason::Retrigger, restarted);
            }
        }
    }

    /// Publish a status change to subscribers and to every owner
    fn emit_status(
        &self,
        map: &mut BTreeMap<String, WantEntry>,
        name: &str,
        from: WantStatus,
        to: WantStatus,
    ) {
        let value = json!(to.as_str());
        let previous = json!(from.as_str());
        let deliveries =
            self.bus
                .publish(name, "status", &value, Some(&previous), NotificationKind::Status);
        for delivery in deliveries {
            self.push_inbox(map, delivery.event);
        }

        let owners: Vec<String> = map
            .get(name)
            .map(|e| {
                e.want
                    .metadata
                    .owner_refs
                    .iter()
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for owner in owners {
            let event = self
                .bus
                .notify(name, &owner, "status", &value, NotificationKind::OwnerChild);
            self.push_inbox(map, event);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Restarts
    // ───────────────────────────────────────────────────────────────────────

    /// Re-open `name`. Achieved goes back to idle and its owners follow;
    /// a running want is asked to run again unless only a child re-opened.
    fn restart_locked(
        &self,
        map: &mut BTreeMap<String, WantEntry>,
        name: &str,
        reason: RestartReason,
        restarted: &mut Vec<String>,
    ) {
        let Some(entry) = map.get_mut(name) else {
            return;
        };
        let status = entry.want.status;
        match status {
            WantStatus::Achieved => {
                if let Err(e) =
                    WantStateMachine::new(&mut entry.want, self.limit()).restart(reason)
                {
                    warn!("Cannot restart '{}': {}", name, e);
                    return;
                }
                if entry.rt.reservation.is_none() && !entry.want.suspended {
                    entry.rt.reservation = Some(self.chain.reserve());
                }
                debug!("Restarted '{}' ({})", name, reason);
                restarted.push(name.to_string());
                self.emit_status(map, name, WantStatus::Achieved, WantStatus::Idle);

                let owners: Vec<String> = map
                    .get(name)
                    .map(|e| {
                        e.want
                            .metadata
                            .owner_refs
                            .iter()
                            .map(|r| r.name.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                for owner in owners {
                    self.restart_locked(map, &owner, RestartReason::ChildReopened, restarted);
                }
            }
            WantStatus::Running => match reason {
                RestartReason::ChildReopened | RestartReason::Retrigger | RestartReason::Scheduled => {}
                _ => entry.rt.rerun = true,
            },
            WantStatus::Idle | WantStatus::Failed => {}
        }
    }

    /// Restart entry point for the scheduler; false once the want is gone
    pub(crate) fn scheduled_restart(&self, name: &str, reason: RestartReason) -> bool {
        let mut restarted = Vec::new();
        {
            let mut map = self.wants.write();
            if !map.contains_key(name) {
                return false;
            }
            self.restart_locked(&mut map, name, reason, &mut restarted);
        }
        if !restarted.is_empty() {
            info!("Scheduled restart of '{}'", name);
            self.bump_epoch();
            self.kick();
        }
        true
    }

    // ───────────────────────────────────────────────────────────────────────
    // Mutations
    // ───────────────────────────────────────────────────────────────────────

    fn apply_add(self: &Arc<Self>, wants: Vec<Want>) -> Vec<AddOutcome> {
        let mut outcomes = Vec::with_capacity(wants.len());
        let mut accepted: Vec<(Want, Box<dyn Progressable>)> = Vec::new();
        let mut restarted = Vec::new();

        {
            let mut map = self.wants.write();
            let mut batch: BTreeSet<String> = BTreeSet::new();

            for want in wants {
                match self.admit(&map, &batch, &want) {
                    Ok(progressable) => {
                        batch.insert(want.name().to_string());
                        accepted.push((want, progressable));
                    }
                    Err(e) => {
                        warn!("Rejected want '{}': {}", want.name(), e);
                        outcomes.push(AddOutcome {
                            name: want.name().to_string(),
                            id: want.id(),
                            error: Some(e.to_string()),
                        });
                    }
                }
            }

            // Owners must exist already or arrive in the same batch.
            let (admitted, orphans): (Vec<_>, Vec<_>) =
                accepted.into_iter().partition(|(want, _)| {
                    want.metadata
                        .owner_refs
                        .iter()
                        .all(|r| map.contains_key(&r.name) || batch.contains(&r.name))
                });
            for (want, _) in orphans {
                let missing: Vec<&str> = want
                    .metadata
                    .owner_refs
                    .iter()
                    .filter(|r| !map.contains_key(&r.name) && !batch.contains(&r.name))
                    .map(|r| r.name.as_str())
                    .collect();
                let err = EngineError::WantNotFound(missing.join(", "));
                warn!("Rejected want '{}': unknown owner {}", want.name(), err);
                outcomes.push(AddOutcome {
                    name: want.name().to_string(),
                    id: want.id(),
                    error: Some(err.to_string()),
                });
            }

            let ids: BTreeMap<String, Uuid> = map
                .iter()
                .map(|(n, e)| (n.clone(), e.want.id()))
                .chain(admitted.iter().map(|(w, _)| (w.name().to_string(), w.id())))
                .collect();

            let mut added = Vec::new();
            for (mut want, progressable) in admitted {
                for owner in want.metadata.owner_refs.iter_mut() {
                    owner.id = ids.get(&owner.name).copied();
                }
                if want.status == WantStatus::Running {
                    // Only restored wants can arrive running; they start over.
                    let _ = WantStateMachine::new(&mut want, self.limit()).requeue("recovered");
                }

                let name = want.name().to_string();
                self.labels.record(&want.metadata.labels);
                self.bus.register_listener(&name);
                for sub in &want.spec.subscriptions {
                    self.bus.subscribe(
                        &name,
                        &sub.target,
                        KeyFilter::from_keys(&sub.keys),
                        sub.retrigger,
                    );
                }

                outcomes.push(AddOutcome {
                    name: name.clone(),
                    id: want.id(),
                    error: None,
                });
                added.push((name.clone(), want.metadata.owner_refs.clone()));
                map.insert(
                    name,
                    WantEntry {
                        want,
                        rt: Runtime {
                            progressable: Some(progressable),
                            ..Runtime::default()
                        },
                    },
                );
            }

            // A new child re-opens an achieved parent.
            for (_, owners) in &added {
                for owner in owners {
                    self.restart_locked(
                        &mut map,
                        &owner.name,
                        RestartReason::ChildReopened,
                        &mut restarted,
                    );
                }
            }

            if !added.is_empty() {
                self.topology_dirty.store(true, Ordering::SeqCst);
                info!("Added {} want(s)", added.len());
            }
        }

        self.schedule_hints(
            outcomes
                .iter()
                .filter(|o| o.is_accepted())
                .map(|o| o.name.clone())
                .collect(),
        );
        self.bump_epoch();
        self.kick();
        outcomes
    }

    fn admit(
        &self,
        map: &BTreeMap<String, WantEntry>,
        batch: &BTreeSet<String>,
        want: &Want,
    ) -> Result<Box<dyn Progressable>> {
        let name = want.name();
        if name.trim().is_empty() {
            return Err(EngineError::parse("want name must not be empty"));
        }
        if map.contains_key(name) || batch.contains(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        if want.is_owned_by(name) {
            return Err(EngineError::parse(format!("want '{}' cannot own itself", name)));
        }
        for hint in &want.spec.when {
            parse_every(&hint.every)?;
        }
        self.registry.create(want)
    }

    fn schedule_hints(self: &Arc<Self>, names: Vec<String>) {
        let Some(scheduler) = self.lifecycle.lock().scheduler.clone() else {
            return;
        };
        let map = self.wants.read();
        for name in names {
            let Some(entry) = map.get(&name) else { continue };
            for hint in &entry.want.spec.when {
                if let Ok(every) = parse_every(&hint.every) {
                    scheduler.schedule(Arc::downgrade(self), &name, every);
                }
            }
        }
    }

    /// Remove `name` and everything it owns, transitively
    fn apply_delete(&self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut map = self.wants.write();
            if !map.contains_key(name) {
                return removed;
            }

            let mut doomed: BTreeSet<String> = BTreeSet::new();
            let mut frontier = VecDeque::from([name.to_string()]);
            while let Some(current) = frontier.pop_front() {
                if !doomed.insert(current.clone()) {
                    continue;
                }
                for (child, entry) in map.iter() {
                    if entry.want.is_owned_by(&current) && !doomed.contains(child) {
                        frontier.push_back(child.clone());
                    }
                }
            }

            for victim in &doomed {
                if let Some(entry) = map.remove(victim) {
                    if let Some(cancel) = &entry.rt.cancel {
                        cancel.cancel();
                    }
                    self.bus.unregister_listener(victim);
                    removed.push(victim.clone());
                }
            }
            for entry in map.values_mut() {
                for victim in &doomed {
                    entry.rt.pending_inputs.remove(victim);
                }
            }
            self.topology_dirty.store(true, Ordering::SeqCst);
        }

        let scheduler = self.lifecycle.lock().scheduler.clone();
        if let Some(scheduler) = scheduler {
            for victim in &removed {
                scheduler.unschedule(victim);
            }
        }
        info!("Deleted {} want(s): {}", removed.len(), removed.join(", "));
        self.bump_epoch();
        self.kick();
        removed
    }

    // ───────────────────────────────────────────────────────────────────────
    // State and parameters
    // ───────────────────────────────────────────────────────────────────────

    /// The only path that writes want state: history, then notifications
    pub(crate) fn write_state(&self, name: &str, key: &str, value: Value) -> Result<bool> {
        let mut restarted = Vec::new();
        {
            let mut map = self.wants.write();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
            let previous = entry.want.state.get(key).cloned();
            if previous.as_ref() == Some(&value) {
                return Ok(false);
            }
            entry.want.state.insert(key.to_string(), value.clone());
            entry.want.record(
                HistoryKind::State,
                key,
                value.clone(),
                previous.clone(),
                self.limit(),
            );
            let deliveries =
                self.bus
                    .publish(name, key, &value, previous.as_ref(), NotificationKind::State);
            self.dispatch(&mut map, deliveries, &mut restarted);
        }
        self.bump_epoch();
        if !restarted.is_empty() {
            debug!("State change {}.{} re-opened {:?}", name, key, restarted);
            self.kick();
        }
        Ok(true)
    }

    pub(crate) fn read_state(&self, name: &str, key: &str) -> Option<Value> {
        self.wants
            .read()
            .get(name)
            .and_then(|e| e.want.state.get(key).cloned())
    }

    pub(crate) fn children_of(&self, name: &str) -> Vec<(String, WantStatus)> {
        self.wants
            .read()
            .iter()
            .filter(|(_, e)| e.want.is_owned_by(name))
            .map(|(n, e)| (n.clone(), e.want.status))
            .collect()
    }

    pub(crate) fn inbox_of(&self, name: &str) -> Vec<NotificationEvent> {
        self.wants
            .read()
            .get(name)
            .map(|e| e.rt.inbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn update_parameter(&self, name: &str, key: &str, value: Value) -> Result<()> {
        let mut restarted = Vec::new();
        {
            let mut map = self.wants.write();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;

            let previous = entry.want.spec.params.get(key).cloned();
            if !entry.rt.unobserved_params.insert(key.to_string()) {
                warn!(
                    "Parameter conflict on {}.{}: {:?} overwritten by {} before any run observed it",
                    name, key, previous, value
                );
                entry.want.record(
                    HistoryKind::ParameterConflict,
                    key,
                    json!({ "winner": value, "overwritten": previous }),
                    previous.clone(),
                    self.limit(),
                );
            }
            entry.want.spec.params.insert(key.to_string(), value.clone());
            entry.want.record(
                HistoryKind::Parameter,
                key,
                value.clone(),
                previous.clone(),
                self.limit(),
            );
            info!("Parameter {}.{} = {}", name, key, value);

            let deliveries = self.bus.publish(
                name,
                key,
                &value,
                previous.as_ref(),
                NotificationKind::Parameter,
            );
            self.restart_locked(&mut map, name, RestartReason::ParameterChange, &mut restarted);
            self.dispatch(&mut map, deliveries, &mut restarted);

            // Owners push parameters down to their children.
            let children: Vec<String> = map
                .iter()
                .filter(|(_, e)| e.want.is_owned_by(name))
                .map(|(n, _)| n.clone())
                .collect();
            for child in children {
                if let Some(entry) = map.get_mut(&child) {
                    let previous = entry.want.spec.params.get(key).cloned();
                    entry.want.spec.params.insert(key.to_string(), value.clone());
                    entry.rt.unobserved_params.insert(key.to_string());
                    entry.want.record(
                        HistoryKind::Parameter,
                        key,
                        value.clone(),
                        previous,
                        self.limit(),
                    );
                }
                self.restart_locked(&mut map, &child, RestartReason::ParameterChange, &mut restarted);
            }
        }
        self.bump_epoch();
        self.kick();
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Run completion (called from WantStage)
    // ───────────────────────────────────────────────────────────────────────

    /// Try to end a run as achieved. Returns false while a child is not
    /// achieved yet; the run keeps going in that case.
    pub(crate) fn complete_run(
        &self,
        name: &str,
        generation: u64,
        progressable: &mut Option<Box<dyn Progressable>>,
    ) -> bool {
        let mut map = self.wants.write();
        let children_settled = map
            .values()
            .filter(|e| e.want.is_owned_by(name))
            .all(|e| e.want.status == WantStatus::Achieved);

        let Some(entry) = map.get_mut(name) else {
            return true;
        };
        if entry.want.run_generation != generation || entry.want.status != WantStatus::Running {
            return true;
        }
        if !children_settled {
            return false;
        }

        entry.rt.cancel = None;
        entry.rt.progressable = progressable.take();
        let limit = self.limit();
        let to = if entry.rt.rerun {
            entry.rt.rerun = false;
            if let Err(e) = WantStateMachine::new(&mut entry.want, limit).requeue("rerun") {
                warn!("Cannot requeue '{}': {}", name, e);
                return true;
            }
            if entry.rt.reservation.is_none() && !entry.want.suspended {
                entry.rt.reservation = Some(self.chain.reserve());
            }
            debug!("'{}' finished run {} and goes again", name, generation);
            WantStatus::Idle
        } else {
            if let Err(e) = WantStateMachine::new(&mut entry.want, limit).achieve() {
                warn!("Cannot achieve '{}': {}", name, e);
                return true;
            }
            self.record_metric(|m| m.run_achieved());
            info!("Want '{}' achieved (run {})", name, generation);
            WantStatus::Achieved
        };
        self.emit_status(&mut map, name, WantStatus::Running, to);
        true
    }

    pub(crate) fn end_run(
        &self,
        name: &str,
        generation: u64,
        progressable: Option<Box<dyn Progressable>>,
        end: RunEnd,
    ) {
        let mut map = self.wants.write();
        let Some(entry) = map.get_mut(name) else {
            return;
        };
        if entry.rt.progressable.is_none() {
            entry.rt.progressable = progressable;
        }
        if entry.want.run_generation != generation || entry.want.status != WantStatus::Running {
            return;
        }
        entry.rt.cancel = None;
        entry.rt.rerun = false;

        let limit = self.limit();
        let to = match end {
            RunEnd::Failed(reason) => {
                if let Err(e) = WantStateMachine::new(&mut entry.want, limit).fail(&reason) {
                    warn!("Cannot fail '{}': {}", name, e);
                    return;
                }
                self.record_metric(|m| m.run_failed());
                error!("Want '{}' failed: {}", name, reason);
                WantStatus::Failed
            }
            RunEnd::Interrupted => {
                if let Err(e) = WantStateMachine::new(&mut entry.want, limit).requeue("interrupted")
                {
                    warn!("Cannot requeue '{}': {}", name, e);
                    return;
                }
                debug!("Want '{}' interrupted", name);
                WantStatus::Idle
            }
        };
        self.emit_status(&mut map, name, WantStatus::Running, to);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reconcile
    // ───────────────────────────────────────────────────────────────────────

    async fn reconcile(self: &Arc<Self>) -> ReconcileReport {
        let _pass = self.pass.lock().await;
        self.reconcile_locked()
    }

    fn reconcile_locked(self: &Arc<Self>) -> ReconcileReport {
        let queued: Vec<Mutation> = self.queued.lock().drain(..).collect();
        let mut holds = Vec::new();
        for mutation in queued {
            match mutation {
                Mutation::Add(wants, hold) => {
                    self.apply_add(wants);
                    holds.push(hold);
                }
                Mutation::Delete(names, hold) => {
                    for name in names {
                        self.apply_delete(&name);
                    }
                    holds.push(hold);
                }
            }
        }

        let mut report = ReconcileReport::default();
        if self.topology_dirty.swap(false, Ordering::SeqCst) {
            let plan = {
                let map = self.wants.read();
                WiringPlan::resolve(map.values().map(|e| &e.want))
            };
            let previous = self.plan.read().fingerprint();
            report.wiring_changed = plan.fingerprint() != previous;
            if report.wiring_changed {
                info!(
                    "Wiring resolved: {} edge(s), {} diagnostic(s)",
                    plan.edge_count(),
                    plan.diagnostics().len()
                );
                for diagnostic in plan.diagnostics() {
                    warn!("{}: {}", diagnostic.want, diagnostic.message);
                }
            }
            *self.plan.write() = Arc::new(plan);
        }
        let plan = self.plan.read().clone();
        report.edges = plan.edge_count();

        let mut launches = Vec::new();
        let mut restarted = Vec::new();
        {
            let mut map = self.wants.write();
            report.pending = map
                .keys()
                .filter(|n| plan.is_pending(n))
                .cloned()
                .collect();

            for cycle in plan.cycles() {
                let reason = EngineError::Cycle(
                    cycle.iter().chain(cycle.first()).cloned().collect(),
                )
                .to_string();
                for member in cycle {
                    let Some(entry) = map.get_mut(member) else { continue };
                    if entry.want.status != WantStatus::Idle {
                        continue;
                    }
                    if WantStateMachine::new(&mut entry.want, self.limit())
                        .fail(&reason)
                        .is_ok()
                    {
                        entry.rt.reservation = None;
                        report.failed_cycles.push(member.clone());
                        self.emit_status(&mut map, member, WantStatus::Idle, WantStatus::Failed);
                    }
                }
            }

            for phase in plan.start_order() {
                for name in phase {
                    let launchable = map.get(name).map_or(false, |e| {
                        e.want.status == WantStatus::Idle
                            && !e.want.suspended
                            && e.rt.progressable.is_some()
                    });
                    if !launchable
                        || !self.inputs_ready(&mut map, &plan, name, &mut report, &mut restarted)
                    {
                        continue;
                    }
                    match self.prepare_launch(&mut map, &plan, name, &mut restarted) {
                        Ok(launch) => {
                            report.launched.push(name.clone());
                            launches.push(launch);
                        }
                        Err(e) => warn!("Cannot launch '{}': {}", name, e),
                    }
                }
            }

            self.settle_reservations(&mut map, &plan);
        }

        for launch in launches {
            self.spawn_run(launch);
        }
        drop(holds);

        if !report.is_quiet() {
            debug!("Reconcile: {:?}", report);
            self.bump_epoch();
        }
        if !restarted.is_empty() {
            self.kick();
        }
        report
    }

    /// Every producer has left a queue for `name`. Missing queues are
    /// requested from the producer (replay) where possible.
    fn inputs_ready(
        &self,
        map: &mut BTreeMap<String, WantEntry>,
        plan: &WiringPlan,
        name: &str,
        report: &mut ReconcileReport,
        restarted: &mut Vec<String>,
    ) -> bool {
        let mut ready = true;
        for producer in plan.producers_of(name) {
            let has_queue = map
                .get(name)
                .map_or(false, |e| e.rt.pending_inputs.contains_key(&producer));
            if has_queue {
                continue;
            }
            ready = false;
            let status = map.get(&producer).map(|e| e.want.status);
            match status {
                Some(WantStatus::Achieved) => {
                    self.restart_locked(map, &producer, RestartReason::ConsumerReplay, restarted);
                    if !report.replayed.contains(&producer) {
                        info!("Replaying '{}' for consumer '{}'", producer, name);
                        report.replayed.push(producer);
                    }
                }
                Some(WantStatus::Running) => {
                    if let Some(entry) = map.get_mut(&producer) {
                        entry.rt.rerun = true;
                    }
                }
                _ => {}
            }
        }
        ready
    }

    fn prepare_launch(
        &self,
        map: &mut BTreeMap<String, WantEntry>,
        plan: &WiringPlan,
        name: &str,
        restarted: &mut Vec<String>,
    ) -> Result<Launch> {
        let run_cancel = self.run_cancel.lock().clone();
        let entry = map
            .get_mut(name)
            .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
        let generation = WantStateMachine::new(&mut entry.want, self.limit()).start()?;
        let progressable = entry
            .rt
            .progressable
            .take()
            .ok_or_else(|| EngineError::fault(name, "behaviour still owned by a previous run"))?;
        let inputs: Vec<Inbox> = std::mem::take(&mut entry.rt.pending_inputs)
            .into_values()
            .collect();
        entry.rt.unobserved_params.clear();
        entry.rt.rerun = false;
        let reservation = entry.rt.reservation.take();
        let cancel = run_cancel.child_token();
        entry.rt.cancel = Some(cancel.clone());
        let params = entry.want.spec.params.clone();

        self.record_metric(|m| m.run_started());
        info!("Launching '{}' (run {})", name, generation);
        self.emit_status(map, name, WantStatus::Idle, WantStatus::Running);

        let mut outputs = Vec::new();
        for consumer in plan.consumers_of(name) {
            let Some(entry) = map.get_mut(&consumer) else { continue };
            if entry.want.status == WantStatus::Failed || entry.want.suspended {
                continue;
            }
            let (tx, rx) = queue(self.chain.queue_capacity());
            entry.rt.pending_inputs.insert(name.to_string(), rx);
            let status = entry.want.status;
            match status {
                WantStatus::Achieved => {
                    self.restart_locked(map, &consumer, RestartReason::UpstreamRerun, restarted);
                }
                WantStatus::Running => entry.rt.rerun = true,
                WantStatus::Idle if entry.rt.reservation.is_none() => {
                    entry.rt.reservation = Some(self.chain.reserve());
                }
                _ => {}
            }
            outputs.push((consumer, tx));
        }

        Ok(Launch {
            name: name.to_string(),
            generation,
            progressable,
            params,
            inputs,
            outputs,
            reservation,
            cancel,
        })
    }

    fn spawn_run(self: &Arc<Self>, launch: Launch) {
        let ctx = RunContext::new(
            Arc::clone(self),
            launch.name.clone(),
            launch.generation,
            launch.params,
            launch.outputs,
            launch.cancel,
        );
        let stage = WantStage::new(ctx, launch.progressable, launch.reservation);

        let mut chain = Chain::named(&self.chain, launch.name.clone());
        let mut inputs = launch.inputs.into_iter();
        if let Some(first) = inputs.next() {
            chain.attach(first);
            for rx in inputs {
                let mut other = Chain::named(&self.chain, launch.name.clone());
                other.attach(rx);
                chain.merge(other, None);
            }
        }
        chain.end(stage);
    }

    /// Idle wants that can still run hold a reservation; the rest release it
    fn settle_reservations(&self, map: &mut BTreeMap<String, WantEntry>, plan: &WiringPlan) {
        let mut stalled: BTreeSet<String> = BTreeSet::new();
        for phase in plan.start_order() {
            for name in phase {
                let Some(entry) = map.get(name) else { continue };
                let is_stalled = match entry.want.status {
                    WantStatus::Failed => true,
                    WantStatus::Idle if entry.want.suspended => true,
                    WantStatus::Idle => plan.producers_of(name).iter().any(|p| {
                        !entry.rt.pending_inputs.contains_key(p) && stalled.contains(p)
                    }),
                    _ => false,
                };
                if is_stalled {
                    stalled.insert(name.clone());
                }
            }
        }

        for (name, entry) in map.iter_mut() {
            let wants_slot = entry.want.status == WantStatus::Idle
                && plan.is_ready(name)
                && !stalled.contains(name);
            if wants_slot {
                if entry.rt.reservation.is_none() {
                    entry.rt.reservation = Some(self.chain.reserve());
                }
            } else if entry.want.status != WantStatus::Running {
                entry.rt.reservation = None;
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Snapshots
    // ───────────────────────────────────────────────────────────────────────

    fn snapshot(&self) -> GraphSnapshot {
        let map = self.wants.read();
        persistence::to_snapshot(map.values().map(|e| &e.want))
    }

    fn store(&self) -> Result<Arc<dyn SnapshotStore>> {
        self.store
            .read()
            .clone()
            .ok_or_else(|| StorageError::config("no snapshot store configured").into())
    }

    async fn save_snapshot(&self) -> Result<GraphSnapshot> {
        let store = self.store()?;
        let snapshot = self.snapshot();
        store.save(&snapshot).await?;
        *self.last_checksum.lock() = Some(snapshot.checksum());
        info!(
            "Saved snapshot of {} want(s) to {}",
            snapshot.wants.len(),
            store.backend()
        );
        Ok(snapshot)
    }

    /// Background save; skipped when nothing changed since the last save
    async fn periodic_snapshot(&self) {
        let Ok(store) = self.store() else { return };
        let snapshot = self.snapshot();
        let checksum = snapshot.checksum();
        if self.last_checksum.lock().as_deref() == Some(checksum.as_str()) {
            return;
        }
        match store.save(&snapshot).await {
            Ok(()) => {
                debug!("Periodic snapshot saved to {}", store.backend());
                *self.last_checksum.lock() = Some(checksum);
            }
            Err(e) => warn!("Periodic snapshot to {} failed: {}", store.backend(), e),
        }
    }

    fn drop_idle_reservations(&self) {
        for entry in self.wants.write().values_mut() {
            if entry.want.status != WantStatus::Running {
                entry.rt.reservation = None;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Handle to one engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, TypeRegistry::with_builtins())
    }

    pub fn with_registry(config: EngineConfig, registry: TypeRegistry) -> Self {
        let metrics = match EngineMetrics::new() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        };
        let (epoch, _) = watch::channel(0);
        let shared = EngineShared {
            chain: ChainContext::new(config.queue_capacity),
            bus: NotificationBus::new(config.notification_history),
            labels: LabelRegistry::new(),
            registry,
            wants: RwLock::new(BTreeMap::new()),
            plan: RwLock::new(Arc::new(WiringPlan::default())),
            topology_dirty: AtomicBool::new(false),
            pass: tokio::sync::Mutex::new(()),
            queued: Mutex::new(VecDeque::new()),
            trigger: Notify::new(),
            epoch,
            store: RwLock::new(None),
            last_checksum: Mutex::new(None),
            run_cancel: Mutex::new(CancellationToken::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            metrics,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.shared.registry
    }

    /// Shorthand for `registry().register(..)`
    pub fn register_type<F>(&self, want_type: impl Into<String>, factory: F)
    where
        F: Fn(&Want) -> Result<Box<dyn Progressable>> + Send + Sync + 'static,
    {
        self.shared.registry.register(want_type, factory);
    }

    pub fn set_store(&self, store: Arc<dyn SnapshotStore>) {
        info!("Snapshot store: {}", store.backend());
        *self.shared.store.write() = Some(store);
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&EngineMetrics> {
        self.shared.metrics.as_ref()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Adding and removing wants
    // ───────────────────────────────────────────────────────────────────────

    /// Add wants synchronously; each gets its own outcome
    pub async fn add_wants(&self, wants: Vec<Want>) -> Vec<AddOutcome> {
        let _pass = self.shared.pass.lock().await;
        self.shared.apply_add(wants)
    }

    /// Queue wants for the next reconcile pass and return their ids
    pub fn add_wants_async(&self, wants: Vec<Want>) -> Vec<Uuid> {
        let ids = wants.iter().map(|w| w.id()).collect();
        let hold = self.shared.chain.reserve();
        self.shared.queued.lock().push_back(Mutation::Add(wants, hold));
        self.shared.kick();
        ids
    }

    /// True once every id belongs to a want in the map
    pub fn are_wants_added(&self, ids: &[Uuid]) -> bool {
        let map = self.shared.wants.read();
        ids.iter()
            .all(|id| map.values().any(|e| e.want.id() == *id))
    }

    /// Delete a want and everything it owns. Returns the deleted names.
    pub async fn delete_want(&self, name: &str) -> Result<Vec<String>> {
        let _pass = self.shared.pass.lock().await;
        if !self.shared.wants.read().contains_key(name) {
            return Err(EngineError::WantNotFound(name.to_string()));
        }
        Ok(self.shared.apply_delete(name))
    }

    pub fn delete_wants_async(&self, names: Vec<String>) {
        let hold = self.shared.chain.reserve();
        self.shared
            .queued
            .lock()
            .push_back(Mutation::Delete(names, hold));
        self.shared.kick();
    }

    // ───────────────────────────────────────────────────────────────────────
    // Inspection
    // ───────────────────────────────────────────────────────────────────────

    pub fn get_all_want_states(&self) -> BTreeMap<String, Want> {
        self.shared
            .wants
            .read()
            .iter()
            .map(|(n, e)| (n.clone(), e.want.clone()))
            .collect()
    }

    pub fn find_want_by_id(&self, id: Uuid) -> Option<Want> {
        self.shared
            .wants
            .read()
            .values()
            .find(|e| e.want.id() == id)
            .map(|e| e.want.clone())
    }

    pub fn find_want(&self, name: &str) -> Option<Want> {
        self.shared.wants.read().get(name).map(|e| e.want.clone())
    }

    pub fn status_of(&self, name: &str) -> Option<WantStatus> {
        self.shared.wants.read().get(name).map(|e| e.want.status)
    }

    /// Stages that ended with an error or a panic, oldest first
    pub fn stage_faults(&self) -> Vec<StageFault> {
        self.shared.chain.faults()
    }

    pub fn wiring_plan(&self) -> Arc<WiringPlan> {
        self.shared.plan.read().clone()
    }

    pub fn wiring_diagnostics(&self) -> Vec<WiringDiagnostic> {
        self.shared.plan.read().diagnostics().to_vec()
    }

    pub fn registered_labels(&self) -> BTreeMap<String, Vec<String>> {
        self.shared.labels.snapshot()
    }

    pub fn get_registered_listeners(&self) -> Vec<ListenerInfo> {
        self.shared.bus.registered_listeners()
    }

    pub fn get_subscriptions(&self) -> Vec<Subscription> {
        self.shared.bus.subscriptions()
    }

    /// Newest `limit` notifications, oldest first (`0` = all retained)
    pub fn get_notification_history(&self, limit: usize) -> Vec<NotificationEvent> {
        self.shared.bus.history(limit)
    }

    pub fn watch_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.shared.bus.watch()
    }

    /// Ticks on every observable change of the want map
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.shared.subscribe_epoch()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Control
    // ───────────────────────────────────────────────────────────────────────

    pub fn update_parameter(&self, name: &str, key: &str, value: impl Into<Value>) -> Result<()> {
        self.shared.update_parameter(name, key, value.into())
    }

    /// Re-open an achieved want (or ask a running one to go again)
    pub fn restart_want(&self, name: &str) -> Result<()> {
        let mut restarted = Vec::new();
        {
            let mut map = self.shared.wants.write();
            let status = map
                .get(name)
                .map(|e| e.want.status)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
            if status == WantStatus::Failed {
                return Err(EngineError::InvalidStateTransition {
                    from: status.as_str().to_string(),
                    to: WantStatus::Idle.as_str().to_string(),
                });
            }
            self.shared
                .restart_locked(&mut map, name, RestartReason::Explicit, &mut restarted);
        }
        self.shared.bump_epoch();
        self.shared.kick();
        Ok(())
    }

    /// Return a failed want to idle so the next pass runs it again
    pub fn reset_want(&self, name: &str) -> Result<()> {
        {
            let mut map = self.shared.wants.write();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
            WantStateMachine::new(&mut entry.want, self.shared.limit()).reset()?;
            info!("Reset want '{}'", name);
            self.shared
                .emit_status(&mut map, name, WantStatus::Failed, WantStatus::Idle);
        }
        self.shared.bump_epoch();
        self.shared.kick();
        Ok(())
    }

    /// Stop launching `name`; a running run is interrupted back to idle
    pub fn suspend_want(&self, name: &str) -> Result<()> {
        {
            let mut map = self.shared.wants.write();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
            entry.want.suspended = true;
            entry.rt.reservation = None;
            if let Some(cancel) = &entry.rt.cancel {
                cancel.cancel();
            }
        }
        info!("Suspended want '{}'", name);
        self.shared.bump_epoch();
        self.shared.kick();
        Ok(())
    }

    pub fn resume_want(&self, name: &str) -> Result<()> {
        {
            let mut map = self.shared.wants.write();
            let entry = map
                .get_mut(name)
                .ok_or_else(|| EngineError::WantNotFound(name.to_string()))?;
            entry.want.suspended = false;
        }
        info!("Resumed want '{}'", name);
        self.shared.bump_epoch();
        self.shared.kick();
        Ok(())
    }

    pub fn trigger_reconcile(&self) {
        self.shared.kick();
    }

    /// Run one reconcile pass now.
    ///
    /// Launched runs only make progress once the start barrier is open
    /// (`start` or `execute`).
    pub async fn reconcile_once(&self) -> ReconcileReport {
        self.shared.reconcile().await
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.lock().loop_cancel.is_some()
    }

    /// Open the start barrier and start the background reconcile loop
    /// and scheduler. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.loop_cancel.is_some() {
            return;
        }
        self.shared.chain.open();

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.reconcile_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let snapshot_every = shared.config.snapshot_interval();
            let mut snapshots = tokio::time::interval(
                snapshot_every.unwrap_or(std::time::Duration::from_secs(3600)),
            );
            snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.trigger.notified() => {}
                    _ = ticker.tick() => {}
                    _ = snapshots.tick(), if snapshot_every.is_some() => {
                        shared.periodic_snapshot().await;
                        continue;
                    }
                }
                shared.reconcile().await;
            }
            debug!("Reconcile loop stopped");
        });

        let scheduler = Arc::new(Scheduler::new());
        lifecycle.loop_cancel = Some(cancel);
        lifecycle.loop_handle = Some(handle);
        lifecycle.scheduler = Some(Arc::clone(&scheduler));
        drop(lifecycle);

        let names: Vec<String> = self.shared.wants.read().keys().cloned().collect();
        self.shared.schedule_hints(names);
        info!("Engine started");
    }

    /// Stop the loop and scheduler and interrupt running wants
    pub async fn stop(&self) {
        let (cancel, handle, scheduler) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            (
                lifecycle.loop_cancel.take(),
                lifecycle.loop_handle.take(),
                lifecycle.scheduler.take(),
            )
        };
        let Some(cancel) = cancel else { return };
        cancel.cancel();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Reconcile loop ended abnormally: {}", e);
            }
        }

        let run_cancel = {
            let mut current = self.shared.run_cancel.lock();
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        run_cancel.cancel();
        self.shared.drop_idle_reservations();
        info!("Engine stopped");
    }

    /// Reconcile and wait until every want that can make progress has
    /// settled, including wants re-opened or added while waiting.
    pub async fn execute(&self) -> Result<()> {
        let started_here = !self.is_running();
        if started_here {
            self.start();
        }
        self.reconcile_once().await;
        self.shared.chain.run().await;
        if started_here {
            self.stop().await;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Persistence
    // ───────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> GraphSnapshot {
        self.shared.snapshot()
    }

    pub async fn save_snapshot(&self) -> Result<GraphSnapshot> {
        self.shared.save_snapshot().await
    }

    pub async fn load_snapshot(&self) -> Result<GraphSnapshot> {
        let store = self.shared.store()?;
        let snapshot = store.load().await?;
        snapshot.ensure_supported()?;
        Ok(snapshot)
    }

    /// Load the latest snapshot, merge it with `configured`, and add the result.
    ///
    /// A snapshot that cannot be loaded is logged and ignored; the engine
    /// starts from configuration alone. Single unreadable records are
    /// discarded and their wants start fresh.
    pub async fn restore(&self, configured: Vec<Want>) -> Result<RestoreReport> {
        let loaded = match self.load_snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(EngineError::Persistence(e)) if e.is_not_found() => {
                info!("No saved snapshot, starting from configuration");
                None
            }
            Err(e) => {
                warn!("Starting from configuration only: {}", e);
                None
            }
        };
        let prune = self.shared.config.prune_on_restore;
        let limit = self.shared.limit();
        let (outcome, loaded) =
            match persistence::merge_snapshot(configured.clone(), loaded.as_ref(), prune, limit) {
                Ok(outcome) => (outcome, loaded),
                Err(e) => {
                    warn!("Snapshot could not be merged, starting from configuration only: {}", e);
                    (persistence::merge_snapshot(configured, None, prune, limit)?, None)
                }
            };
        let MergeOutcome {
            wants,
            restored,
            added,
            kept,
            pruned,
            discarded,
        } = outcome;
        if let Some(snapshot) = &loaded {
            *self.shared.last_checksum.lock() = Some(snapshot.checksum());
        }

        let outcomes = self.add_wants(order_owners_first(wants)).await;
        Ok(RestoreReport {
            from_snapshot: loaded.is_some(),
            restored,
            added,
            kept,
            pruned,
            discarded,
            outcomes,
        })
    }
}

/// Owners before their children so a batch never references a later entry
fn order_owners_first(wants: Vec<Want>) -> Vec<Want> {
    let names: BTreeSet<String> = wants.iter().map(|w| w.name().to_string()).collect();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut remaining = wants;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<Want>, Vec<Want>) = remaining.into_iter().partition(|w| {
            w.metadata
                .owner_refs
                .iter()
                .all(|r| placed.contains(&r.name) || !names.contains(&r.name))
        });
        if ready.is_empty() {
            // Ownership loop; let admission report it.
            ordered.extend(blocked);
            break;
        }
        placed.extend(ready.iter().map(|w| w.name().to_string()));
        ordered.extend(ready);
        remaining = blocked;
    }
    ordered
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("wants", &self.shared.wants.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Instant;

    #[async_trait]
    impl Progressable for Instant {
        async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
            ctx.set_state("done", true)?;
            Ok(())
        }

        fn is_achieved(&self, _ctx: &RunContext) -> bool {
            true
        }
    }

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig {
            reconcile_interval_ms: 10,
            snapshot_interval_ms: 0,
            ..EngineConfig::default()
        });
        engine.register_type("instant", |_| Ok(Box::new(Instant)));
        engine
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_unknown_types() {
        let engine = engine();
        let outcomes = engine
            .add_wants(vec![
                Want::new("a", "instant"),
                Want::new("a", "instant"),
                Want::new("b", "mystery"),
                Want::new("c", "instant").owned_by("ghost"),
                Want::new("d", "instant").every("soon"),
            ])
            .await;
        let accepted: Vec<_> = outcomes
            .iter()
            .filter(|o| o.is_accepted())
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(accepted, vec!["a"]);
        assert_eq!(outcomes.len(), 5);
        assert_eq!(engine.get_all_want_states().len(), 1);
    }

    #[tokio::test]
    async fn test_owner_ids_are_filled_in() {
        let engine = engine();
        engine
            .add_wants(vec![
                Want::new("child", "instant").owned_by("parent"),
                Want::new("parent", "owner"),
            ])
            .await;
        let parent = engine.find_want("parent").unwrap();
        let child = engine.find_want("child").unwrap();
        assert_eq!(child.metadata.owner_refs[0].id, Some(parent.id()));
        assert_eq!(engine.find_want_by_id(child.id()).unwrap().name(), "child");
    }

    #[tokio::test]
    async fn test_reconcile_without_start_launches_but_waits() {
        let engine = engine();
        engine.add_wants(vec![Want::new("a", "instant")]).await;
        let report = engine.reconcile_once().await;
        assert_eq!(report.launched, vec!["a"]);
        assert_eq!(engine.status_of("a"), Some(WantStatus::Running));

        engine.execute().await.unwrap();
        assert_eq!(engine.status_of("a"), Some(WantStatus::Achieved));
    }

    #[tokio::test]
    async fn test_restart_and_reset_guards() {
        let engine = engine();
        assert!(matches!(
            engine.restart_want("nope"),
            Err(EngineError::WantNotFound(_))
        ));
        engine.add_wants(vec![Want::new("a", "instant")]).await;
        assert!(engine.reset_want("a").is_err());
        // Idle restart is a no-op.
        engine.restart_want("a").unwrap();
        assert_eq!(engine.status_of("a"), Some(WantStatus::Idle));
    }

    #[test]
    fn test_order_owners_first() {
        let ordered = order_owners_first(vec![
            Want::new("leaf", "t").owned_by("mid"),
            Want::new("mid", "t").owned_by("root"),
            Want::new("root", "t"),
            Want::new("external", "t").owned_by("elsewhere"),
        ]);
        let names: Vec<_> = ordered.iter().map(|w| w.name()).collect();
        assert_eq!(names, vec!["root", "external", "mid", "leaf"]);
    }

    #[tokio::test]
    async fn test_save_without_store_is_persistence_error() {
        let engine = engine();
        let err = engine.save_snapshot().await.unwrap_err();
        assert_eq!(err.fault_kind(), crate::error::FaultKind::Persistence);
    }
}
