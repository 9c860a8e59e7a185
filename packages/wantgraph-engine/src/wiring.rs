//! Selector resolution
//!
//! Turns the declared want set into a [`WiringPlan`]: which producer feeds
//! which consumer, which wants are pending or caught in a cycle, and the
//! order in which ready wants may be started. Resolution is a pure function
//! of the wants' labels and selectors, and iterates in name order, so the same
//! want set always yields the same plan.
//!
//! A want is *ready* when every one of its selectors matched at least one
//! other want and none of its producers is pending, cyclic, or itself
//! waiting on one. Edges are only kept towards ready consumers, so a producer
//! never fills a queue nobody will drain.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::error::{EngineError, FaultKind};
use crate::selector::LabelSelector;
use crate::want::Want;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Edge {
    pub producer: String,
    pub consumer: String,
}

/// Why a want is not wired
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WiringDiagnostic {
    pub want: String,
    pub kind: FaultKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    pub message: String,
}

impl WiringDiagnostic {
    pub fn to_error(&self) -> EngineError {
        match self.kind {
            FaultKind::Cycle => EngineError::Cycle(
                self.message
                    .split(" -> ")
                    .map(|s| s.to_string())
                    .collect(),
            ),
            _ => EngineError::Wiring {
                want: self.want.clone(),
                reason: self.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WiringPlan {
    edges: BTreeSet<Edge>,
    producers: BTreeMap<String, BTreeSet<String>>,
    consumers: BTreeMap<String, BTreeSet<String>>,
    diagnostics: Vec<WiringDiagnostic>,
    pending: BTreeSet<String>,
    cycles: Vec<Vec<String>>,
    blocked: BTreeSet<String>,
    start_order: Vec<Vec<String>>,
}

impl WiringPlan {
    pub fn resolve<'a>(wants: impl IntoIterator<Item = &'a Want>) -> Self {
        let mut by_name: BTreeMap<&str, &Want> = BTreeMap::new();
        for want in wants {
            by_name.insert(want.name(), want);
        }

        let mut plan = WiringPlan::default();

        // Compile: match every selector against every other want's labels.
        let mut raw: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, want) in &by_name {
            let mut matched = BTreeSet::new();
            let mut pending = false;
            for selector in &want.spec.using {
                if let Err(reason) = selector.validate() {
                    pending = true;
                    plan.diagnostics.push(WiringDiagnostic {
                        want: name.to_string(),
                        kind: FaultKind::Wiring,
                        selector: Some(selector.clone()),
                        message: format!("malformed selector {}: {}", selector, reason),
                    });
                    continue;
                }
                let hits: Vec<&str> = by_name
                    .iter()
                    .filter(|(other, w)| *other != name && selector.matches(&w.metadata.labels))
                    .map(|(other, _)| *other)
                    .collect();
                if hits.is_empty() {
                    pending = true;
                    plan.diagnostics.push(WiringDiagnostic {
                        want: name.to_string(),
                        kind: FaultKind::Wiring,
                        selector: Some(selector.clone()),
                        message: format!("no want matches selector {}", selector),
                    });
                }
                matched.extend(hits.into_iter().map(|s| s.to_string()));
            }
            if pending {
                plan.pending.insert(name.to_string());
            } else if !matched.is_empty() {
                raw.insert(name.to_string(), matched);
            }
        }

        let names: Vec<String> = by_name.keys().map(|s| s.to_string()).collect();
        let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (consumer, producers) in &raw {
            for producer in producers {
                downstream
                    .entry(producer.clone())
                    .or_default()
                    .insert(consumer.clone());
            }
        }

        plan.cycles = find_cycles(&names, &downstream);
        for cycle in &plan.cycles {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            let message = path.join(" -> ");
            for member in cycle {
                plan.diagnostics.push(WiringDiagnostic {
                    want: member.clone(),
                    kind: FaultKind::Cycle,
                    selector: None,
                    message: message.clone(),
                });
            }
        }

        // Everything downstream of a pending or cyclic want is blocked too.
        let mut blocked: BTreeSet<String> = plan.pending.clone();
        blocked.extend(plan.cycles.iter().flatten().cloned());
        let mut queue: VecDeque<String> = blocked.iter().cloned().collect();
        while let Some(node) = queue.pop_front() {
            if let Some(consumers) = downstream.get(&node) {
                for consumer in consumers {
                    if blocked.insert(consumer.clone()) {
                        plan.diagnostics.push(WiringDiagnostic {
                            want: consumer.clone(),
                            kind: FaultKind::Wiring,
                            selector: None,
                            message: format!("waiting on unresolved producer '{}'", node),
                        });
                        queue.push_back(consumer.clone());
                    }
                }
            }
        }
        plan.blocked = blocked;

        // Connect: keep edges towards ready consumers only.
        for (consumer, producers) in &raw {
            if plan.blocked.contains(consumer) {
                continue;
            }
            for producer in producers {
                plan.edges.insert(Edge {
                    producer: producer.clone(),
                    consumer: consumer.clone(),
                });
                plan.producers
                    .entry(consumer.clone())
                    .or_default()
                    .insert(producer.clone());
                plan.consumers
                    .entry(producer.clone())
                    .or_default()
                    .insert(consumer.clone());
            }
        }

        plan.start_order = plan.phases(&names);
        plan
    }

    /// Kahn layering of ready wants, each layer sorted by name
    fn phases(&self, names: &[String]) -> Vec<Vec<String>> {
        let ready: Vec<&String> = names.iter().filter(|n| !self.blocked.contains(*n)).collect();
        let mut indegree: BTreeMap<&str, usize> = ready
            .iter()
            .map(|n| (n.as_str(), self.producers.get(*n).map(|p| p.len()).unwrap_or(0)))
            .collect();

        let mut phases = Vec::new();
        let mut current: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.to_string())
            .collect();
        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for name in &current {
                indegree.remove(name.as_str());
                if let Some(consumers) = self.consumers.get(name) {
                    for consumer in consumers {
                        if let Some(d) = indegree.get_mut(consumer.as_str()) {
                            *d -= 1;
                            if *d == 0 {
                                next.insert(consumer.clone());
                            }
                        }
                    }
                }
            }
            phases.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }
        phases
    }

    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn producers_of(&self, name: &str) -> Vec<String> {
        self.producers
            .get(name)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumers_of(&self, name: &str) -> Vec<String> {
        self.consumers
            .get(name)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    /// Structurally startable (not pending, not cyclic, not downstream of either)
    pub fn is_ready(&self, name: &str) -> bool {
        !self.blocked.contains(name)
    }

    pub fn in_cycle(&self, name: &str) -> bool {
        self.cycles.iter().any(|c| c.iter().any(|m| m == name))
    }

    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn diagnostics(&self) -> &[WiringDiagnostic] {
        &self.diagnostics
    }

    pub fn start_order(&self) -> &[Vec<String>] {
        &self.start_order
    }

    /// Canonical edge listing; equal fingerprints mean identical wiring
    pub fn fingerprint(&self) -> String {
        self.edges
            .iter()
            .map(|e| format!("{}->{}", e.producer, e.consumer))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Strongly connected groups of size > 1, members sorted, groups sorted
fn find_cycles(
    names: &[String],
    downstream: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<Vec<String>> {
    let reach: BTreeMap<&String, BTreeSet<String>> = names
        .iter()
        .map(|n| (n, reachable(n, downstream)))
        .collect();

    let mut seen = BTreeSet::new();
    let mut cycles = Vec::new();
    for name in names {
        if seen.contains(name) || !reach[name].contains(name) {
            continue;
        }
        let group: Vec<String> = names
            .iter()
            .filter(|other| reach[name].contains(*other) && reach[*other].contains(name))
            .cloned()
            .collect();
        seen.extend(group.iter().cloned());
        cycles.push(group);
    }
    cycles
}

fn reachable(start: &str, downstream: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        if let Some(next) = downstream.get(node) {
            for n in next {
                if out.insert(n.clone()) {
                    queue.push_back(n.as_str());
                }
            }
        }
    }
    out
}
