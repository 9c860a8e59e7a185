//! In-process notification bus
//!
//! One bus per engine. The engine publishes through it whenever a want's state
//! is written through the sanctioned path, so subscribers never see a change
//! that is not also in the want's history. Each delivery is recorded in a
//! bounded ring for inspection and mirrored on a broadcast feed for external
//! observers.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ring_buffer::RingBuffer;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A state key written by the want's step function
    State,
    /// A parameter changed through `update_parameter`
    Parameter,
    /// A child's status changed (sent to its owners)
    OwnerChild,
    /// The want's own status changed
    Status,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::State => "state",
            NotificationKind::Parameter => "parameter",
            NotificationKind::OwnerChild => "owner_child",
            NotificationKind::Status => "status",
        }
    }

    /// Only data changes may re-open an achieved subscriber
    pub fn can_retrigger(&self) -> bool {
        matches!(self, NotificationKind::State | NotificationKind::Parameter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFilter {
    All,
    Keys(BTreeSet<String>),
}

impl KeyFilter {
    pub fn from_keys(keys: &[String]) -> Self {
        if keys.is_empty() {
            KeyFilter::All
        } else {
            KeyFilter::Keys(keys.iter().cloned().collect())
        }
    }

    pub fn accepts(&self, key: &str) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Keys(keys) => keys.contains(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber: String,
    pub target: String,
    pub keys: KeyFilter,
    pub retrigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub name: String,
    pub subscriptions: usize,
    pub received: u64,
}

/// One event handed to one subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: NotificationEvent,
    /// Subscriber asked to be re-opened if achieved
    pub retrigger: bool,
}

pub struct NotificationBus {
    listeners: RwLock<BTreeMap<String, ListenerInfo>>,
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<RingBuffer<NotificationEvent>>,
    sequence: AtomicU64,
    feed: broadcast::Sender<NotificationEvent>,
}

impl NotificationBus {
    pub fn new(history_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            listeners: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(RingBuffer::new(history_capacity)),
            sequence: AtomicU64::new(0),
            feed,
        }
    }

    pub fn register_listener(&self, name: &str) {
        self.listeners
            .write()
            .entry(name.to_string())
            .or_insert_with(|| ListenerInfo {
                name: name.to_string(),
                subscriptions: 0,
                received: 0,
            });
    }

    /// Drop a listener together with every subscription it holds or is the target of
    pub fn unregister_listener(&self, name: &str) {
        self.listeners.write().remove(name);
        self.subscriptions
            .write()
            .retain(|s| s.subscriber != name && s.target != name);
        self.refresh_counts();
    }

    pub fn subscribe(
        &self,
        subscriber: &str,
        target: &str,
        keys: KeyFilter,
        retrigger: bool,
    ) {
        self.register_listener(subscriber);
        let sub = Subscription {
            subscriber: subscriber.to_string(),
            target: target.to_string(),
            keys,
            retrigger,
        };
        {
            let mut subs = self.subscriptions.write();
            if subs.contains(&sub) {
                return;
            }
            debug!(
                "Subscription: {} -> {} ({:?}, retrigger={})",
                subscriber, target, sub.keys, retrigger
            );
            subs.push(sub);
        }
        self.refresh_counts();
    }

    fn refresh_counts(&self) {
        let subs = self.subscriptions.read();
        let mut listeners = self.listeners.write();
        for info in listeners.values_mut() {
            info.subscriptions = subs.iter().filter(|s| s.subscriber == info.name).count();
        }
    }

    /// Fan a change of `source.key` out to every matching subscription
    pub fn publish(
        &self,
        source: &str,
        key: &str,
        value: &Value,
        previous: Option<&Value>,
        kind: NotificationKind,
    ) -> Vec<Delivery> {
        let matched: Vec<(String, bool)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.target == source && s.keys.accepts(key))
            .map(|s| (s.subscriber.clone(), s.retrigger && kind.can_retrigger()))
            .collect();

        matched
            .into_iter()
            .map(|(subscriber, retrigger)| Delivery {
                event: self.deliver(source, &subscriber, key, value, previous, kind),
                retrigger,
            })
            .collect()
    }

    /// Deliver directly to one target, bypassing subscriptions
    pub fn notify(
        &self,
        source: &str,
        target: &str,
        key: &str,
        value: &Value,
        kind: NotificationKind,
    ) -> NotificationEvent {
        self.deliver(source, target, key, value, None, kind)
    }

    fn deliver(
        &self,
        source: &str,
        target: &str,
        key: &str,
        value: &Value,
        previous: Option<&Value>,
        kind: NotificationKind,
    ) -> NotificationEvent {
        let event = NotificationEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            source: source.to_string(),
            target: target.to_string(),
            key: key.to_string(),
            value: value.clone(),
            previous: previous.cloned(),
            kind,
        };
        self.history.lock().push(event.clone());
        if let Some(info) = self.listeners.write().get_mut(target) {
            info.received += 1;
        }
        // No receivers is fine.
        let _ = self.feed.send(event.clone());
        event
    }

    pub fn registered_listeners(&self) -> Vec<ListenerInfo> {
        self.listeners.read().values().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.subscriber == subscriber)
            .cloned()
            .collect()
    }

    /// Most recent `limit` events, oldest first (`0` = everything retained)
    pub fn history(&self, limit: usize) -> Vec<NotificationEvent> {
        self.history.lock().snapshot(limit)
    }

    pub fn watch(&self) -> broadcast::Receiver<NotificationEvent> {
        self.feed.subscribe()
    }
}
