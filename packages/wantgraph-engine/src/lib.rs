/*
 * Wantgraph Engine - Declarative Dataflow Orchestration
 *
 * Wants declare what should hold; the engine wires them by label selectors,
 * runs them as concurrent pipeline stages and keeps re-converging as wants,
 * parameters and upstream data change.
 *
 * Architecture:
 * - Pipeline primitive with chained start/end barriers (chain)
 * - Want lifecycle state machine with versioned history (want, lifecycle)
 * - Selector wiring and cycle detection (selector, wiring)
 * - Reconciliation loop and run protocol (engine, run)
 * - Notification bus with retrigger (notification)
 * - Snapshot save/restore through wantgraph-store (persistence)
 */

//! ```rust,ignore
//! use wantgraph_engine::{Engine, EngineConfig, LabelSelector, Want};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.register_type("numbers", |_| Ok(Box::new(Numbers::default())));
//! engine.register_type("sum", |_| Ok(Box::new(Sum::default())));
//!
//! engine
//!     .add_wants(vec![
//!         Want::new("source", "numbers").with_label("role", "source").with_param("count", 5),
//!         Want::new("total", "sum").using(LabelSelector::from_pairs([("role", "source")])),
//!     ])
//!     .await;
//! engine.execute().await?;
//! ```

// Public modules
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod notification;
pub mod persistence;
pub mod registry;
pub mod ring_buffer;
pub mod run;
pub mod scheduler;
pub mod selector;
pub mod telemetry;
pub mod want;
pub mod wiring;

// Re-exports
pub use chain::{
    message, queue, Chain, ChainContext, Handoff, Inbox, MergeStage, Message, Outbox,
    SplitStage, Stage, StageFault, StageFlow, StageIo, DEFAULT_QUEUE_CAPACITY,
};
pub use config::{ConfigError, EngineConfig, WantDefinition, WantsConfig};
pub use engine::{AddOutcome, Engine, ReconcileReport, RestoreReport};
pub use error::{EngineError, FaultKind, Result};
pub use lifecycle::{RestartReason, WantStateMachine};
pub use metrics::EngineMetrics;
pub use notification::{
    KeyFilter, ListenerInfo, NotificationBus, NotificationEvent, NotificationKind, Subscription,
};
pub use persistence::{merge_snapshot, MergeOutcome};
pub use registry::{Progressable, TypeRegistry, OWNER_TYPE};
pub use run::RunContext;
pub use scheduler::parse_every;
pub use selector::{LabelRegistry, LabelSelector};
pub use telemetry::init_tracing;
pub use want::{HistoryEntry, HistoryKind, Metadata, OwnerReference, Want, WantSpec, WantStatus};
pub use wiring::{Edge, WiringDiagnostic, WiringPlan};

pub use wantgraph_store as store;
