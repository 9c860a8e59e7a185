//! Want lifecycle state machine
//!
//! ```text
//!            start            achieve
//!   Idle ──────────► Running ─────────► Achieved
//!    ▲  ▲               │ │                │
//!    │  └── requeue ────┘ │ fail           │ restart
//!    │                    ▼                │
//!    └──── reset ───── Failed              │
//!    ▲                                     │
//!    └─────────────────────────────────────┘
//! ```
//!
//! Every transition appends a `status` history entry. `restart` also appends
//! a `restart` entry carrying the reason, the generation being left and a copy
//! of the state at that moment, so each re-run of a want is distinguishable in
//! its history.

use crate::error::{EngineError, Result};
use crate::want::{HistoryKind, Want, WantStatus};
use serde_json::{json, Value};

/// Why an achieved want is being re-opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartReason {
    /// A parameter of this want (or of its owner) changed
    ParameterChange,
    /// A subscribed state key changed
    Retrigger,
    /// A producer started a new run and sent fresh input
    UpstreamRerun,
    /// A consumer needs this producer's output replayed
    ConsumerReplay,
    /// A child left the achieved state
    ChildReopened,
    /// Periodic `when` hint fired
    Scheduled,
    /// Requested through the engine API
    Explicit,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::ParameterChange => "parameter_change",
            RestartReason::Retrigger => "retrigger",
            RestartReason::UpstreamRerun => "upstream_rerun",
            RestartReason::ConsumerReplay => "consumer_replay",
            RestartReason::ChildReopened => "child_reopened",
            RestartReason::Scheduled => "scheduled",
            RestartReason::Explicit => "explicit",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transitions over a borrowed want
pub struct WantStateMachine<'a> {
    want: &'a mut Want,
    history_limit: usize,
}

impl<'a> WantStateMachine<'a> {
    pub fn new(want: &'a mut Want, history_limit: usize) -> Self {
        Self {
            want,
            history_limit,
        }
    }

    pub fn status(&self) -> WantStatus {
        self.want.status
    }

    fn invalid(&self, to: WantStatus) -> EngineError {
        EngineError::InvalidStateTransition {
            from: self.want.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    fn set(&mut self, to: WantStatus, detail: Value) {
        let from = self.want.status;
        self.want.status = to;
        let mut value = json!({ "status": to.as_str() });
        if let (Value::Object(map), Value::Object(extra)) = (&mut value, detail) {
            map.extend(extra);
        }
        self.want.record(
            HistoryKind::Status,
            "status",
            value,
            Some(json!({ "status": from.as_str() })),
            self.history_limit,
        );
    }

    /// Transition: IDLE → RUNNING
    pub fn start(&mut self) -> Result<u64> {
        match self.want.status {
            WantStatus::Idle => {
                self.want.run_generation += 1;
                let generation = self.want.run_generation;
                self.set(WantStatus::Running, json!({ "generation": generation }));
                Ok(generation)
            }
            _ => Err(self.invalid(WantStatus::Running)),
        }
    }

    /// Transition: RUNNING → ACHIEVED
    pub fn achieve(&mut self) -> Result<()> {
        match self.want.status {
            WantStatus::Running => {
                self.set(WantStatus::Achieved, json!({}));
                Ok(())
            }
            _ => Err(self.invalid(WantStatus::Achieved)),
        }
    }

    /// Transition: IDLE | RUNNING → FAILED
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        match self.want.status {
            WantStatus::Idle | WantStatus::Running => {
                self.set(WantStatus::Failed, json!({ "reason": reason }));
                Ok(())
            }
            _ => Err(self.invalid(WantStatus::Failed)),
        }
    }

    /// Transition: ACHIEVED → IDLE, with a versioned restart record
    pub fn restart(&mut self, reason: RestartReason) -> Result<()> {
        match self.want.status {
            WantStatus::Achieved => {
                let snapshot = json!({
                    "reason": reason.as_str(),
                    "generation": self.want.run_generation,
                    "state": self.want.state,
                });
                self.want.record(
                    HistoryKind::Restart,
                    "restart",
                    snapshot,
                    None,
                    self.history_limit,
                );
                self.set(WantStatus::Idle, json!({ "reason": reason.as_str() }));
                Ok(())
            }
            _ => Err(self.invalid(WantStatus::Idle)),
        }
    }

    /// Transition: RUNNING → IDLE (run ended but must go again, or was interrupted)
    pub fn requeue(&mut self, reason: &str) -> Result<()> {
        match self.want.status {
            WantStatus::Running => {
                self.set(WantStatus::Idle, json!({ "reason": reason }));
                Ok(())
            }
            _ => Err(self.invalid(WantStatus::Idle)),
        }
    }

    /// Transition: FAILED → IDLE
    pub fn reset(&mut self) -> Result<()> {
        match self.want.status {
            WantStatus::Failed => {
                self.set(WantStatus::Idle, json!({ "reason": "reset" }));
                Ok(())
            }
            _ => Err(self.invalid(WantStatus::Idle)),
        }
    }
}
