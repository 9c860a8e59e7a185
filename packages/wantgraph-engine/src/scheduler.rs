//! Periodic restarts from `when: [{every: ...}]` hints
//!
//! Each hint becomes one tokio interval task. A tick re-opens the want if it
//! is achieved; other states are left alone. Tasks hold only a weak handle to
//! the engine and stop on cancellation or when their want disappears.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigError, ConfigResult};
use crate::engine::EngineShared;
use crate::lifecycle::RestartReason;

/// Longest accepted interval
const MAX_EVERY: Duration = Duration::from_secs(366 * 24 * 3600);

/// Parse `250ms`, `30s`, `5m`, `1h` or bare seconds, up to a year
pub fn parse_every(raw: &str) -> ConfigResult<Duration> {
    let s = raw.trim();
    let invalid = || ConfigError::Invalid(format!("invalid interval '{}'", raw));

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }

    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
        "h" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    if duration > MAX_EVERY {
        return Err(invalid());
    }
    Ok(duration)
}

pub(crate) struct Scheduler {
    cancel: CancellationToken,
    tasks: Mutex<BTreeMap<String, Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn schedule(&self, engine: Weak<EngineShared>, want: &str, every: Duration) {
        let cancel = self.cancel.child_token();
        let name = want.to_string();
        info!("Scheduling '{}' every {:?}", name, every);

        let handle = tokio::spawn({
            let name = name.clone();
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(shared) = engine.upgrade() else { break };
                    if !shared.scheduled_restart(&name, RestartReason::Scheduled) {
                        debug!("Schedule for '{}' ended", name);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().entry(name).or_default().push(handle);
    }

    pub(crate) fn unschedule(&self, want: &str) {
        if let Some(handles) = self.tasks.lock().remove(want) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub(crate) fn scheduled(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.lock().clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
