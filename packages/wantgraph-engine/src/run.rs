//! One run of one want
//!
//! A launched want becomes the end stage of its own chain. Its inputs (one
//! queue per producer, merged) feed the stage; its outputs are one queue per
//! consumer. [`RunContext`] is the only surface a want type sees: parameter
//! snapshot, state reads and writes, queues, children and notifications.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::chain::{message, Handoff, Inbox, Message, Outbox, Stage, StageFlow, StageIo};
use crate::engine::{EngineShared, RunEnd};
use crate::error::{EngineError, Result};
use crate::notification::NotificationEvent;
use crate::registry::Progressable;
use crate::want::WantStatus;

pub struct RunContext {
    shared: Arc<EngineShared>,
    name: String,
    generation: u64,
    params: BTreeMap<String, Value>,
    input: Option<Inbox>,
    outputs: Vec<(String, Outbox)>,
    cancel: CancellationToken,
    epoch: watch::Receiver<u64>,
    wait_timeout: Duration,
}

impl RunContext {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        name: String,
        generation: u64,
        params: BTreeMap<String, Value>,
        outputs: Vec<(String, Outbox)>,
        cancel: CancellationToken,
    ) -> Self {
        let epoch = shared.subscribe_epoch();
        let wait_timeout = shared.config.reconcile_interval();
        Self {
            shared,
            name,
            generation,
            params,
            input: None,
            outputs,
            cancel,
            epoch,
            wait_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run number of this want (1 for the first run)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Parameters as they were when this run started
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| EngineError::fault(&self.name, format!("missing parameter '{}'", key)))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            EngineError::fault(&self.name, format!("parameter '{}': {}", key, e))
        })
    }

    pub fn state(&self, key: &str) -> Option<Value> {
        self.shared.read_state(&self.name, key)
    }

    /// Read another want's state
    pub fn peer_state(&self, want: &str, key: &str) -> Option<Value> {
        self.shared.read_state(want, key)
    }

    /// Write a state key. Records history and notifies subscribers when the
    /// value actually changed.
    pub fn set_state(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.shared.write_state(&self.name, key, value.into())?;
        Ok(())
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Next message from any producer. `None` once every producer closed its
    /// queue, when there are no producers, or when the run is cancelled.
    pub async fn recv(&mut self) -> Option<Message> {
        let input = self.input.as_mut()?;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = input.recv() => msg,
        }
    }

    /// Typed receive; messages of another type are skipped
    pub async fn recv_as<T: Any + Send + Sync + Clone>(&mut self) -> Option<T> {
        while let Some(msg) = self.recv().await {
            if let Some(value) = msg.downcast_ref::<T>() {
                return Some(value.clone());
            }
        }
        None
    }

    /// Send to every consumer. Returns how many consumers took the message;
    /// consumers that went away are dropped from the output list.
    pub async fn send(&mut self, msg: Message) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (index, (_, tx)) in self.outputs.iter().enumerate() {
            let ok = tokio::select! {
                _ = self.cancel.cancelled() => false,
                sent = tx.send(Arc::clone(&msg)) => sent.is_ok(),
            };
            if ok {
                delivered += 1;
            } else if !self.cancel.is_cancelled() {
                gone.push(index);
            }
        }
        for index in gone.into_iter().rev() {
            self.outputs.remove(index);
        }
        delivered
    }

    pub async fn send_value<T: Any + Send + Sync>(&mut self, value: T) -> usize {
        self.send(message(value)).await
    }

    pub fn consumers(&self) -> Vec<String> {
        self.outputs.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Close every output queue early so consumers see end of input
    pub fn close_outputs(&mut self) {
        self.outputs.clear();
    }

    pub fn children(&self) -> Vec<(String, WantStatus)> {
        self.shared.children_of(&self.name)
    }

    /// Notifications delivered to this want, oldest first
    pub fn notifications(&self) -> Vec<NotificationEvent> {
        self.shared.inbox_of(&self.name)
    }

    /// Latest delivered value of `source.key`
    pub fn latest_notification(&self, source: &str, key: &str) -> Option<NotificationEvent> {
        self.notifications()
            .into_iter()
            .rev()
            .find(|e| e.source == source && e.key == key)
    }

    /// Wait until anything in the engine changes, at most one reconcile
    /// interval. Returns false on timeout or cancellation.
    pub async fn wait_for_change(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = self.epoch.changed() => changed.is_ok(),
            _ = tokio::time::sleep(self.wait_timeout) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Chain stage driving a [`Progressable`] through one run
pub(crate) struct WantStage {
    ctx: RunContext,
    progressable: Option<Box<dyn Progressable>>,
    reservation: Option<Handoff>,
    initialized: bool,
    finished: bool,
}

impl WantStage {
    pub(crate) fn new(
        ctx: RunContext,
        progressable: Box<dyn Progressable>,
        reservation: Option<Handoff>,
    ) -> Self {
        Self {
            ctx,
            progressable: Some(progressable),
            reservation,
            initialized: false,
            finished: false,
        }
    }

    fn try_complete(&mut self) -> bool {
        let done = self.ctx.shared.complete_run(
            &self.ctx.name,
            self.ctx.generation,
            &mut self.progressable,
        );
        if done {
            self.finish(None);
        }
        done
    }

    fn finish(&mut self, end: Option<RunEnd>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(end) = end {
            let progressable = self.progressable.take();
            self.ctx
                .shared
                .end_run(&self.ctx.name, self.ctx.generation, progressable, end);
        }
        self.ctx.close_outputs();
        self.ctx.input = None;
        self.reservation = None;
        self.ctx.shared.bump_epoch();
        self.ctx.shared.kick();
    }
}

#[async_trait]
impl Stage for WantStage {
    fn name(&self) -> &str {
        &self.ctx.name
    }

    async fn step(&mut self, io: &mut StageIo) -> Result<StageFlow> {
        if !self.initialized {
            self.initialized = true;
            self.ctx.input = io.inputs.pop();
            if let Some(progressable) = self.progressable.as_mut() {
                progressable.initialize(&mut self.ctx).await?;
            }
        }

        if self.ctx.is_cancelled() {
            self.finish(Some(RunEnd::Interrupted));
            return Ok(StageFlow::Done);
        }

        let Some(progressable) = self.progressable.as_mut() else {
            return Ok(StageFlow::Done);
        };
        progressable.progress(&mut self.ctx).await?;

        if progressable.is_achieved(&self.ctx) {
            if self.try_complete() {
                return Ok(StageFlow::Done);
            }
            // A child is still settling.
            self.ctx.wait_for_change().await;
        }
        Ok(StageFlow::Continue)
    }

    async fn abort(&mut self, reason: &str) {
        self.finish(Some(RunEnd::Failed(reason.to_string())));
    }
}

impl Drop for WantStage {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some(RunEnd::Interrupted));
        }
    }
}
