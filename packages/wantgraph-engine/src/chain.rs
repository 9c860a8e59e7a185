//! Runtime-mutable message pipeline
//!
//! A [`Chain`] is a sequence of stages connected by bounded queues. Stages run
//! as independent tokio tasks and can be spliced into a context while
//! [`ChainContext::run`] is already waiting.
//!
//! Start and stop are coordinated by two *barrier sequences* instead of a
//! shared counter. Each `start`/`end` swaps the sequence's single-slot tail for
//! a fresh one and keeps the old slot as its predecessor. The resulting
//! [`Handoff`] waits for the predecessor and then signals its own slot, so the
//! links form a relay: `run` opens the first slot and waits on the last. A
//! chain spliced in while `run` is blocked extends the relay, and `run` notices
//! because the link count moved while it waited.
//!
//! Closing a queue (dropping every sender) is the only cancellation signal.
//! A stage sees `None` from `recv` and is expected to return
//! [`StageFlow::Done`].
//!
//! ```rust,ignore
//! let ctx = ChainContext::new(DEFAULT_QUEUE_CAPACITY);
//! let mut chain = Chain::new(&ctx);
//! chain.start(numbers).add(double).end(collect);
//! ctx.run().await;
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::select_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::Result;

/// Opaque value moved between stages
pub type Message = Arc<dyn Any + Send + Sync>;
pub type Inbox = mpsc::Receiver<Message>;
pub type Outbox = mpsc::Sender<Message>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

pub fn message<T: Any + Send + Sync>(value: T) -> Message {
    Arc::new(value)
}

/// Bounded queue between one producer output and one consumer input
pub fn queue(capacity: usize) -> (Outbox, Inbox) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    Done,
}

/// Queues owned by one running stage
#[derive(Default)]
pub struct StageIo {
    pub inputs: Vec<Inbox>,
    pub outputs: Vec<Outbox>,
}

impl StageIo {
    pub async fn recv(&mut self, index: usize) -> Option<Message> {
        match self.inputs.get_mut(index) {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Returns false when the output does not exist or its consumer is gone
    pub async fn send(&self, index: usize, msg: Message) -> bool {
        match self.outputs.get(index) {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }
}

/// One step of a stage loop
///
/// `step` is called until it returns [`StageFlow::Done`] or an error. An
/// error or a panic is fatal to the chain: the fault is recorded on the
/// context, `abort` is called, and the stage's queues are closed.
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &str {
        "stage"
    }

    async fn step(&mut self, io: &mut StageIo) -> Result<StageFlow>;

    async fn abort(&mut self, _reason: &str) {}
}

/// A stage that terminated abnormally
#[derive(Debug, Clone)]
pub struct StageFault {
    pub stage: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Barrier sequence
// ═══════════════════════════════════════════════════════════════════════════

/// One link of a barrier relay
///
/// Dropping an unpassed handoff still forwards the baton (on a spawned task)
/// so a lost link never wedges the links behind it.
pub struct Handoff {
    prev: Option<oneshot::Receiver<()>>,
    next: Option<oneshot::Sender<()>>,
    position: u64,
}

impl Handoff {
    /// Number of links spliced up to and including this one
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Wait for the predecessor, then release the successor
    pub async fn pass(mut self) {
        if let Some(prev) = self.prev.take() {
            // A dropped predecessor counts as passed.
            let _ = prev.await;
        }
        if let Some(next) = self.next.take() {
            let _ = next.send(());
        }
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        let (prev, next) = match (self.prev.take(), self.next.take()) {
            (Some(prev), Some(next)) => (prev, next),
            _ => return,
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = prev.await;
                let _ = next.send(());
            });
        }
    }
}

struct BarrierSequence {
    tail: Mutex<oneshot::Receiver<()>>,
    head: Mutex<Option<oneshot::Sender<()>>>,
    links: AtomicU64,
}

impl BarrierSequence {
    fn new() -> Self {
        let (head, tail) = oneshot::channel();
        Self {
            tail: Mutex::new(tail),
            head: Mutex::new(Some(head)),
            links: AtomicU64::new(0),
        }
    }

    /// Swap in a fresh tail slot; the previous one becomes our predecessor.
    /// The lock covers a single pointer swap, never a stage's lifetime.
    /// The count moves under the same lock, so positions follow relay order.
    fn splice(&self) -> Handoff {
        let (next, next_tail) = oneshot::channel();
        let mut tail = self.tail.lock();
        let prev = std::mem::replace(&mut *tail, next_tail);
        let position = self.links.fetch_add(1, Ordering::SeqCst) + 1;
        drop(tail);
        Handoff {
            prev: Some(prev),
            next: Some(next),
            position,
        }
    }

    fn open(&self) -> bool {
        match self.head.lock().take() {
            Some(head) => {
                let _ = head.send(());
                true
            }
            None => false,
        }
    }

    fn is_open(&self) -> bool {
        self.head.lock().is_none()
    }

    fn links(&self) -> u64 {
        self.links.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain context
// ═══════════════════════════════════════════════════════════════════════════

/// Barrier state shared by every chain of one engine
pub struct ChainContext {
    start: BarrierSequence,
    end: BarrierSequence,
    capacity: usize,
    faults: Mutex<Vec<StageFault>>,
    active: AtomicUsize,
}

impl ChainContext {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            start: BarrierSequence::new(),
            end: BarrierSequence::new(),
            capacity: capacity.max(1),
            faults: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    /// Release the start cascade. Idempotent.
    pub fn open(&self) {
        if self.start.open() {
            debug!("Chain start barrier opened");
        }
        self.end.open();
    }

    pub fn is_open(&self) -> bool {
        self.start.is_open()
    }

    /// Open the barriers and block until every ended chain has terminated,
    /// including chains spliced in while this call was waiting.
    pub async fn run(&self) {
        self.open();
        loop {
            let link = self.end.splice();
            let mark = link.position();
            link.pass().await;
            if self.end.links() == mark {
                break;
            }
        }
    }

    /// Reserve a link in the end relay without a stage attached.
    /// `run` cannot return until the returned handoff is passed or dropped.
    pub fn reserve(&self) -> Handoff {
        self.end.splice()
    }

    pub fn faults(&self) -> Vec<StageFault> {
        self.faults.lock().clone()
    }

    /// Stage tasks spawned and not yet finished
    pub fn active_stages(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn record_fault(&self, stage: &str, reason: &str) {
        error!("Stage '{}' terminated abnormally: {}", stage, reason);
        self.faults.lock().push(StageFault {
            stage: stage.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    fn spawn_stage(
        self: &Arc<Self>,
        mut stage: Box<dyn Stage>,
        mut io: StageIo,
        gates: Vec<Handoff>,
        end: Option<Handoff>,
    ) {
        let ctx = Arc::clone(self);
        ctx.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            for gate in gates {
                gate.pass().await;
            }

            loop {
                let outcome = AssertUnwindSafe(stage.step(&mut io)).catch_unwind().await;
                match outcome {
                    Ok(Ok(StageFlow::Continue)) => tokio::task::yield_now().await,
                    Ok(Ok(StageFlow::Done)) => break,
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        ctx.record_fault(stage.name(), &reason);
                        stage.abort(&reason).await;
                        break;
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        ctx.record_fault(stage.name(), &reason);
                        stage.abort(&reason).await;
                        break;
                    }
                }
            }

            // Close our queues before releasing the end relay.
            drop(io);
            drop(stage);
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(end) = end {
                end.pass().await;
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain
// ═══════════════════════════════════════════════════════════════════════════

/// Builder for one linear sequence of stages
///
/// The chain only tracks its current tail queue. Stages are spawned as soon as
/// they are added; they wait on the start barrier before their first step.
pub struct Chain {
    ctx: Arc<ChainContext>,
    label: String,
    tail: Option<Inbox>,
    gates: Vec<Handoff>,
}

impl Chain {
    pub fn new(ctx: &Arc<ChainContext>) -> Self {
        Self::named(ctx, "chain")
    }

    pub fn named(ctx: &Arc<ChainContext>, label: impl Into<String>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            label: label.into(),
            tail: None,
            gates: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True while the chain has an unconsumed tail queue
    pub fn is_open(&self) -> bool {
        self.tail.is_some()
    }

    /// First stage of a new chain. Ignored if the chain is already started.
    pub fn start<S: Stage + 'static>(&mut self, stage: S) -> &mut Self {
        self.start_boxed(Box::new(stage))
    }

    fn start_boxed(&mut self, stage: Box<dyn Stage>) -> &mut Self {
        if self.tail.is_some() {
            debug!("Chain '{}' already started; start ignored", self.label);
            return self;
        }
        let (tx, rx) = queue(self.ctx.capacity);
        self.tail = Some(rx);
        let mut gates = std::mem::take(&mut self.gates);
        gates.push(self.ctx.start.splice());
        self.ctx.spawn_stage(
            stage,
            StageIo {
                inputs: Vec::new(),
                outputs: vec![tx],
            },
            gates,
            None,
        );
        self
    }

    /// Adopt a queue fed from outside the chain as its tail.
    /// The next stage added still waits on the start barrier.
    pub fn attach(&mut self, inbox: Inbox) -> &mut Self {
        if self.tail.is_some() {
            debug!("Chain '{}' already has a tail; attach ignored", self.label);
            return self;
        }
        self.gates.push(self.ctx.start.splice());
        self.tail = Some(inbox);
        self
    }

    /// Append a stage after the tail. On an empty chain this is `start`.
    pub fn add<S: Stage + 'static>(&mut self, stage: S) -> &mut Self {
        self.add_boxed(Box::new(stage))
    }

    fn add_boxed(&mut self, stage: Box<dyn Stage>) -> &mut Self {
        let input = match self.tail.take() {
            Some(input) => input,
            None => return self.start_boxed(stage),
        };
        let (tx, rx) = queue(self.ctx.capacity);
        self.tail = Some(rx);
        let gates = std::mem::take(&mut self.gates);
        self.ctx.spawn_stage(
            stage,
            StageIo {
                inputs: vec![input],
                outputs: vec![tx],
            },
            gates,
            None,
        );
        self
    }

    /// Terminate the chain with a sink stage that joins the end relay.
    ///
    /// On an empty chain the stage runs alone with no queues and joins both
    /// relays, which is how a want with no inputs is scheduled.
    pub fn end<S: Stage + 'static>(&mut self, stage: S) {
        self.end_boxed(Box::new(stage))
    }

    pub fn end_boxed(&mut self, stage: Box<dyn Stage>) {
        let mut gates = std::mem::take(&mut self.gates);
        let inputs = match self.tail.take() {
            Some(input) => vec![input],
            None => {
                gates.push(self.ctx.start.splice());
                Vec::new()
            }
        };
        let end = self.ctx.end.splice();
        self.ctx.spawn_stage(
            stage,
            StageIo {
                inputs,
                outputs: Vec::new(),
            },
            gates,
            Some(end),
        );
    }

    /// Fan `other` into this chain. `combine` receives both tails as inputs
    /// and one output; the default forwards whatever arrives first.
    pub fn merge(&mut self, mut other: Chain, combine: Option<Box<dyn Stage>>) -> &mut Self {
        let mut gates = std::mem::take(&mut self.gates);
        gates.append(&mut other.gates);
        let inputs: Vec<Inbox> = [self.tail.take(), other.tail.take()]
            .into_iter()
            .flatten()
            .collect();
        if inputs.is_empty() {
            self.gates = gates;
            return self;
        }

        let combine = combine.unwrap_or_else(|| Box::new(MergeStage::default()));
        let (tx, rx) = queue(self.ctx.capacity);
        self.tail = Some(rx);
        self.ctx.spawn_stage(
            combine,
            StageIo {
                inputs,
                outputs: vec![tx],
            },
            gates,
            None,
        );
        self
    }

    /// Duplicate the tail onto a second chain. `split` receives one input and
    /// two outputs (this chain first, the branch second); the default
    /// broadcasts every message to both.
    pub fn split(&mut self, split: Option<Box<dyn Stage>>) -> Chain {
        let split = split.unwrap_or_else(|| Box::new(SplitStage));
        let mut gates = std::mem::take(&mut self.gates);
        let inputs = match self.tail.take() {
            Some(input) => vec![input],
            None => {
                gates.push(self.ctx.start.splice());
                Vec::new()
            }
        };

        let (tx, rx) = queue(self.ctx.capacity);
        let (branch_tx, branch_rx) = queue(self.ctx.capacity);
        self.tail = Some(rx);

        let mut branch = Chain::named(&self.ctx, format!("{}/split", self.label));
        branch.tail = Some(branch_rx);

        self.ctx.spawn_stage(
            split,
            StageIo {
                inputs,
                outputs: vec![tx, branch_tx],
            },
            gates,
            None,
        );
        branch
    }

    /// Hand the tail queue to the caller, leaving the chain empty
    pub fn take_tail(&mut self) -> Option<Inbox> {
        self.tail.take()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in stages
// ═══════════════════════════════════════════════════════════════════════════

/// Forwards from any number of inputs to output 0 until all inputs close.
/// The polling order rotates each step; no stronger fairness is promised.
#[derive(Default)]
pub struct MergeStage {
    cursor: usize,
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &str {
        "merge"
    }

    async fn step(&mut self, io: &mut StageIo) -> Result<StageFlow> {
        let count = io.inputs.len();
        if count == 0 {
            return Ok(StageFlow::Done);
        }
        let offset = self.cursor % count;
        self.cursor = self.cursor.wrapping_add(1);

        let (received, position) = {
            let (head, tail) = io.inputs.split_at_mut(offset);
            let futures: Vec<_> = tail
                .iter_mut()
                .chain(head.iter_mut())
                .map(|rx| Box::pin(rx.recv()))
                .collect();
            let (received, position, _rest) = select_all(futures).await;
            (received, position)
        };
        let index = (position + offset) % count;

        match received {
            Some(msg) => {
                if !io.send(0, msg).await {
                    return Ok(StageFlow::Done);
                }
            }
            None => {
                io.inputs.remove(index);
                if io.inputs.is_empty() {
                    return Ok(StageFlow::Done);
                }
            }
        }
        Ok(StageFlow::Continue)
    }
}

/// Copies every message from input 0 to all outputs
pub struct SplitStage;

#[async_trait]
impl Stage for SplitStage {
    fn name(&self) -> &str {
        "split"
    }

    async fn step(&mut self, io: &mut StageIo) -> Result<StageFlow> {
        let msg = match io.recv(0).await {
            Some(msg) => msg,
            None => return Ok(StageFlow::Done),
        };
        let mut delivered = 0;
        for tx in &io.outputs {
            if tx.send(Arc::clone(&msg)).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Ok(StageFlow::Done);
        }
        Ok(StageFlow::Continue)
    }
}
