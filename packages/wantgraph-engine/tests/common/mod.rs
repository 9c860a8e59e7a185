//! Want types and helpers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use wantgraph_engine::{
    Engine, EngineConfig, EngineError, Progressable, Result, RunContext, Want, WantStatus,
};

/// Sends `start..start+count` to every consumer, then records `emitted`
#[derive(Default)]
pub struct Numbers {
    sent: bool,
}

#[async_trait]
impl Progressable for Numbers {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.sent = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        let count: i64 = ctx.param_as("count")?;
        let start: i64 = ctx.param_as("start").unwrap_or(1);
        for n in start..start + count {
            ctx.send_value(n).await;
        }
        ctx.set_state("emitted", count)?;
        self.sent = true;
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.sent
    }
}

/// Drains its input; records `received`, `count` and `sum` once it closes
#[derive(Default)]
pub struct Collect {
    received: Vec<i64>,
    closed: bool,
}

#[async_trait]
impl Progressable for Collect {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.received.clear();
        self.closed = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        match ctx.recv_as::<i64>().await {
            Some(n) => self.received.push(n),
            None => {
                ctx.set_state("received", self.received.clone())?;
                ctx.set_state("count", self.received.len())?;
                ctx.set_state("sum", self.received.iter().sum::<i64>())?;
                self.closed = true;
            }
        }
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.closed
    }
}

/// Publishes its `status` parameter as `flight_status`
#[derive(Default)]
pub struct Flight {
    done: bool,
}

#[async_trait]
impl Progressable for Flight {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.done = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        let status: String = ctx.param_as("status")?;
        ctx.set_state("flight_status", status)?;
        self.done = true;
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.done
    }
}

/// Waits for a `flight_status` notification and summarises the latest one
#[derive(Default)]
pub struct Coordinator {
    done: bool,
}

#[async_trait]
impl Progressable for Coordinator {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.done = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        match ctx.latest_notification("flight", "flight_status") {
            Some(event) => {
                let value = event.value.as_str().unwrap_or("unknown").to_string();
                ctx.set_state("summary", format!("flight: {}", value))?;
                self.done = true;
            }
            None => {
                ctx.wait_for_change().await;
            }
        }
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.done
    }
}

/// Copies its `value` parameter into state
#[derive(Default)]
pub struct Leaf {
    done: bool,
}

#[async_trait]
impl Progressable for Leaf {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.done = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        let value = ctx.param("value").cloned().unwrap_or(serde_json::Value::Null);
        ctx.set_state("value", value)?;
        ctx.set_state("runs", ctx.generation())?;
        self.done = true;
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.done
    }
}

/// Fails with an execution fault while its `fail` parameter is true
pub struct Explode;

#[async_trait]
impl Progressable for Explode {
    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.param_as::<bool>("fail").unwrap_or(true) {
            return Err(EngineError::fault(ctx.name(), "reactor breach"));
        }
        ctx.set_state("stable", true)?;
        Ok(())
    }

    fn is_achieved(&self, ctx: &RunContext) -> bool {
        ctx.state("stable").is_some()
    }
}

pub struct Panicky;

#[async_trait]
impl Progressable for Panicky {
    async fn progress(&mut self, _ctx: &mut RunContext) -> Result<()> {
        panic!("step function blew up");
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        false
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        reconcile_interval_ms: 10,
        snapshot_interval_ms: 0,
        ..EngineConfig::default()
    }
}

pub fn register_test_types(engine: &Engine) {
    engine.register_type("numbers", |_| Ok(Box::new(Numbers::default())));
    engine.register_type("collect", |_| Ok(Box::new(Collect::default())));
    engine.register_type("flight", |_| Ok(Box::new(Flight::default())));
    engine.register_type("coordinator", |_| Ok(Box::new(Coordinator::default())));
    engine.register_type("leaf", |_| Ok(Box::new(Leaf::default())));
    engine.register_type("explode", |_| Ok(Box::new(Explode)));
    engine.register_type("panicky", |_| Ok(Box::new(Panicky)));
}

pub fn test_engine() -> Engine {
    let engine = Engine::new(test_config());
    register_test_types(&engine);
    engine
}

pub async fn add_all(engine: &Engine, wants: Vec<Want>) {
    let outcomes = engine.add_wants(wants).await;
    for outcome in outcomes {
        assert!(outcome.is_accepted(), "{:?}", outcome);
    }
}

/// Poll the want map until `pred` holds or `timeout` passes
pub async fn wait_until<F>(engine: &Engine, timeout: Duration, pred: F) -> bool
where
    F: Fn(&BTreeMap<String, Want>) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if pred(&engine.get_all_want_states()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn all_achieved(wants: &BTreeMap<String, Want>) -> bool {
    !wants.is_empty() && wants.values().all(|w| w.status == WantStatus::Achieved)
}

pub fn status(engine: &Engine, name: &str) -> WantStatus {
    engine
        .status_of(name)
        .unwrap_or_else(|| panic!("no want named {}", name))
}
