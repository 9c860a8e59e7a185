//! Want type registry
//!
//! Each engine owns its registry; there is no process-wide table. A factory
//! builds a fresh [`Progressable`] for one want when the want is added.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::run::RunContext;
use crate::want::{Want, WantStatus};

/// Behaviour of one want type
///
/// `progress` is called repeatedly while the want is running. After each
/// call the engine asks `is_achieved`; once it says yes (and every child of
/// the want is achieved) the run ends. Returning an error or panicking marks
/// the want failed.
#[async_trait]
pub trait Progressable: Send + Sync {
    /// Called once at the start of every run
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()>;

    fn is_achieved(&self, ctx: &RunContext) -> bool;
}

pub type Factory = Arc<dyn Fn(&Want) -> Result<Box<dyn Progressable>> + Send + Sync>;

pub const OWNER_TYPE: &str = "owner";

pub struct TypeRegistry {
    factories: DashMap<String, Factory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry preloaded with the `owner` aggregation type
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(OWNER_TYPE, |_| Ok(Box::new(OwnerWant::default())));
        registry
    }

    /// Register (or replace) a factory for `want_type`
    pub fn register<F>(&self, want_type: impl Into<String>, factory: F)
    where
        F: Fn(&Want) -> Result<Box<dyn Progressable>> + Send + Sync + 'static,
    {
        let want_type = want_type.into();
        debug!("Registered want type '{}'", want_type);
        self.factories.insert(want_type, Arc::new(factory));
    }

    pub fn create(&self, want: &Want) -> Result<Box<dyn Progressable>> {
        let factory = self
            .factories
            .get(want.want_type())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| EngineError::UnknownType(want.want_type().to_string()))?;
        factory(want)
    }

    pub fn contains(&self, want_type: &str) -> bool {
        self.factories.contains_key(want_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Achieved once every child is achieved; fails as soon as one child fails
#[derive(Debug, Default)]
pub struct OwnerWant {
    settled: bool,
}

#[async_trait]
impl Progressable for OwnerWant {
    async fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.settled = false;
        Ok(())
    }

    async fn progress(&mut self, ctx: &mut RunContext) -> Result<()> {
        self.settled = false;
        let children = ctx.children();

        if let Some((child, _)) = children.iter().find(|(_, s)| *s == WantStatus::Failed) {
            return Err(EngineError::fault(
                ctx.name(),
                format!("child '{}' failed", child),
            ));
        }

        let achieved = children
            .iter()
            .filter(|(_, s)| *s == WantStatus::Achieved)
            .count();
        if achieved == children.len() {
            ctx.set_state("achieved_children", achieved)?;
            ctx.set_state("total_children", children.len())?;
            self.settled = true;
        } else {
            ctx.wait_for_change().await;
        }
        Ok(())
    }

    fn is_achieved(&self, _ctx: &RunContext) -> bool {
        self.settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Progressable for Noop {
        async fn progress(&mut self, _ctx: &mut RunContext) -> Result<()> {
            Ok(())
        }

        fn is_achieved(&self, _ctx: &RunContext) -> bool {
            true
        }
    }

    #[test]
    fn test_builtin_owner_registered() {
        let registry = TypeRegistry::with_builtins();
        assert!(registry.contains(OWNER_TYPE));
        assert!(registry.create(&Want::new("trip", OWNER_TYPE)).is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::new();
        match registry.create(&Want::new("x", "mystery")) {
            Err(EngineError::UnknownType(t)) => assert_eq!(t, "mystery"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = TypeRegistry::with_builtins();
        registry.register("noop", |_| Ok(Box::new(Noop)));
        assert_eq!(registry.types(), vec!["noop", "owner"]);
    }

    #[test]
    fn test_factory_sees_want() {
        let registry = TypeRegistry::new();
        registry.register("checked", |want: &Want| {
            if want.spec.params.contains_key("required") {
                Ok(Box::new(Noop) as Box<dyn Progressable>)
            } else {
                Err(EngineError::fault(want.name(), "missing 'required' param"))
            }
        });
        assert!(registry.create(&Want::new("a", "checked")).is_err());
        assert!(registry
            .create(&Want::new("b", "checked").with_param("required", true))
            .is_ok());
    }
}
