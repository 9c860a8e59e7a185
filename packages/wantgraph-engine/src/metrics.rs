//! Prometheus counters (feature `metrics`)
//!
//! Without the feature every recorder is a no-op, so call sites stay
//! unconditional.

#[cfg(feature = "metrics")]
mod enabled {
    use prometheus::{register_int_counter_with_registry, IntCounter, Opts, Registry};

    #[derive(Clone)]
    pub struct EngineMetrics {
        registry: Registry,
        pub runs_started: IntCounter,
        pub runs_achieved: IntCounter,
        pub runs_failed: IntCounter,
        pub notifications: IntCounter,
    }

    impl EngineMetrics {
        pub fn new() -> prometheus::Result<Self> {
            let registry = Registry::new();
            Ok(Self {
                runs_started: register_int_counter_with_registry!(
                    Opts::new("wantgraph_runs_started_total", "Want runs started"),
                    registry
                )?,
                runs_achieved: register_int_counter_with_registry!(
                    Opts::new("wantgraph_runs_achieved_total", "Want runs that achieved"),
                    registry
                )?,
                runs_failed: register_int_counter_with_registry!(
                    Opts::new("wantgraph_runs_failed_total", "Want runs that failed"),
                    registry
                )?,
                notifications: register_int_counter_with_registry!(
                    Opts::new(
                        "wantgraph_notifications_total",
                        "Notifications delivered to subscribers"
                    ),
                    registry
                )?,
                registry,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        pub fn run_started(&self) {
            self.runs_started.inc();
        }

        pub fn run_achieved(&self) {
            self.runs_achieved.inc();
        }

        pub fn run_failed(&self) {
            self.runs_failed.inc();
        }

        pub fn notified(&self, count: usize) {
            self.notifications.inc_by(count as u64);
        }
    }
}

#[cfg(feature = "metrics")]
pub use enabled::EngineMetrics;

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

#[cfg(not(feature = "metrics"))]
impl EngineMetrics {
    pub fn new() -> Result<Self, std::convert::Infallible> {
        Ok(Self)
    }

    pub fn run_started(&self) {}

    pub fn run_achieved(&self) {}

    pub fn run_failed(&self) {}

    pub fn notified(&self, _count: usize) {}
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.run_started();
        metrics.run_started();
        metrics.run_achieved();
        metrics.notified(3);
        assert_eq!(metrics.runs_started.get(), 2);
        assert_eq!(metrics.runs_achieved.get(), 1);
        assert_eq!(metrics.runs_failed.get(), 0);
        assert_eq!(metrics.notifications.get(), 3);
        assert_eq!(metrics.registry().gather().len(), 4);
    }
}
