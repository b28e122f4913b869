//! Process-wide observability context.
//!
//! Built once by the entry point and handed to every component that reports
//! health, metrics, or events. Nothing in the crate reaches for a global.

use crate::config::HealthConfig;
use crate::events::EventBus;
use crate::health::{self, HealthAggregator};
use crate::metrics::MetricsCollector;
use std::sync::Arc;

pub struct Telemetry {
    pub health: HealthAggregator,
    pub metrics: Arc<MetricsCollector>,
    pub events: EventBus,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry {
            health: HealthAggregator::new(),
            metrics: Arc::new(MetricsCollector::new()),
            events: EventBus::new(),
        }
    }

    /// Context with the built-in probes registered from `[health]`, plus a
    /// status probe for each long-running `components` entry in this process.
    pub fn from_config(cfg: &HealthConfig, components: &[&'static str]) -> Arc<Self> {
        let telemetry = Self::new();
        for (i, path) in cfg.disk_paths.iter().enumerate() {
            let name = if i == 0 {
                "disk".to_string()
            } else {
                format!("disk_{}", i)
            };
            telemetry.health.register_check(
                &name,
                health::disk_space_probe(path.clone(), cfg.disk_degraded_gb, cfg.disk_unhealthy_gb),
            );
        }
        telemetry.health.register_check(
            "queue",
            health::queue_backlog_probe(
                Arc::clone(&telemetry.metrics),
                cfg.backlog_degraded,
                cfg.backlog_unhealthy,
            ),
        );
        for &component in components {
            telemetry.health.register_check(
                component,
                health::component_status_probe(Arc::clone(&telemetry.metrics), component),
            );
        }
        Arc::new(telemetry)
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
