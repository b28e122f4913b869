//! # Health — Named Probes with Worst-Status-Wins Aggregation
//!
//! A [`HealthAggregator`] holds a registry of named probe functions. Each probe
//! returns a [`HealthCheck`]; [`HealthAggregator::run_all`] executes every probe
//! and folds the results into an [`AggregatedHealth`]:
//!
//! | Inputs | Overall |
//! |--------|---------|
//! | any `unhealthy` | `unhealthy` |
//! | else any `degraded` | `degraded` |
//! | all `healthy` (non-empty) | `healthy` |
//! | empty, or `unknown` mixed in | `unknown` |
//!
//! A probe that returns `Err` or panics is recorded as `unhealthy` with the
//! failure as its message; it never takes the aggregator down.
//!
//! Built-in probes cover disk free space (`sysinfo::Disks`), queue backlog, and
//! the worker/watcher status strings held by [`MetricsCollector`].

use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        HealthCheck {
            name: name.into(),
            status,
            message: None,
            details: serde_json::Map::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// A registered probe. Returning `Err` is reported as `unhealthy`.
pub type Probe = Arc<dyn Fn() -> anyhow::Result<HealthCheck> + Send + Sync>;

#[derive(Default)]
struct Registry {
    probes: BTreeMap<String, Probe>,
    last: BTreeMap<String, HealthCheck>,
}

/// Registry of named probes guarded by a single mutex.
#[derive(Default)]
pub struct HealthAggregator {
    inner: Mutex<Registry>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the probe stored under `name`.
    pub fn register_check<F>(&self, name: &str, probe: F)
    where
        F: Fn() -> anyhow::Result<HealthCheck> + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .probes
            .insert(name.to_string(), Arc::new(probe));
    }

    pub fn unregister_check(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last.remove(name);
        inner.probes.remove(name).is_some()
    }

    pub fn check_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().probes.keys().cloned().collect()
    }

    /// Run a single probe; `None` if nothing is registered under `name`.
    pub fn run_check(&self, name: &str) -> Option<HealthCheck> {
        let probe = self.inner.lock().unwrap().probes.get(name).cloned()?;
        let result = run_probe(name, &probe);
        self.inner
            .lock()
            .unwrap()
            .last
            .insert(name.to_string(), result.clone());
        Some(result)
    }

    pub fn run_all(&self) -> AggregatedHealth {
        // Probes run outside the lock so a slow disk query never blocks registration.
        let probes: Vec<(String, Probe)> = self
            .inner
            .lock()
            .unwrap()
            .probes
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        let mut checks = BTreeMap::new();
        for (name, probe) in &probes {
            checks.insert(name.clone(), run_probe(name, probe));
        }

        let mut inner = self.inner.lock().unwrap();
        for (name, check) in &checks {
            inner.last.insert(name.clone(), check.clone());
        }
        AggregatedHealth {
            checks,
            checked_at: Utc::now(),
        }
    }

    pub fn last_result(&self, name: &str) -> Option<HealthCheck> {
        self.inner.lock().unwrap().last.get(name).cloned()
    }
}

fn run_probe(name: &str, probe: &Probe) -> HealthCheck {
    match catch_unwind(AssertUnwindSafe(|| probe())) {
        Ok(Ok(mut check)) => {
            check.name = name.to_string();
            check
        }
        Ok(Err(e)) => {
            warn!(check = name, error = %e, "health probe failed");
            HealthCheck::unhealthy(name, format!("check failed: {:#}", e))
        }
        Err(panic) => {
            let msg = panic_message(&panic);
            warn!(check = name, panic = %msg, "health probe panicked");
            HealthCheck::unhealthy(name, format!("check panicked: {}", msg))
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fold individual statuses into one.
pub fn aggregate_status<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    let statuses: Vec<HealthStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return HealthStatus::Unknown;
    }
    if statuses.contains(&HealthStatus::Unhealthy) {
        return HealthStatus::Unhealthy;
    }
    if statuses.contains(&HealthStatus::Degraded) {
        return HealthStatus::Degraded;
    }
    if statuses.iter().all(|s| *s == HealthStatus::Healthy) {
        return HealthStatus::Healthy;
    }
    HealthStatus::Unknown
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedHealth {
    pub checks: BTreeMap<String, HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

impl AggregatedHealth {
    pub fn overall_status(&self) -> HealthStatus {
        aggregate_status(self.checks.values().map(|c| c.status))
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status() == HealthStatus::Healthy
    }

    /// Ready to take work: healthy or degraded.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "overall_status": self.overall_status(),
            "is_healthy": self.is_healthy(),
            "is_ready": self.is_ready(),
            "checked_at": self.checked_at,
            "checks": self.checks,
        })
    }
}

// ── Built-in probes ─────────────────────────────────────────────

const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Free space in GiB on the filesystem holding `path` (longest mount-point match).
pub fn disk_free_gb(path: &Path) -> Option<f64> {
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / BYTES_PER_GB)
}

/// Classify a free-space reading against the two thresholds.
pub fn classify_free_space(free_gb: f64, degraded_gb: f64, unhealthy_gb: f64) -> HealthStatus {
    if free_gb < unhealthy_gb {
        HealthStatus::Unhealthy
    } else if free_gb < degraded_gb {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

pub fn disk_space_probe(
    path: PathBuf,
    degraded_gb: f64,
    unhealthy_gb: f64,
) -> impl Fn() -> anyhow::Result<HealthCheck> + Send + Sync + 'static {
    move || {
        let free = disk_free_gb(&path).ok_or_else(|| {
            anyhow::anyhow!("no mounted filesystem found for {}", path.display())
        })?;
        let status = classify_free_space(free, degraded_gb, unhealthy_gb);
        let mut check = HealthCheck::new("disk", status)
            .with_detail("path", path.display().to_string())
            .with_detail("free_gb", (free * 100.0).round() / 100.0);
        if status != HealthStatus::Healthy {
            check = check.with_message(format!(
                "{:.1} GB free on {} (threshold {:.1} GB)",
                free,
                path.display(),
                if status == HealthStatus::Unhealthy {
                    unhealthy_gb
                } else {
                    degraded_gb
                }
            ));
        }
        Ok(check)
    }
}

/// Degrades as the pending-task gauge grows past the thresholds.
pub fn queue_backlog_probe(
    metrics: Arc<MetricsCollector>,
    degraded_pending: i64,
    unhealthy_pending: i64,
) -> impl Fn() -> anyhow::Result<HealthCheck> + Send + Sync + 'static {
    move || {
        let pending = metrics.snapshot().queue_depth.get("pending").copied().unwrap_or(0);
        let check = if pending >= unhealthy_pending {
            HealthCheck::unhealthy("queue", format!("{} tasks pending", pending))
        } else if pending >= degraded_pending {
            HealthCheck::degraded("queue", format!("{} tasks pending", pending))
        } else {
            HealthCheck::healthy("queue")
        };
        Ok(check.with_detail("pending", pending))
    }
}

/// Maps a component's status string: `running`/`idle` healthy, `error`
/// unhealthy, `stopped` degraded, anything else unknown.
pub fn component_status_probe(
    metrics: Arc<MetricsCollector>,
    component: &'static str,
) -> impl Fn() -> anyhow::Result<HealthCheck> + Send + Sync + 'static {
    move || {
        let snap = metrics.snapshot();
        let status = match component {
            "worker" => snap.worker_status,
            "watcher" => snap.watcher_status,
            other => anyhow::bail!("unknown component '{}'", other),
        };
        let check = match status.as_str() {
            "running" | "idle" => HealthCheck::healthy(component),
            "stopped" => HealthCheck::degraded(component, format!("{} stopped", component)),
            "error" => HealthCheck::unhealthy(
                component,
                snap.last_error
                    .clone()
                    .unwrap_or_else(|| format!("{} reported an error", component)),
            ),
            _ => HealthCheck::new(component, HealthStatus::Unknown),
        };
        Ok(check.with_detail("status", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(status: HealthStatus) -> impl Fn() -> anyhow::Result<HealthCheck> + Send + Sync {
        move || Ok(HealthCheck::new("ignored", status))
    }

    #[test]
    fn empty_registry_is_unknown() {
        let agg = HealthAggregator::new();
        let result = agg.run_all();
        assert_eq!(result.overall_status(), HealthStatus::Unknown);
        assert!(!result.is_ready());
    }

    #[test]
    fn degraded_wins_over_healthy() {
        let agg = HealthAggregator::new();
        agg.register_check("queue", fixed(HealthStatus::Healthy));
        agg.register_check("disk", fixed(HealthStatus::Degraded));
        let result = agg.run_all();
        assert_eq!(result.overall_status(), HealthStatus::Degraded);
        assert!(result.is_ready());
        assert!(!result.is_healthy());
    }

    #[test]
    fn unhealthy_wins_over_everything() {
        let agg = HealthAggregator::new();
        agg.register_check("a", fixed(HealthStatus::Unhealthy));
        agg.register_check("b", fixed(HealthStatus::Healthy));
        agg.register_check("c", fixed(HealthStatus::Degraded));
        assert_eq!(agg.run_all().overall_status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn unknown_mixed_with_healthy_is_unknown() {
        assert_eq!(
            aggregate_status([HealthStatus::Healthy, HealthStatus::Unknown]),
            HealthStatus::Unknown
        );
        assert_eq!(
            aggregate_status([HealthStatus::Healthy, HealthStatus::Healthy]),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn failing_probe_becomes_unhealthy() {
        let agg = HealthAggregator::new();
        agg.register_check("db", || anyhow::bail!("connection refused"));
        let result = agg.run_all();
        let db = &result.checks["db"];
        assert_eq!(db.status, HealthStatus::Unhealthy);
        assert!(db.message.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn panicking_probe_becomes_unhealthy() {
        let agg = HealthAggregator::new();
        agg.register_check("boom", || panic!("probe exploded"));
        agg.register_check("ok", fixed(HealthStatus::Healthy));
        let result = agg.run_all();
        assert_eq!(result.checks["boom"].status, HealthStatus::Unhealthy);
        assert!(result.checks["boom"]
            .message
            .as_deref()
            .unwrap()
            .contains("probe exploded"));
        assert_eq!(result.checks["ok"].status, HealthStatus::Healthy);
    }

    #[test]
    fn results_take_registered_name_and_are_cached() {
        let agg = HealthAggregator::new();
        agg.register_check("disk", fixed(HealthStatus::Healthy));
        assert!(agg.last_result("disk").is_none());
        let check = agg.run_check("disk").unwrap();
        assert_eq!(check.name, "disk");
        assert_eq!(agg.last_result("disk").unwrap().status, HealthStatus::Healthy);
        assert!(agg.run_check("missing").is_none());
        assert!(agg.unregister_check("disk"));
        assert!(agg.last_result("disk").is_none());
        assert!(!agg.unregister_check("disk"));
    }

    #[test]
    fn free_space_thresholds() {
        assert_eq!(classify_free_space(500.0, 100.0, 10.0), HealthStatus::Healthy);
        assert_eq!(classify_free_space(50.0, 100.0, 10.0), HealthStatus::Degraded);
        assert_eq!(classify_free_space(5.0, 100.0, 10.0), HealthStatus::Unhealthy);
    }

    #[test]
    fn backlog_probe_reads_pending_gauge() {
        let metrics = Arc::new(MetricsCollector::new());
        let probe = queue_backlog_probe(Arc::clone(&metrics), 10, 100);
        assert_eq!(probe().unwrap().status, HealthStatus::Healthy);
        metrics.set_queue_depth("pending", 50);
        assert_eq!(probe().unwrap().status, HealthStatus::Degraded);
        metrics.set_queue_depth("pending", 100);
        assert_eq!(probe().unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn component_probe_maps_status_strings() {
        let metrics = Arc::new(MetricsCollector::new());
        let probe = component_status_probe(Arc::clone(&metrics), "worker");
        assert_eq!(probe().unwrap().status, HealthStatus::Unknown);
        metrics.set_worker_status("running");
        assert_eq!(probe().unwrap().status, HealthStatus::Healthy);
        metrics.record_error("executor crashed");
        metrics.set_worker_status("error");
        let check = probe().unwrap();
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.message.as_deref(), Some("executor crashed"));
    }

    #[test]
    fn to_json_reports_overall_and_checks() {
        let agg = HealthAggregator::new();
        agg.register_check("disk", fixed(HealthStatus::Degraded));
        let json = agg.run_all().to_json();
        assert_eq!(json["overall_status"], "degraded");
        assert_eq!(json["is_ready"], true);
        assert_eq!(json["checks"]["disk"]["status"], "degraded");
    }
}
