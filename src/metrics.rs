//! # Metrics — Pipeline Counters, Gauges, and Processing-Time Window
//!
//! Operational metrics for the ingest/dispatch pipeline, exposed in the
//! Prometheus text exposition format for scraping.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `subband_groups_processed_total` | Counter | - | Tasks completed successfully |
//! | `subband_groups_failed_total` | Counter | - | Tasks resolved as failed |
//! | `subband_groups_retried_total` | Counter | - | Executor retries after a retryable error |
//! | `subband_store_errors_total` | Counter | - | Store operations that failed after retry |
//! | `subband_queue_depth` | Gauge | `state` | Tasks per status across all queues |
//! | `subband_groups` | Gauge | `state` | Observation groups per state |
//! | `subband_disk_free_gb` | Gauge | `path` | Free space on monitored volumes |
//! | `subband_processing_time_seconds` | Gauge | - | Last task processing time |
//! | `subband_processing_time_avg_seconds` | Gauge | - | Mean over the rolling window |
//! | `subband_component_status` | Gauge | `component`, `status` | 1 for each component's current status |
//!
//! ## Rolling window
//!
//! The last [`PROCESSING_WINDOW`] processing-time samples are kept in a
//! mutex-guarded buffer alongside the free-text status fields; the registry
//! itself is lock-free atomics.

use chrono::{DateTime, Utc};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;
use tracing::warn;

/// Capacity of the processing-time window.
pub const PROCESSING_WINDOW: usize = 100;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StateLabel {
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct PathLabel {
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ComponentLabel {
    pub component: String,
    pub status: String,
}

struct Window {
    samples: VecDeque<f64>,
    last_processing_time: f64,
    last_group_completed_at: Option<DateTime<Utc>>,
    queue_depth: BTreeMap<String, i64>,
    group_counts: BTreeMap<String, i64>,
    disk_free_gb: BTreeMap<String, f64>,
    worker_status: String,
    watcher_status: String,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

impl Default for Window {
    fn default() -> Self {
        Window {
            samples: VecDeque::with_capacity(PROCESSING_WINDOW),
            last_processing_time: 0.0,
            last_group_completed_at: None,
            queue_depth: BTreeMap::new(),
            group_counts: BTreeMap::new(),
            disk_free_gb: BTreeMap::new(),
            worker_status: "unknown".to_string(),
            watcher_status: "unknown".to_string(),
            last_error: None,
            last_error_at: None,
        }
    }
}

impl Window {
    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub groups_processed: u64,
    pub groups_failed: u64,
    pub groups_retried: u64,
    pub store_errors: u64,
    pub queue_depth: BTreeMap<String, i64>,
    pub group_counts: BTreeMap<String, i64>,
    pub disk_free_gb: BTreeMap<String, f64>,
    pub last_processing_time: f64,
    pub avg_processing_time: f64,
    pub processing_samples: usize,
    pub last_group_completed_at: Option<DateTime<Utc>>,
    pub worker_status: String,
    pub watcher_status: String,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Thread-safe metrics registry for one pipeline process.
pub struct MetricsCollector {
    registry: Registry,
    groups_processed: Counter,
    groups_failed: Counter,
    groups_retried: Counter,
    store_errors: Counter,
    queue_depth: Family<StateLabel, Gauge>,
    group_counts: Family<StateLabel, Gauge>,
    disk_free_gb: Family<PathLabel, Gauge<f64, AtomicU64>>,
    processing_time_last: Gauge<f64, AtomicU64>,
    processing_time_avg: Gauge<f64, AtomicU64>,
    component_status: Family<ComponentLabel, Gauge>,
    window: Mutex<Window>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let groups_processed = Counter::default();
        registry.register(
            "subband_groups_processed",
            "Total tasks completed successfully",
            groups_processed.clone(),
        );

        let groups_failed = Counter::default();
        registry.register(
            "subband_groups_failed",
            "Total tasks resolved as failed",
            groups_failed.clone(),
        );

        let groups_retried = Counter::default();
        registry.register(
            "subband_groups_retried",
            "Total executor retries after a retryable error",
            groups_retried.clone(),
        );

        let store_errors = Counter::default();
        registry.register(
            "subband_store_errors",
            "Total store operations that failed after retry",
            store_errors.clone(),
        );

        let queue_depth = Family::<StateLabel, Gauge>::default();
        registry.register(
            "subband_queue_depth",
            "Number of tasks per status",
            queue_depth.clone(),
        );

        let group_counts = Family::<StateLabel, Gauge>::default();
        registry.register(
            "subband_groups",
            "Number of observation groups per state",
            group_counts.clone(),
        );

        let disk_free_gb = Family::<PathLabel, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "subband_disk_free_gb",
            "Free disk space in GB",
            disk_free_gb.clone(),
        );

        let processing_time_last = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "subband_processing_time_seconds",
            "Last task processing time",
            processing_time_last.clone(),
        );

        let processing_time_avg = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "subband_processing_time_avg_seconds",
            "Mean processing time over the rolling window",
            processing_time_avg.clone(),
        );

        let component_status = Family::<ComponentLabel, Gauge>::default();
        registry.register(
            "subband_component_status",
            "Current status of each pipeline component",
            component_status.clone(),
        );

        let metrics = Self {
            registry,
            groups_processed,
            groups_failed,
            groups_retried,
            store_errors,
            queue_depth,
            group_counts,
            disk_free_gb,
            processing_time_last,
            processing_time_avg,
            component_status,
            window: Mutex::new(Window::default()),
        };
        metrics.publish_status("worker", None, "unknown");
        metrics.publish_status("watcher", None, "unknown");
        metrics
    }

    pub fn increment_processed(&self) {
        self.groups_processed.inc();
        self.window.lock().unwrap().last_group_completed_at = Some(Utc::now());
    }

    pub fn increment_failed(&self) {
        self.groups_failed.inc();
    }

    pub fn increment_retried(&self) {
        self.groups_retried.inc();
    }

    pub fn increment_store_errors(&self) {
        self.store_errors.inc();
    }

    pub fn record_processing_time(&self, seconds: f64) {
        let avg = {
            let mut w = self.window.lock().unwrap();
            w.last_processing_time = seconds;
            if w.samples.len() >= PROCESSING_WINDOW {
                w.samples.pop_front();
            }
            w.samples.push_back(seconds);
            w.average()
        };
        self.processing_time_last.set(seconds);
        self.processing_time_avg.set(avg);
    }

    pub fn set_queue_depth(&self, state: &str, count: i64) {
        self.window
            .lock()
            .unwrap()
            .queue_depth
            .insert(state.to_string(), count);
        self.queue_depth
            .get_or_create(&StateLabel {
                state: state.to_string(),
            })
            .set(count);
    }

    pub fn set_group_count(&self, state: &str, count: i64) {
        self.window
            .lock()
            .unwrap()
            .group_counts
            .insert(state.to_string(), count);
        self.group_counts
            .get_or_create(&StateLabel {
                state: state.to_string(),
            })
            .set(count);
    }

    pub fn set_disk_free(&self, path: &str, free_gb: f64) {
        self.window
            .lock()
            .unwrap()
            .disk_free_gb
            .insert(path.to_string(), free_gb);
        self.disk_free_gb
            .get_or_create(&PathLabel {
                path: path.to_string(),
            })
            .set(free_gb);
    }

    pub fn set_worker_status(&self, status: &str) {
        let mut w = self.window.lock().unwrap();
        let previous = std::mem::replace(&mut w.worker_status, status.to_string());
        self.publish_status("worker", Some(&previous), status);
    }

    pub fn set_watcher_status(&self, status: &str) {
        let mut w = self.window.lock().unwrap();
        let previous = std::mem::replace(&mut w.watcher_status, status.to_string());
        self.publish_status("watcher", Some(&previous), status);
    }

    pub fn record_error(&self, error: &str) {
        let mut w = self.window.lock().unwrap();
        w.last_error = Some(error.to_string());
        w.last_error_at = Some(Utc::now());
    }

    /// Callers hold the window lock so the label swap and the stored status
    /// change together.
    fn publish_status(&self, component: &str, previous: Option<&str>, status: &str) {
        if let Some(prev) = previous {
            if prev != status {
                self.component_status.remove(&ComponentLabel {
                    component: component.to_string(),
                    status: prev.to_string(),
                });
            }
        }
        self.component_status
            .get_or_create(&ComponentLabel {
                component: component.to_string(),
                status: status.to_string(),
            })
            .set(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let w = self.window.lock().unwrap();
        MetricsSnapshot {
            groups_processed: self.groups_processed.get(),
            groups_failed: self.groups_failed.get(),
            groups_retried: self.groups_retried.get(),
            store_errors: self.store_errors.get(),
            queue_depth: w.queue_depth.clone(),
            group_counts: w.group_counts.clone(),
            disk_free_gb: w.disk_free_gb.clone(),
            last_processing_time: w.last_processing_time,
            avg_processing_time: w.average(),
            processing_samples: w.samples.len(),
            last_group_completed_at: w.last_group_completed_at,
            worker_status: w.worker_status.clone(),
            watcher_status: w.watcher_status.clone(),
            last_error: w.last_error.clone(),
            last_error_at: w.last_error_at,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            warn!(error = %e, "metrics encoding failed");
        }
        buf
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn encode_includes_counters_and_gauges() {
        let m = MetricsCollector::new();
        m.increment_processed();
        m.increment_processed();
        m.increment_failed();
        m.set_queue_depth("pending", 7);
        m.record_processing_time(12.5);

        let output = m.encode();
        assert!(output.contains("# TYPE subband_groups_processed counter"));
        assert!(output.contains("subband_groups_processed_total 2"));
        assert!(output.contains("subband_groups_failed_total 1"));
        assert!(output.contains("subband_queue_depth{state=\"pending\"} 7"));
        assert!(output.contains("subband_processing_time_seconds 12.5"));
        assert!(output.contains("# HELP subband_processing_time_avg_seconds Mean processing time"));
    }

    #[test]
    fn rolling_window_is_bounded_and_averages() {
        let m = MetricsCollector::new();
        for i in 0..150 {
            m.record_processing_time(i as f64);
        }
        let snap = m.snapshot();
        assert_eq!(snap.processing_samples, PROCESSING_WINDOW);
        assert_eq!(snap.last_processing_time, 149.0);
        // Window holds 50..=149.
        assert!((snap.avg_processing_time - 99.5).abs() < 1e-9);
    }

    #[test]
    fn empty_window_averages_zero() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.avg_processing_time, 0.0);
        assert_eq!(snap.worker_status, "unknown");
        assert!(snap.last_group_completed_at.is_none());
    }

    #[test]
    fn component_status_replaces_previous_label() {
        let m = MetricsCollector::new();
        m.set_worker_status("running");
        m.set_worker_status("stopped");
        let output = m.encode();
        assert!(output.contains("component=\"worker\",status=\"stopped\""));
        assert!(!output.contains("component=\"worker\",status=\"running\""));
        assert!(!output.contains("component=\"worker\",status=\"unknown\""));
        assert!(output.contains("component=\"watcher\",status=\"unknown\""));
    }

    #[test]
    fn concurrent_status_changes_leave_one_series() {
        let m = Arc::new(MetricsCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let status = if (i + n) % 2 == 0 { "running" } else { "idle" };
                        m.set_worker_status(status);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let output = m.encode();
        let series: Vec<&str> = output
            .lines()
            .filter(|l| l.starts_with("subband_component_status{component=\"worker\""))
            .collect();
        assert_eq!(series.len(), 1, "{output}");
        let current = m.snapshot().worker_status;
        assert!(series[0].contains(&format!("status=\"{}\"", current)));
    }

    #[test]
    fn snapshot_tracks_errors_and_disk() {
        let m = MetricsCollector::new();
        m.record_error("disk full");
        m.set_disk_free("/data/output", 120.25);
        m.set_group_count("collecting", 3);
        let snap = m.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("disk full"));
        assert!(snap.last_error_at.is_some());
        assert_eq!(snap.disk_free_gb["/data/output"], 120.25);
        assert_eq!(snap.group_counts["collecting"], 3);
        assert!(m.encode().contains("path=\"/data/output\""));
    }

    #[test]
    fn counters_are_safe_across_threads() {
        let m = std::sync::Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = std::sync::Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.increment_retried();
                        m.record_processing_time(1.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.groups_retried, 800);
        assert_eq!(snap.processing_samples, PROCESSING_WINDOW);
    }
}
