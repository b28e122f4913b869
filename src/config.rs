//! TOML pipeline configuration, defaults, and validation.
//!
//! Every field has a default, so an absent file or an empty section yields a
//! working configuration. Sections: `[ingest]`, `[worker]`, `[retry]`,
//! `[reaper]`, `[executor]`, `[health]`, `[server]`.

use crate::error::ErrorKind;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub reaper: ReaperConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub server: ServerConfig,
}

/// The `[ingest]` section: clustering and directory discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub expected_subbands: i32,
    pub cluster_tolerance_s: f64,
    pub incoming_dir: PathBuf,
    pub scan_interval_s: u64,
    /// Spawn a processing task on the worker queue when a group completes.
    pub spawn_on_complete: bool,
    pub completion_task: String,
    pub completion_priority: i32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            expected_subbands: 16,
            cluster_tolerance_s: 60.0,
            incoming_dir: PathBuf::from("/data/incoming"),
            scan_interval_s: 10,
            spawn_on_complete: true,
            completion_task: "convert-group".to_string(),
            completion_priority: 0,
        }
    }
}

/// The `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub poll_interval_s: f64,
    pub heartbeat_interval_s: f64,
    /// Heartbeat staleness bound applied to tasks spawned without their own timeout.
    pub task_timeout_sec: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queue_name: "conversion".to_string(),
            poll_interval_s: 1.0,
            heartbeat_interval_s: 10.0,
            task_timeout_sec: 3600,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_s)
    }
}

/// The `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_s: f64,
    pub max_delay_s: f64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay_s: 1.0,
            max_delay_s: 60.0,
            exponential_base: 2.0,
            jitter_factor: 0.1,
            retryable_kinds: ErrorKind::default_retryable_kinds(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_secs_f64(self.initial_delay_s),
            max_delay: Duration::from_secs_f64(self.max_delay_s),
            exponential_base: self.exponential_base,
            jitter_factor: self.jitter_factor,
            retryable_kinds: self.retryable_kinds.clone(),
        }
    }
}

/// The `[reaper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_s: u64,
    /// Claims at or past this attempt count are failed instead of requeued.
    pub max_attempts: i32,
    pub retention_days: u32,
    pub prune_groups: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            interval_s: 30,
            max_attempts: 3,
            retention_days: 7,
            prune_groups: true,
        }
    }
}

impl ReaperConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }
}

/// The `[executor]` section: external program run per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub timeout_s: Option<u64>,
}

/// The `[health]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub disk_paths: Vec<PathBuf>,
    pub disk_degraded_gb: f64,
    pub disk_unhealthy_gb: f64,
    pub backlog_degraded: i64,
    pub backlog_unhealthy: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            disk_paths: Vec::new(),
            disk_degraded_gb: 50.0,
            disk_unhealthy_gb: 10.0,
            backlog_degraded: 100,
            backlog_unhealthy: 1000,
        }
    }
}

/// The `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:9090".to_string(),
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────

pub fn parse_toml(content: &str) -> Result<PipelineConfig> {
    let config: PipelineConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn parse_toml_file(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("parsing config {}", path.display()))
}

/// Load from `path` when given, otherwise validated defaults.
pub fn load(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => parse_toml_file(p),
        None => {
            let config = PipelineConfig::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

/// Upper bound for any configured delay, one day.
const MAX_DELAY_S: f64 = 86_400.0;

pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    let ingest = &config.ingest;
    if ingest.expected_subbands <= 0 {
        anyhow::bail!("ingest.expected_subbands must be positive");
    }
    if !ingest.cluster_tolerance_s.is_finite() || ingest.cluster_tolerance_s < 0.0 {
        anyhow::bail!("ingest.cluster_tolerance_s must be a non-negative number of seconds");
    }
    if ingest.spawn_on_complete && ingest.completion_task.is_empty() {
        anyhow::bail!("ingest.completion_task is required when spawn_on_complete is set");
    }

    let worker = &config.worker;
    if worker.queue_name.is_empty() {
        anyhow::bail!("worker.queue_name is required");
    }
    if !(worker.poll_interval_s > 0.0) || worker.poll_interval_s > MAX_DELAY_S {
        anyhow::bail!("worker.poll_interval_s must be positive and at most {} seconds", MAX_DELAY_S);
    }
    if !(worker.heartbeat_interval_s > 0.0) || !worker.heartbeat_interval_s.is_finite() {
        anyhow::bail!("worker.heartbeat_interval_s must be positive");
    }
    if worker.task_timeout_sec <= 0 {
        anyhow::bail!("worker.task_timeout_sec must be positive");
    }
    if worker.heartbeat_interval_s >= f64::from(worker.task_timeout_sec) {
        anyhow::bail!(
            "worker.heartbeat_interval_s ({}) must be shorter than worker.task_timeout_sec ({})",
            worker.heartbeat_interval_s,
            worker.task_timeout_sec
        );
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be at least 1");
    }
    if !(0.0..=1.0).contains(&retry.jitter_factor) {
        anyhow::bail!("retry.jitter_factor must be within [0, 1]");
    }
    if !(retry.exponential_base >= 1.0) {
        anyhow::bail!("retry.exponential_base must be at least 1");
    }
    if !(retry.initial_delay_s >= 0.0) || !(retry.max_delay_s >= retry.initial_delay_s) {
        anyhow::bail!("retry delays must satisfy 0 <= initial_delay_s <= max_delay_s");
    }
    if retry.max_delay_s > MAX_DELAY_S {
        anyhow::bail!("retry.max_delay_s must be at most {} seconds", MAX_DELAY_S);
    }

    if config.reaper.max_attempts <= 0 {
        anyhow::bail!("reaper.max_attempts must be at least 1");
    }
    if config.reaper.interval_s == 0 {
        anyhow::bail!("reaper.interval_s must be positive");
    }

    if let Some(program) = &config.executor.program {
        if program.trim().is_empty() {
            anyhow::bail!("executor.program must not be empty");
        }
    }
    if config.executor.timeout_s == Some(0) {
        anyhow::bail!("executor.timeout_s must be positive when set");
    }

    let health = &config.health;
    if health.disk_unhealthy_gb > health.disk_degraded_gb {
        anyhow::bail!("health.disk_unhealthy_gb must not exceed health.disk_degraded_gb");
    }
    if health.backlog_unhealthy < health.backlog_degraded {
        anyhow::bail!("health.backlog_unhealthy must not be below health.backlog_degraded");
    }

    if config.server.listen.parse::<std::net::SocketAddr>().is_err() {
        anyhow::bail!("server.listen '{}' is not a socket address", config.server.listen);
    }
    Ok(())
}
