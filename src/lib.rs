//! Clock-skew tolerant subband grouping and a durable PostgreSQL task queue
//! for a streaming data-reduction pipeline.
//!
//! - [`db`]: group store and task queue over one connection pool
//! - [`worker`]: claim, heartbeat, execute, resolve
//! - [`reaper`]: stale-claim recovery, retention, gauge refresh
//! - [`ingest`]: subband discovery and group completion
//! - [`telemetry`]: health probes, metrics, lifecycle events

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod group_id;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod reaper;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use error::{ErrorKind, PipelineError};
