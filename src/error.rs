//! # Errors — Tagged Failure Kinds for Retry Decisions
//!
//! Every failure that can reach a retry decision is described by a
//! [`PipelineError`]: a kind tag, an explicit `retryable` flag, an optional
//! processing stage, and a message. [`crate::retry`] pattern-matches on these
//! fields; nothing downstream inspects error types by name.
//!
//! | Kind | Default retryable | Typical source |
//! |------|-------------------|----------------|
//! | `Conversion` / `Calibration` / `Imaging` | caller decides | executor stages |
//! | `Queue` | yes | store contention, dropped connections |
//! | `DiskSpace` | yes | output volume full, may clear after cleanup |
//! | `Validation` | never | malformed ids, unknown groups, bad indices |
//! | `Timeout` | yes | executor exceeded its bound |
//! | `ShutdownRequested` | never | cooperative drain, not a failure |
//!
//! The store layer returns `anyhow::Result` like the rest of the crate;
//! structural violations are raised as `anyhow::Error` wrapping a
//! `PipelineError`, so callers recover the tag with [`PipelineError::classify`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conversion,
    Calibration,
    Imaging,
    Queue,
    DiskSpace,
    Validation,
    Timeout,
    ShutdownRequested,
}

impl ErrorKind {
    /// Retryable flag a freshly constructed error of this kind carries.
    pub fn default_retryable(self) -> bool {
        match self {
            ErrorKind::Conversion | ErrorKind::Calibration | ErrorKind::Imaging => true,
            ErrorKind::Queue | ErrorKind::DiskSpace | ErrorKind::Timeout => true,
            ErrorKind::Validation | ErrorKind::ShutdownRequested => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Conversion => "conversion",
            ErrorKind::Calibration => "calibration",
            ErrorKind::Imaging => "imaging",
            ErrorKind::Queue => "queue",
            ErrorKind::DiskSpace => "disk_space",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ShutdownRequested => "shutdown_requested",
        }
    }

    /// Kinds retried by default. `Validation` and `ShutdownRequested` are never listed.
    pub fn default_retryable_kinds() -> Vec<ErrorKind> {
        vec![
            ErrorKind::Conversion,
            ErrorKind::Calibration,
            ErrorKind::Imaging,
            ErrorKind::Queue,
            ErrorKind::DiskSpace,
            ErrorKind::Timeout,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error{}: {message}", stage_suffix(.stage))]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub stage: Option<String>,
    pub message: String,
}

fn stage_suffix(stage: &Option<String>) -> String {
    match stage {
        Some(s) => format!(" [{}]", s),
        None => String::new(),
    }
}

impl PipelineError {
    /// Build an error with the kind's default retryable flag.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        PipelineError {
            kind,
            retryable: kind.default_retryable(),
            stage: None,
            message: message.into(),
        }
    }

    pub fn conversion(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Conversion, message).with_retryable(retryable)
    }

    pub fn calibration(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Calibration, message).with_retryable(retryable)
    }

    pub fn imaging(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Imaging, message).with_retryable(retryable)
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Queue, message)
    }

    pub fn disk_space(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DiskSpace, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::ShutdownRequested, "shutdown requested")
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_shutdown(&self) -> bool {
        self.kind == ErrorKind::ShutdownRequested
    }

    /// Recover a `PipelineError` from an `anyhow::Error`.
    ///
    /// Typed errors pass through, `sqlx` failures are transient `Queue` errors,
    /// and anything else is a non-retryable `Validation` error.
    pub fn classify(err: &anyhow::Error) -> PipelineError {
        if let Some(typed) = err.downcast_ref::<PipelineError>() {
            return typed.clone();
        }
        if let Some(db_err) = err.downcast_ref::<sqlx::Error>() {
            return PipelineError::from(db_err);
        }
        PipelineError::validation(format!("{:#}", err))
    }
}

impl From<&sqlx::Error> for PipelineError {
    fn from(err: &sqlx::Error) -> Self {
        PipelineError::queue(err.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::from(&err)
    }
}
