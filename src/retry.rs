//! # Retry — Eligibility and Exponential Backoff
//!
//! Pure decision logic layered on top of the task queue by callers; the store
//! itself never retries. Two shapes are offered:
//!
//! - [`RetryPolicy::retry_async`] wraps a fallible async call, sleeping
//!   between attempts and reporting each attempt to an observer.
//! - [`RetryState`] is the stepped form (`should_continue` / `record_failure` /
//!   `success`) for callers that interleave their own work between attempts,
//!   such as the worker, which must notice shutdown and lost claims while it
//!   backs off.
//!
//! ## Delay
//!
//! `delay(n) = min(initial * base^(n-1), max)`, then uniform jitter in
//! `±jitter_factor * delay`, floored at zero. Before jitter the delay is
//! non-decreasing in `n` and never exceeds `max`.

use crate::error::{ErrorKind, PipelineError};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// `false` once `attempt >= max_attempts`, for non-retryable errors, and for
/// kinds outside `retryable_kinds`.
pub fn should_retry(
    error: &PipelineError,
    attempt: u32,
    max_attempts: u32,
    retryable_kinds: &[ErrorKind],
) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    if !error.retryable {
        return false;
    }
    retryable_kinds.contains(&error.kind)
}

/// Backoff before attempt `attempt + 1`, where `attempt` counts from 1.
pub fn get_delay(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    jitter_factor: f64,
) -> Duration {
    let base_secs = base_delay_secs(attempt, initial_delay, max_delay, exponential_base);
    let span = base_secs * jitter_factor.clamp(0.0, 1.0);
    let jittered = if span > 0.0 {
        base_secs + rand::thread_rng().gen_range(-span..=span)
    } else {
        base_secs
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

fn base_delay_secs(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
) -> f64 {
    let exponent = attempt.max(1) - 1;
    let raw = initial_delay.as_secs_f64() * exponential_base.powi(exponent.min(i32::MAX as u32) as i32);
    let cap = max_delay.as_secs_f64();
    if raw.is_finite() {
        raw.min(cap)
    } else {
        cap
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter_factor: f64,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            retryable_kinds: ErrorKind::default_retryable_kinds(),
        }
    }
}

/// One attempt as reported to a retry observer.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: Option<PipelineError>,
    /// Backoff before the next attempt; `None` when no further attempt follows.
    pub next_delay: Option<Duration>,
    pub elapsed: Duration,
}

impl RetryAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        should_retry(error, attempt, self.max_attempts, &self.retryable_kinds)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        get_delay(
            attempt,
            self.initial_delay,
            self.max_delay,
            self.exponential_base,
            self.jitter_factor,
        )
    }

    pub fn start(&self) -> RetryState<'_> {
        RetryState::new(self)
    }

    /// Run `op` until it succeeds or the policy gives up.
    pub async fn retry_async<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.retry_async_observed(op_name, op, |_| {}).await
    }

    /// Like [`retry_async`](Self::retry_async), calling `observer` after every attempt.
    pub async fn retry_async_observed<T, F, Fut, O>(
        &self,
        op_name: &str,
        mut op: F,
        mut observer: O,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
        O: FnMut(&RetryAttempt),
    {
        let mut state = self.start();
        while state.should_continue() {
            let attempt = state.attempt() + 1;
            let started = Instant::now();
            match op(attempt).await {
                Ok(value) => {
                    state.success();
                    observer(&RetryAttempt {
                        attempt,
                        error: None,
                        next_delay: None,
                        elapsed: started.elapsed(),
                    });
                    return Ok(value);
                }
                Err(err) => {
                    let next_delay = state.record_failure(err.clone());
                    observer(&RetryAttempt {
                        attempt,
                        error: Some(err.clone()),
                        next_delay,
                        elapsed: started.elapsed(),
                    });
                    match next_delay {
                        Some(delay) => {
                            warn!(
                                op = op_name,
                                attempt,
                                max_attempts = self.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "attempt failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            debug!(op = op_name, attempt, error = %err, "giving up");
                        }
                    }
                }
            }
        }
        Err(state.into_error())
    }
}

/// Stepped retry loop driven by the caller.
///
/// ```text
/// let mut state = policy.start();
/// while state.should_continue() {
///     match op().await {
///         Ok(v) => { state.success(); return Ok(v); }
///         Err(e) => if let Some(d) = state.record_failure(e) { sleep(d).await },
///     }
/// }
/// return Err(state.into_error());
/// ```
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
    last_error: Option<PipelineError>,
    succeeded: bool,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        RetryState {
            policy,
            attempt: 0,
            last_error: None,
            succeeded: false,
        }
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&PipelineError> {
        self.last_error.as_ref()
    }

    pub fn should_continue(&self) -> bool {
        if self.succeeded {
            return false;
        }
        match &self.last_error {
            None => self.attempt < self.policy.max_attempts.max(1),
            Some(err) => self.policy.should_retry(err, self.attempt),
        }
    }

    /// Record a failed attempt; returns the backoff if another attempt is allowed.
    pub fn record_failure(&mut self, error: PipelineError) -> Option<Duration> {
        self.attempt += 1;
        let retry = self.policy.should_retry(&error, self.attempt);
        self.last_error = Some(error);
        retry.then(|| self.policy.delay_for(self.attempt))
    }

    pub fn success(&mut self) {
        self.succeeded = true;
        self.last_error = None;
    }

    /// Final error of an exhausted loop.
    pub fn into_error(self) -> PipelineError {
        self.last_error
            .unwrap_or_else(|| PipelineError::validation("retry loop ended without an attempt"))
    }
}
