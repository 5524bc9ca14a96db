use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Decides whether, and when, a failed delivery is attempted again.
pub trait RetryPolicy: Send + Sync + 'static {
    /// `dequeue_count` is the attempt that just failed (1 for the first one).
    /// `None` gives up on the job.
    fn next_attempt(
        &self,
        job: &Job,
        dequeue_count: u32,
        error: &anyhow::Error,
    ) -> Option<DateTime<Utc>>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&Job, u32, &anyhow::Error) -> Option<DateTime<Utc>> + Send + Sync + 'static,
{
    fn next_attempt(
        &self,
        job: &Job,
        dequeue_count: u32,
        error: &anyhow::Error,
    ) -> Option<DateTime<Utc>> {
        self(job, dequeue_count, error)
    }
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_attempt(&self, _: &Job, _: u32, _: &anyhow::Error) -> Option<DateTime<Utc>> {
        None
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    /// Retries allowed after the first failure.
    pub retry_count: u32,
    pub initial_interval_ms: i64,
    pub max_interval_ms: Option<i64>,
    pub randomize_interval: bool,
    pub backoff_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            retry_count: 5,
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Some(60_000),
            randomize_interval: false,
            backoff_factor: Self::default_backoff_factor(),
        }
    }
}

impl ExponentialBackoff {
    pub fn default_initial_interval_ms() -> i64 {
        1_000
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_attempt(
        &self,
        _job: &Job,
        dequeue_count: u32,
        _error: &anyhow::Error,
    ) -> Option<DateTime<Utc>> {
        let failures_so_far = dequeue_count.saturating_sub(1);
        let next_ms = next_retry_time_ms(Utc::now().timestamp_millis(), failures_so_far, self)?;
        DateTime::<Utc>::from_timestamp_millis(next_ms)
    }
}

/// Compute the time (epoch ms) for the next retry attempt, if any.
/// - `failure_time_ms`: time the last attempt failed
/// - `failures_so_far`: number of failed attempts so far (0 for first failure)
/// - `policy`: backoff configuration
/// Returns Some(next_time_ms) or None if no more retries should be attempted.
pub fn next_retry_time_ms(
    failure_time_ms: i64,
    failures_so_far: u32,
    policy: &ExponentialBackoff,
) -> Option<i64> {
    if failures_so_far >= policy.retry_count {
        return None;
    }

    let max_interval = policy.max_interval_ms.unwrap_or(i64::MAX);

    // delay_n = initial * factor^n, n = failures_so_far (0-based)
    let mut delay = (policy.initial_interval_ms as f64
        * policy.backoff_factor.powi(failures_so_far as i32))
    .round() as i64;
    if policy.randomize_interval {
        // Deterministic pseudo-random multiplier in [1.0, 2.0)
        let mut seed = (failure_time_ms as u64) ^ ((failures_so_far as u64) << 32);
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let frac = ((seed >> 32) as f64) / (u32::MAX as f64);
        delay = (delay as f64 * (1.0 + frac)).round() as i64;
    }
    if delay > max_interval {
        delay = max_interval;
    }
    Some(failure_time_ms.saturating_add(delay.max(0)))
}
