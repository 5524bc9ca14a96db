//! Time-window shard types.
//!
//! Every shard accepts jobs for a half-open window of due times
//! `[start, end)` and carries an immutable, unique identity. Windows are
//! grouped into one-minute *families* keyed by the minute their start falls in,
//! and jobs inside a shard are grouped into one-second buckets.

use chrono::{DateTime, Duration as TimeDelta, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Resolution of the buckets inside a shard queue.
pub const BUCKET_RESOLUTION: Duration = Duration::from_secs(1);

/// Resolution of the shard-family key used by the orchestrator.
pub const FAMILY_RESOLUTION: Duration = Duration::from_secs(60);

/// A unique identifier for a shard.
///
/// Generated ids embed the start minute and the creating node so that they
/// sort by time and stay readable in logs.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the id of a shard created by `node_id` for a window starting at `start`.
    pub fn generate(start: DateTime<Utc>, node_id: &str, counter: u64) -> Self {
        Self(format!(
            "shard-{}-{}-{}",
            start.format("%Y%m%d%H%M"),
            node_id,
            counter
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardWindowError {
    #[error("shard window end {end} must be after start {start}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// The window of due times a shard accepts.
///
/// `start` is inclusive, `end` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ShardWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ShardWindowError> {
        if end <= start {
            return Err(ShardWindowError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// Check if the window contains the given due time.
    pub fn contains(&self, due_time: DateTime<Utc>) -> bool {
        due_time >= self.start && due_time < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for ShardWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Truncate `t` down to a multiple of `resolution` since the epoch.
pub fn truncate(t: DateTime<Utc>, resolution: Duration) -> DateTime<Utc> {
    match TimeDelta::from_std(resolution) {
        Ok(delta) => t.duration_trunc(delta).unwrap_or(t),
        Err(_) => t,
    }
}

/// Key of the one-second bucket a due time falls into (epoch seconds, floored).
pub fn bucket_key(due_time: DateTime<Utc>) -> i64 {
    due_time.timestamp()
}

/// Key of the shard family a due time falls into (epoch seconds of its minute).
pub fn family_key(due_time: DateTime<Utc>) -> i64 {
    let minute = FAMILY_RESOLUTION.as_secs() as i64;
    due_time.timestamp().div_euclid(minute) * minute
}

/// First instant covered by a family key.
pub fn family_start(key: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(key, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + horizon`, or `None` when the sum does not fit (treated as unbounded).
pub fn horizon_limit(now: DateTime<Utc>, horizon: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(horizon)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

/// Time left until `t`, zero when `t` is not in the future.
pub fn until(t: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (t - now).to_std().unwrap_or(Duration::ZERO)
}
