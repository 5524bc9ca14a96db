use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shard_window::ShardId;

/// Free-form key/value pairs attached to a job at creation time.
pub type JobMetadata = BTreeMap<String, String>;

/// A single unit of scheduled work.
///
/// `id`, `name` and `target_id` never change after creation. `due_time` and
/// `shard_id` only change through an explicit reschedule or a transfer to
/// another shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub due_time: DateTime<Utc>,
    pub target_id: String,
    pub shard_id: ShardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
}

impl Job {
    pub fn new(
        target_id: impl Into<String>,
        name: impl Into<String>,
        due_time: DateTime<Utc>,
        shard_id: ShardId,
        metadata: Option<JobMetadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            due_time,
            target_id: target_id.into(),
            shard_id,
            metadata,
        }
    }

    pub fn with_due_time(&self, due_time: DateTime<Utc>) -> Self {
        Self {
            due_time,
            ..self.clone()
        }
    }
}

/// What a delivery attempt sees: the job plus per-attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub job: Job,
    /// Unique per hand-out; two attempts of the same job never share it.
    pub run_id: String,
    /// 1 on the first delivery, incremented on every retry.
    pub dequeue_count: u32,
}

impl JobContext {
    pub fn new(job: Job, dequeue_count: u32) -> Self {
        Self {
            job,
            run_id: Uuid::new_v4().to_string(),
            dequeue_count,
        }
    }
}
