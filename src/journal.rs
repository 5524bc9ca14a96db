//! Persistence hooks called by a shard around each mutation.
//!
//! A durable implementation journals the change before the in-memory effect
//! becomes visible. [`NoopJournal`] keeps everything in memory only, which
//! means pending jobs are lost when the process restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Job;
use crate::shard_window::ShardId;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Unavailable(String),
    #[error("journal serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ShardJournal: Send + Sync + 'static {
    async fn persist_add(&self, _shard_id: &ShardId, _job: &Job) -> Result<(), JournalError> {
        Ok(())
    }

    async fn persist_remove(&self, _shard_id: &ShardId, _job_id: &str) -> Result<(), JournalError> {
        Ok(())
    }

    async fn persist_retry(
        &self,
        _shard_id: &ShardId,
        _job: &Job,
        _dequeue_count: u32,
        _new_due_time: DateTime<Utc>,
    ) -> Result<(), JournalError> {
        Ok(())
    }

    async fn persist_complete(&self, _shard_id: &ShardId) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Journal that persists nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl ShardJournal for NoopJournal {}

/// A single journaled mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Add {
        shard_id: ShardId,
        job: Job,
    },
    Remove {
        shard_id: ShardId,
        job_id: String,
    },
    Retry {
        shard_id: ShardId,
        job_id: String,
        dequeue_count: u32,
        new_due_time: DateTime<Utc>,
    },
    Complete {
        shard_id: ShardId,
    },
}

/// Journal that records every entry in memory, optionally failing on demand.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    failing: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries rendered as JSON lines, the format a file-backed journal would write.
    pub fn to_json_lines(&self) -> Result<String, JournalError> {
        let mut out = String::new();
        for entry in self.entries() {
            out.push_str(&serde_json::to_string(&entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, entry: JournalEntry) -> Result<(), JournalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(JournalError::Unavailable("memory journal set to fail".into()));
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

#[async_trait]
impl ShardJournal for MemoryJournal {
    async fn persist_add(&self, shard_id: &ShardId, job: &Job) -> Result<(), JournalError> {
        self.record(JournalEntry::Add {
            shard_id: shard_id.clone(),
            job: job.clone(),
        })
    }

    async fn persist_remove(&self, shard_id: &ShardId, job_id: &str) -> Result<(), JournalError> {
        self.record(JournalEntry::Remove {
            shard_id: shard_id.clone(),
            job_id: job_id.to_string(),
        })
    }

    async fn persist_retry(
        &self,
        shard_id: &ShardId,
        job: &Job,
        dequeue_count: u32,
        new_due_time: DateTime<Utc>,
    ) -> Result<(), JournalError> {
        self.record(JournalEntry::Retry {
            shard_id: shard_id.clone(),
            job_id: job.id.clone(),
            dequeue_count,
            new_due_time,
        })
    }

    async fn persist_complete(&self, shard_id: &ShardId) -> Result<(), JournalError> {
        self.record(JournalEntry::Complete {
            shard_id: shard_id.clone(),
        })
    }
}
