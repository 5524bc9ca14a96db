use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bucket_queue::{BucketQueue, ReadyJobs};
use crate::job::{Job, JobMetadata};
use crate::journal::{JournalError, NoopJournal, ShardJournal};
use crate::shard_window::{ShardId, ShardWindow};

/// Descriptive key/value pairs attached to a shard by its creator.
pub type ShardMetadata = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("due time {due_time} is outside shard {shard_id} window {window}")]
    OutOfRange {
        shard_id: ShardId,
        due_time: DateTime<Utc>,
        window: ShardWindow,
    },
    #[error("shard {0} is complete and no longer accepts jobs")]
    Complete(ShardId),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// A time-bounded partition of scheduled jobs.
///
/// Accepts jobs whose due time falls in its window until it is marked
/// complete, then drains. All queue state lives in the owned
/// [`BucketQueue`]; every mutation goes through the journal first.
pub struct JobShard {
    id: ShardId,
    window: ShardWindow,
    metadata: ShardMetadata,
    complete: AtomicBool,
    queue: Arc<BucketQueue>,
    journal: Arc<dyn ShardJournal>,
}

impl JobShard {
    pub fn new(
        id: ShardId,
        window: ShardWindow,
        metadata: ShardMetadata,
        journal: Arc<dyn ShardJournal>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            window,
            metadata,
            complete: AtomicBool::new(false),
            queue: Arc::new(BucketQueue::new(poll_interval)),
            journal,
        }
    }

    /// In-memory shard with no journal, mostly useful in tests.
    pub fn ephemeral(id: ShardId, window: ShardWindow, poll_interval: Duration) -> Self {
        Self::new(
            id,
            window,
            ShardMetadata::new(),
            Arc::new(NoopJournal),
            poll_interval,
        )
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn window(&self) -> ShardWindow {
        self.window
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.window.start
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.window.end
    }

    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Pending jobs, including in-flight ones. May lag concurrent mutations.
    pub fn job_count(&self) -> usize {
        self.queue.len()
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.queue.contains(job_id)
    }

    fn check_accepts(&self, due_time: DateTime<Utc>) -> Result<(), ShardError> {
        if self.is_complete() {
            return Err(ShardError::Complete(self.id.clone()));
        }
        self.check_window(due_time)
    }

    fn check_window(&self, due_time: DateTime<Utc>) -> Result<(), ShardError> {
        if !self.window.contains(due_time) {
            return Err(ShardError::OutOfRange {
                shard_id: self.id.clone(),
                due_time,
                window: self.window,
            });
        }
        Ok(())
    }

    /// Create a job with a fresh id and queue it.
    pub async fn schedule(
        &self,
        target_id: &str,
        name: &str,
        due_time: DateTime<Utc>,
        metadata: Option<JobMetadata>,
    ) -> Result<Job, ShardError> {
        self.check_accepts(due_time)?;
        let job = Job::new(target_id, name, due_time, self.id.clone(), metadata);
        let job = self.admit(job, 0).await?;
        debug!(shard_id = %self.id, job_id = %job.id, due_time = %due_time, "job scheduled");
        Ok(job)
    }

    /// Adopt a job that was created by another shard, keeping its identity
    /// and dequeue count.
    pub async fn accept_transfer(&self, mut job: Job, dequeue_count: u32) -> Result<Job, ShardError> {
        self.check_accepts(job.due_time)?;
        job.shard_id = self.id.clone();
        let job = self.admit(job, dequeue_count).await?;
        debug!(shard_id = %self.id, job_id = %job.id, dequeue_count, "job transferred in");
        Ok(job)
    }

    /// Journal a new job, then queue it unless the shard completed while the
    /// journal write was in progress. A refused job is journaled as removed
    /// and reported as [`ShardError::Complete`].
    async fn admit(&self, job: Job, dequeue_count: u32) -> Result<Job, ShardError> {
        self.journal.persist_add(&self.id, &job).await?;
        if self.queue.try_enqueue(job.clone(), dequeue_count) {
            return Ok(job);
        }
        debug!(shard_id = %self.id, job_id = %job.id, "shard completed during admission");
        if let Err(e) = self.journal.persist_remove(&self.id, &job.id).await {
            warn!(shard_id = %self.id, job_id = %job.id, error = %e, "failed to journal refused job removal");
        }
        Err(ShardError::Complete(self.id.clone()))
    }

    /// The shard's ready sequence. Only one consumer should drive it.
    pub fn consume_ready(&self) -> ReadyJobs {
        ReadyJobs::new(Arc::clone(&self.queue))
    }

    /// Cancel a job that has not been handed out yet. Returns false when the
    /// job is unknown or already in-flight; a delivery in progress is left to
    /// finish.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, ShardError> {
        let Some((job, dequeue_count)) = self.queue.cancel_pending(job_id) else {
            return Ok(false);
        };
        if let Err(e) = self.journal.persist_remove(&self.id, job_id).await {
            // Undo so the queue keeps matching the journal.
            if !self.queue.try_enqueue(job, dequeue_count) {
                warn!(shard_id = %self.id, job_id, "could not restore job after failed cancel");
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Remove a job whether queued or in-flight. Returns false if it was
    /// already gone.
    pub async fn remove(&self, job_id: &str) -> Result<bool, ShardError> {
        if !self.queue.contains(job_id) {
            return Ok(false);
        }
        self.journal.persist_remove(&self.id, job_id).await?;
        Ok(self.queue.cancel(job_id))
    }

    /// Put an in-flight job back for another attempt at `new_due_time`.
    ///
    /// Fails with [`ShardError::OutOfRange`] when the new time is outside this
    /// shard's window; the caller must then move the job elsewhere. Returns
    /// false if the job was removed in the meantime.
    pub async fn retry_later(
        &self,
        job: &Job,
        dequeue_count: u32,
        new_due_time: DateTime<Utc>,
    ) -> Result<bool, ShardError> {
        self.check_window(new_due_time)?;
        if !self.queue.contains(&job.id) {
            return Ok(false);
        }
        self.journal
            .persist_retry(&self.id, job, dequeue_count, new_due_time)
            .await?;
        Ok(self.queue.reschedule(&job.id, new_due_time))
    }

    /// Stop accepting new jobs; the ready sequence ends once drained.
    pub async fn mark_complete(&self) -> Result<(), ShardError> {
        if self.complete.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.queue.freeze();
        info!(shard_id = %self.id, pending = self.job_count(), "shard marked complete");
        self.journal.persist_complete(&self.id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for JobShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobShard")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("complete", &self.is_complete())
            .field("job_count", &self.job_count())
            .finish()
    }
}
