//! Time-bucketed priority queue owned by a single shard.
//!
//! Jobs are grouped into one-second buckets keyed by their truncated due
//! time. A min-heap orders the bucket keys and a secondary index maps every
//! job id to its bucket, so cancel and reschedule never scan. Buckets emptied
//! by cancellation stay in the heap and are discarded when they reach the
//! head.
//!
//! Jobs handed out for delivery move to an in-flight table until the owner
//! either removes them (delivered, permanently failed, cancelled) or puts
//! them back with a new due time (retry).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::Notify;
use tracing::trace;

use crate::job::{Job, JobContext};
use crate::shard_window::bucket_key;

/// Default tick of the ready-sequence polling loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct QueuedJob {
    job: Job,
    dequeue_count: u32,
}

#[derive(Debug)]
struct Bucket {
    /// Latest due time among the bucket's members; the bucket is ready once
    /// this has passed. Lowered again when that member leaves.
    latest_due: DateTime<Utc>,
    jobs: HashMap<String, QueuedJob>,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<i64>>,
    buckets: HashMap<i64, Bucket>,
    index: HashMap<String, i64>,
    in_flight: HashMap<String, QueuedJob>,
    frozen: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.index.len() + self.in_flight.len()
    }

    /// Pull `job_id` out of whichever bucket or in-flight slot holds it.
    fn detach(&mut self, job_id: &str) -> Option<QueuedJob> {
        self.detach_pending(job_id)
            .or_else(|| self.in_flight.remove(job_id))
    }

    /// Pull `job_id` out of its bucket, leaving in-flight jobs alone.
    fn detach_pending(&mut self, job_id: &str) -> Option<QueuedJob> {
        let key = self.index.remove(job_id)?;
        let bucket = self.buckets.get_mut(&key)?;
        let entry = bucket.jobs.remove(job_id)?;
        // The bucket's readiness must follow its remaining members.
        if entry.job.due_time >= bucket.latest_due {
            if let Some(latest) = bucket.jobs.values().map(|q| q.job.due_time).max() {
                bucket.latest_due = latest;
            }
        }
        Some(entry)
    }

    fn holds(&self, job_id: &str) -> bool {
        self.index.contains_key(job_id) || self.in_flight.contains_key(job_id)
    }

    fn insert(&mut self, entry: QueuedJob) {
        let key = bucket_key(entry.job.due_time);
        let due = entry.job.due_time;
        let id = entry.job.id.clone();
        let bucket = self.buckets.entry(key).or_insert_with(|| {
            self.heap.push(Reverse(key));
            Bucket {
                latest_due: due,
                jobs: HashMap::new(),
            }
        });
        if due > bucket.latest_due {
            bucket.latest_due = due;
        }
        bucket.jobs.insert(id.clone(), entry);
        self.index.insert(id, key);
    }
}

/// Outcome of a single non-blocking poll of the queue.
#[derive(Debug)]
pub enum PollOutcome {
    /// A job is due and has been moved in-flight.
    Ready(JobContext),
    /// Nothing is due yet.
    Idle,
    /// Frozen and drained; the ready sequence is over.
    Finished,
}

pub struct BucketQueue {
    state: Mutex<QueueState>,
    len: AtomicUsize,
    wake: Notify,
    poll_interval: Duration,
}

impl BucketQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            len: AtomicUsize::new(0),
            wake: Notify::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_len(&self, state: &QueueState) {
        self.len.store(state.len(), Ordering::Release);
    }

    /// Insert or replace `job`. A job already queued or in-flight under the
    /// same id is moved to the bucket of the new due time.
    pub fn enqueue(&self, job: Job, dequeue_count: u32) {
        {
            let mut state = self.lock();
            state.detach(&job.id);
            trace!(job_id = %job.id, due_time = %job.due_time, dequeue_count, "enqueue");
            state.insert(QueuedJob { job, dequeue_count });
            self.sync_len(&state);
        }
        self.wake.notify_waiters();
    }

    /// Like [`enqueue`](Self::enqueue), but refuses a job the queue does not
    /// already hold once frozen. The check and the insert happen under one
    /// lock, so a refused job can never land after the ready sequence ended.
    pub fn try_enqueue(&self, job: Job, dequeue_count: u32) -> bool {
        {
            let mut state = self.lock();
            if state.frozen && !state.holds(&job.id) {
                trace!(job_id = %job.id, "enqueue refused, queue frozen");
                return false;
            }
            state.detach(&job.id);
            state.insert(QueuedJob { job, dequeue_count });
            self.sync_len(&state);
        }
        self.wake.notify_waiters();
        true
    }

    /// Remove a job only while it still waits in a bucket. Jobs already
    /// handed out are left in-flight. Returns the removed job and its
    /// dequeue count.
    pub fn cancel_pending(&self, job_id: &str) -> Option<(Job, u32)> {
        let removed = {
            let mut state = self.lock();
            let removed = state.detach_pending(job_id);
            self.sync_len(&state);
            removed
        };
        removed.map(|entry| {
            self.wake.notify_waiters();
            (entry.job, entry.dequeue_count)
        })
    }

    /// True while the job waits in a bucket (not handed out yet).
    pub fn is_pending(&self, job_id: &str) -> bool {
        self.lock().index.contains_key(job_id)
    }

    /// Remove a job whether it is waiting in a bucket or in-flight.
    pub fn cancel(&self, job_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.detach(job_id).is_some();
            self.sync_len(&state);
            removed
        };
        if removed {
            self.wake.notify_waiters();
        }
        removed
    }

    /// Move a queued or in-flight job to a new due time, keeping its dequeue count.
    pub fn reschedule(&self, job_id: &str, new_due_time: DateTime<Utc>) -> bool {
        let moved = {
            let mut state = self.lock();
            match state.detach(job_id) {
                Some(mut entry) => {
                    entry.job.due_time = new_due_time;
                    state.insert(entry);
                    self.sync_len(&state);
                    true
                }
                None => false,
            }
        };
        if moved {
            self.wake.notify_waiters();
        }
        moved
    }

    /// Stop the ready sequence once the queue drains. Jobs may still be
    /// enqueued afterwards (retries of in-flight jobs).
    pub fn freeze(&self) {
        self.lock().frozen = true;
        self.wake.notify_waiters();
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Bucketed plus in-flight jobs, read without taking the lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().holds(job_id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Earliest time at which the head bucket becomes ready, ignoring emptied buckets.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.lock();
        state
            .buckets
            .values()
            .filter(|bucket| !bucket.jobs.is_empty())
            .map(|bucket| bucket.latest_due)
            .min()
    }

    /// Hand out at most one due job, moving it in-flight.
    pub fn poll_ready(&self, now: DateTime<Utc>) -> PollOutcome {
        let mut state = self.lock();
        loop {
            let Some(&Reverse(key)) = state.heap.peek() else {
                break;
            };
            let ready = match state.buckets.get(&key) {
                None => None,
                Some(bucket) if bucket.jobs.is_empty() => None,
                Some(bucket) => Some(bucket.latest_due <= now),
            };
            match ready {
                None => {
                    state.heap.pop();
                    state.buckets.remove(&key);
                }
                Some(false) => return PollOutcome::Idle,
                Some(true) => {
                    let taken = state.buckets.get_mut(&key).and_then(|bucket| {
                        let id = bucket.jobs.keys().next().cloned()?;
                        bucket.jobs.remove(&id)
                    });
                    let Some(mut entry) = taken else {
                        continue;
                    };
                    state.index.remove(&entry.job.id);
                    entry.dequeue_count = entry.dequeue_count.saturating_add(1);
                    let ctx = JobContext::new(entry.job.clone(), entry.dequeue_count);
                    state.in_flight.insert(entry.job.id.clone(), entry);
                    self.sync_len(&state);
                    return PollOutcome::Ready(ctx);
                }
            }
        }
        if state.frozen && state.in_flight.is_empty() && state.index.is_empty() {
            PollOutcome::Finished
        } else {
            PollOutcome::Idle
        }
    }
}

impl std::fmt::Debug for BucketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketQueue")
            .field("len", &self.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// The ready sequence of a queue: yields due jobs until the queue is frozen
/// and drained.
///
/// Only one consumer per queue is expected. `next` is cancel-safe: dropping
/// the future never loses a job.
pub struct ReadyJobs {
    queue: Arc<BucketQueue>,
}

impl ReadyJobs {
    pub fn new(queue: Arc<BucketQueue>) -> Self {
        Self { queue }
    }

    pub async fn next(&mut self) -> Option<JobContext> {
        loop {
            let notified = self.queue.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.queue.poll_ready(Utc::now()) {
                PollOutcome::Ready(ctx) => return Some(ctx),
                PollOutcome::Finished => return None,
                PollOutcome::Idle => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.queue.poll_interval) => {}
                _ = &mut notified => {}
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobContext> + Send + 'static {
        futures::stream::unfold(self, |mut ready| async move {
            ready.next().await.map(|ctx| (ctx, ready))
        })
    }
}
