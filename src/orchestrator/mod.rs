//! Per-node scheduling front end.
//!
//! The orchestrator places new jobs into shards (creating shards on demand),
//! runs one consumption loop per active shard, delivers due jobs through the
//! [`DeliverySink`], applies the [`RetryPolicy`] and retires drained shards.
//!
//! Shards are cached locally by *family*: the minute their window starts in.
//! A job due at `t` is placed in a non-complete shard of `t`'s family whose
//! window covers `t` and which still has headroom. Concurrent misses may
//! create more than one shard for a family; that over-partitioning is
//! accepted in exchange for never taking a global lock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use crossbeam_skiplist::SkipMap;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliverySink;
use crate::job::{Job, JobContext, JobMetadata};
use crate::job_shard::{JobShard, ShardError, ShardMetadata};
use crate::metrics::Metrics;
use crate::overload::{NeverOverloaded, OverloadDetector};
use crate::registry::{RegistryError, ShardRegistry};
use crate::retry::RetryPolicy;
use crate::settings::SchedulerConfig;
use crate::shard_window::{family_key, family_start, ShardId};

mod run_loop;
mod slow_start;
mod watcher;

pub use run_loop::{ShardRunState, MAX_TIMER_SLEEP};

/// How many times placement retries after losing a race with shard completion.
const MAX_PLACEMENT_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("scheduling request was cancelled")]
    Cancelled,
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("no shard accepted due time {0} after {1} attempts")]
    PlacementExhausted(DateTime<Utc>, usize),
}

/// Shards whose window starts in the same minute.
#[derive(Default)]
struct ShardFamily {
    shards: RwLock<Vec<Arc<JobShard>>>,
}

impl ShardFamily {
    /// First non-complete shard covering `due_time` with room for another job.
    fn find(&self, due_time: DateTime<Utc>, max_jobs: usize) -> Option<Arc<JobShard>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| !s.is_complete() && s.window().contains(due_time) && s.job_count() < max_jobs)
            .cloned()
    }

    fn push(&self, shard: Arc<JobShard>) {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        if !shards.iter().any(|s| s.id() == shard.id()) {
            shards.push(shard);
        }
    }

    fn remove(&self, id: &ShardId) {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id() != id);
    }

    fn snapshot(&self) -> Vec<Arc<JobShard>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_empty(&self) -> bool {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

pub struct Orchestrator {
    node_id: String,
    registry: Arc<dyn ShardRegistry>,
    sink: Arc<dyn DeliverySink>,
    retry_policy: Arc<dyn RetryPolicy>,
    overload: Arc<dyn OverloadDetector>,
    config: SchedulerConfig,
    metrics: Option<Metrics>,

    families: SkipMap<i64, Arc<ShardFamily>>,
    shards: DashMap<ShardId, Arc<JobShard>>,
    job_index: DashMap<String, ShardId>,
    running: DashSet<ShardId>,

    delivery_permits: Arc<Semaphore>,
    permits_withheld: AtomicUsize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<dyn ShardRegistry>,
        sink: Arc<dyn DeliverySink>,
        retry_policy: Arc<dyn RetryPolicy>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = config.initial_delivery_permits();
        let withheld = config.max_concurrent_deliveries.max(1) - permits;
        Self {
            node_id: node_id.into(),
            registry,
            sink,
            retry_policy,
            overload: Arc::new(NeverOverloaded),
            config,
            metrics: None,
            families: SkipMap::new(),
            shards: DashMap::new(),
            job_index: DashMap::new(),
            running: DashSet::new(),
            delivery_permits: Arc::new(Semaphore::new(permits)),
            permits_withheld: AtomicUsize::new(withheld),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_overload_detector(mut self, detector: Arc<dyn OverloadDetector>) -> Self {
        self.overload = detector;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shards this node currently knows about (created here or assigned to it).
    pub fn known_shards(&self) -> Vec<Arc<JobShard>> {
        self.shards.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Cached shards of the family `due_time` falls into.
    pub fn family_shards(&self, due_time: DateTime<Utc>) -> Vec<Arc<JobShard>> {
        self.families
            .get(&family_key(due_time))
            .map(|e| e.value().snapshot())
            .unwrap_or_default()
    }

    pub fn running_shards(&self) -> Vec<ShardId> {
        self.running.iter().map(|id| id.key().clone()).collect()
    }

    pub fn is_running(&self, shard_id: &ShardId) -> bool {
        self.running.contains(shard_id)
    }

    /// Shard currently holding `job_id`, as far as the local index knows.
    pub fn shard_of(&self, job_id: &str) -> Option<ShardId> {
        self.job_index.get(job_id).map(|e| e.value().clone())
    }

    /// Delivery permits currently granted, free or held. Below
    /// `max_concurrent_deliveries` only while slow start is ramping up.
    pub fn delivery_limit(&self) -> usize {
        self.config.max_concurrent_deliveries.max(1) - self.permits_withheld.load(Ordering::Acquire)
    }

    /// Begin background work: the assignment watcher and, when enabled, the
    /// slow-start ramp of the delivery limit.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return;
        }
        info!(node_id = %self.node_id, "starting orchestrator");
        self.tracker.spawn(watcher::run_watcher(Arc::clone(self)));
        if self.permits_withheld.load(Ordering::Acquire) > 0 {
            self.tracker.spawn(slow_start::run_ramp(Arc::clone(self)));
        }
    }

    /// Stop every loop and wait for in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, running = self.running.len(), "shutting down orchestrator");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(node_id = %self.node_id, "orchestrator stopped");
    }

    /// Schedule a job for delivery to `target_id` at `due_time`.
    pub async fn schedule_job(
        self: &Arc<Self>,
        target_id: &str,
        name: &str,
        due_time: DateTime<Utc>,
        metadata: Option<JobMetadata>,
        cancel: &CancellationToken,
    ) -> Result<Job, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let (shard, job) = self
            .place(due_time, |shard| {
                let metadata = metadata.clone();
                async move {
                    shard
                        .schedule(target_id, name, due_time, metadata)
                        .await
                        .map(|job| (shard, job))
                }
            })
            .await?;

        self.job_index.insert(job.id.clone(), shard.id().clone());
        // Already delivered (due in the past) before the index entry landed.
        if !shard.contains_job(&job.id) {
            self.job_index.remove(&job.id);
        }
        if let Some(m) = &self.metrics {
            m.record_scheduled();
        }
        Ok(job)
    }

    /// Cancel a job that has not been picked up yet. Returns false if its
    /// shard is unknown here, or the job was already handed out, delivered or
    /// removed. A delivery in progress is not affected.
    pub async fn try_cancel_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<bool, SchedulerError> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        let shard_id = self.shard_of(&job.id).unwrap_or_else(|| job.shard_id.clone());
        let Some(shard) = self.shards.get(&shard_id).map(|e| Arc::clone(e.value())) else {
            debug!(job_id = %job.id, shard_id = %shard_id, "cancel for unknown shard");
            return Ok(false);
        };

        let removed = shard.cancel(&job.id).await?;
        if removed {
            self.job_index.remove(&job.id);
            if let Some(m) = &self.metrics {
                m.record_cancelled();
            }
            info!(job_id = %job.id, shard_id = %shard_id, "job cancelled");
        }
        Ok(removed)
    }

    /// Find or create a shard for `due_time` and run `op` on it, trying again
    /// with another shard when the chosen one completed in the meantime.
    async fn place<T, F, Fut>(
        self: &Arc<Self>,
        due_time: DateTime<Utc>,
        mut op: F,
    ) -> Result<(Arc<JobShard>, T), SchedulerError>
    where
        F: FnMut(Arc<JobShard>) -> Fut,
        Fut: Future<Output = Result<(Arc<JobShard>, T), ShardError>>,
    {
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(SchedulerError::ShuttingDown);
            }
            let (shard, fresh) = match self.find_shard(due_time) {
                Some(shard) => (shard, false),
                None => (self.create_shard(due_time).await?, true),
            };
            let result = op(Arc::clone(&shard)).await;
            // A new shard's loop only starts once the triggering job is in,
            // otherwise an already expired shard could complete under it.
            if fresh {
                self.adopt_shard(shard);
            }
            match result {
                Ok(placed) => return Ok(placed),
                Err(ShardError::Complete(id)) => {
                    debug!(shard_id = %id, due_time = %due_time, "shard completed during placement, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::PlacementExhausted(
            due_time,
            MAX_PLACEMENT_ATTEMPTS,
        ))
    }

    fn family(&self, key: i64) -> Arc<ShardFamily> {
        Arc::clone(
            self.families
                .get_or_insert_with(key, || Arc::new(ShardFamily::default()))
                .value(),
        )
    }

    fn find_shard(&self, due_time: DateTime<Utc>) -> Option<Arc<JobShard>> {
        self.families
            .get(&family_key(due_time))
            .and_then(|e| e.value().find(due_time, self.config.max_jobs_per_shard))
    }

    async fn create_shard(self: &Arc<Self>, due_time: DateTime<Utc>) -> Result<Arc<JobShard>, SchedulerError> {
        let key = family_key(due_time);
        let start = family_start(key);
        let duration = TimeDelta::from_std(self.config.shard_duration())
            .unwrap_or_else(|_| TimeDelta::minutes(1));
        let end = start
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut metadata = ShardMetadata::new();
        metadata.insert("created_by".to_string(), self.node_id.clone());
        metadata.insert("family".to_string(), key.to_string());

        let shard = self
            .registry
            .register_shard(&self.node_id, start, end, metadata, true)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_shard_created();
        }
        debug!(shard_id = %shard.id(), due_time = %due_time, "created shard for family miss");
        Ok(shard)
    }

    /// Track `shard` locally and make sure its run-loop is going. Returns
    /// true when a new loop was started.
    fn adopt_shard(self: &Arc<Self>, shard: Arc<JobShard>) -> bool {
        self.shards
            .entry(shard.id().clone())
            .or_insert_with(|| Arc::clone(&shard));
        if !shard.is_complete() {
            self.family(family_key(shard.start_time()))
                .push(Arc::clone(&shard));
        }

        if self.shutdown.is_cancelled() || !self.running.insert(shard.id().clone()) {
            return false;
        }
        self.update_active_gauge();
        let orchestrator = Arc::clone(self);
        self.tracker.spawn(run_loop::run_shard(orchestrator, shard));
        true
    }

    /// Drop `shard` from the placement cache; it keeps draining.
    fn evict_from_family(&self, shard: &JobShard) {
        let key = family_key(shard.start_time());
        if let Some(entry) = self.families.get(&key) {
            entry.value().remove(shard.id());
            if entry.value().is_empty() {
                entry.remove();
            }
        }
    }

    /// Forget a retired shard entirely.
    fn forget_shard(&self, shard: &JobShard) {
        self.evict_from_family(shard);
        self.shards.remove(shard.id());
        self.running.remove(shard.id());
        self.update_active_gauge();
    }

    fn update_active_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.set_shards_active(self.running.len());
        }
    }

    /// Put a failed job back for another attempt, moving it to another shard
    /// when `next_due` falls outside its current one.
    async fn retry_job(self: &Arc<Self>, shard: &Arc<JobShard>, ctx: &JobContext, next_due: DateTime<Utc>) {
        match shard.retry_later(&ctx.job, ctx.dequeue_count, next_due).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %ctx.job.id, shard_id = %shard.id(), "job removed before retry, dropping");
            }
            Err(ShardError::OutOfRange { .. }) => self.transfer_job(shard, ctx, next_due).await,
            Err(e) => {
                error!(job_id = %ctx.job.id, shard_id = %shard.id(), error = %e, "failed to schedule retry");
            }
        }
    }

    async fn transfer_job(self: &Arc<Self>, from: &Arc<JobShard>, ctx: &JobContext, next_due: DateTime<Utc>) {
        let job_id = ctx.job.id.as_str();
        if !from.contains_job(job_id) {
            return;
        }
        let moved = ctx.job.with_due_time(next_due);
        let dequeue_count = ctx.dequeue_count;
        let placed = self
            .place(next_due, |target| {
                let job = moved.clone();
                async move {
                    target
                        .accept_transfer(job, dequeue_count)
                        .await
                        .map(|job| (target, job))
                }
            })
            .await;

        match placed {
            Ok((target, _)) => {
                self.job_index.insert(job_id.to_string(), target.id().clone());
                if !target.contains_job(job_id) {
                    self.job_index.remove_if(job_id, |_, s| s == target.id());
                }
                if let Err(e) = from.remove(job_id).await {
                    warn!(job_id, shard_id = %from.id(), error = %e, "failed to remove transferred job from source shard");
                }
                info!(job_id, from = %from.id(), to = %target.id(), retry_at = %next_due, "job transferred for retry");
            }
            Err(e) => {
                error!(job_id, shard_id = %from.id(), error = %e, "could not place retry, dropping job");
                if let Err(e) = from.remove(job_id).await {
                    warn!(job_id, shard_id = %from.id(), error = %e, "failed to remove job");
                }
                self.job_index.remove_if(job_id, |_, s| s == from.id());
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("node_id", &self.node_id)
            .field("shards", &self.shards.len())
            .field("running", &self.running.len())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
