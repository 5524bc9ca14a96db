//! Consumption loop of a single shard.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use crate::delivery::DeliveryOutcome;
use crate::job::JobContext;
use crate::job_shard::JobShard;
use crate::metrics::outcome;
use crate::shard_window::until;

/// Longest single timer sleep; longer waits are split into chunks.
pub const MAX_TIMER_SLEEP: Duration = Duration::from_secs(24 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRunState {
    Created,
    WaitingForStart,
    Running,
    Draining,
    Retired,
}

impl fmt::Display for ShardRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardRunState::Created => "created",
            ShardRunState::WaitingForStart => "waiting_for_start",
            ShardRunState::Running => "running",
            ShardRunState::Draining => "draining",
            ShardRunState::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Sleep until wall-clock time `t`. Returns false if `cancel` fired first.
pub(crate) async fn wait_until(t: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    loop {
        let remaining = until(t, Utc::now());
        if remaining.is_zero() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining.min(MAX_TIMER_SLEEP)) => {}
        }
    }
}

struct RunLoop {
    orchestrator: Arc<Orchestrator>,
    shard: Arc<JobShard>,
    state: ShardRunState,
}

impl RunLoop {
    fn transition(&mut self, next: ShardRunState) {
        info!(
            shard_id = %self.shard.id(),
            from = %self.state,
            to = %next,
            pending = self.shard.job_count(),
            "shard state changed"
        );
        self.state = next;
    }

    async fn run(&mut self) {
        let shutdown = self.orchestrator.shutdown.clone();

        self.transition(ShardRunState::WaitingForStart);
        if !wait_until(self.shard.start_time(), &shutdown).await {
            self.stop();
            return;
        }

        self.transition(ShardRunState::Running);
        let mut ready = self.shard.consume_ready();
        loop {
            if self.state == ShardRunState::Running && self.shard.is_complete() {
                self.enter_draining();
            }
            let draining = self.state == ShardRunState::Draining;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.stop();
                    return;
                }
                reached = wait_until(self.shard.end_time(), &shutdown), if !draining => {
                    if !reached {
                        self.stop();
                        return;
                    }
                    if let Err(e) = self.shard.mark_complete().await {
                        warn!(shard_id = %self.shard.id(), error = %e, "failed to persist shard completion");
                    }
                    self.enter_draining();
                }
                next = ready.next() => match next {
                    Some(ctx) => {
                        if !self.dispatch(ctx, &shutdown).await {
                            self.stop();
                            return;
                        }
                    }
                    None => break,
                },
            }
        }

        if self.state != ShardRunState::Draining {
            self.enter_draining();
        }
        self.retire().await;
    }

    fn enter_draining(&mut self) {
        self.orchestrator.evict_from_family(&self.shard);
        self.transition(ShardRunState::Draining);
    }

    /// Hand a due job to a delivery task once the node is not overloaded and
    /// a node-wide permit is free. Returns false when shutdown interrupted
    /// the wait.
    async fn dispatch(&self, ctx: JobContext, shutdown: &CancellationToken) -> bool {
        let backoff = self.orchestrator.config.overload_backoff_delay();
        while self.orchestrator.overload.is_overloaded() {
            debug!(shard_id = %self.shard.id(), job_id = %ctx.job.id, backoff_ms = backoff.as_millis() as u64, "node overloaded, holding dispatch");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let permits = Arc::clone(&self.orchestrator.delivery_permits);
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let shard = Arc::clone(&self.shard);
        self.orchestrator.tracker.spawn(async move {
            let _permit = permit;
            deliver(orchestrator, shard, ctx).await;
        });
        true
    }

    async fn retire(&mut self) {
        let orchestrator = &self.orchestrator;
        if let Err(e) = orchestrator
            .registry
            .unregister_shard(&orchestrator.node_id, &self.shard)
            .await
        {
            warn!(shard_id = %self.shard.id(), error = %e, "failed to unregister shard");
        }
        orchestrator.forget_shard(&self.shard);
        self.transition(ShardRunState::Retired);
    }

    /// Leave the loop on shutdown without touching the registry.
    fn stop(&self) {
        debug!(shard_id = %self.shard.id(), state = %self.state, "shard loop stopped by shutdown");
        self.orchestrator.running.remove(self.shard.id());
        self.orchestrator.update_active_gauge();
    }
}

pub(super) async fn run_shard(orchestrator: Arc<Orchestrator>, shard: Arc<JobShard>) {
    let mut run_loop = RunLoop {
        orchestrator,
        shard,
        state: ShardRunState::Created,
    };
    run_loop.run().await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One delivery attempt: call the sink, then remove, retry or drop the job.
async fn deliver(orchestrator: Arc<Orchestrator>, shard: Arc<JobShard>, ctx: JobContext) {
    let job_id = ctx.job.id.as_str();
    let metrics = orchestrator.metrics.as_ref();
    if let Some(m) = metrics {
        let lateness = (Utc::now() - ctx.job.due_time).num_milliseconds() as f64 / 1000.0;
        m.record_lateness(lateness);
    }

    let started = Instant::now();
    let mut polls = 0u32;
    let result = loop {
        let outcome = AssertUnwindSafe(orchestrator.sink.deliver(&ctx, &orchestrator.shutdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "delivery panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });
        match outcome {
            Ok(DeliveryOutcome::Completed) => break Ok(()),
            Ok(DeliveryOutcome::PollAfter(delay)) => {
                polls += 1;
                debug!(job_id, shard_id = %shard.id(), polls, delay_ms = delay.as_millis() as u64, "target still working, polling again");
                tokio::select! {
                    biased;
                    _ = orchestrator.shutdown.cancelled() => {
                        // Left in-flight; the journal still holds the job.
                        debug!(job_id, shard_id = %shard.id(), polls, "polling interrupted by shutdown");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => break Err(e),
        }
    };
    let elapsed = started.elapsed().as_secs_f64();

    let error = match result {
        Ok(()) => {
            if let Err(e) = shard.remove(job_id).await {
                warn!(job_id, shard_id = %shard.id(), error = %e, "failed to remove delivered job");
            }
            orchestrator.job_index.remove_if(job_id, |_, s| s == shard.id());
            if let Some(m) = metrics {
                m.record_delivery(outcome::SUCCEEDED, elapsed);
            }
            debug!(job_id, shard_id = %shard.id(), dequeue_count = ctx.dequeue_count, "job delivered");
            return;
        }
        Err(error) => error,
    };

    if orchestrator.shutdown.is_cancelled() {
        debug!(job_id, shard_id = %shard.id(), error = %error, "delivery failed during shutdown, not retrying");
        return;
    }

    match orchestrator
        .retry_policy
        .next_attempt(&ctx.job, ctx.dequeue_count, &error)
    {
        Some(next_due) => {
            warn!(
                job_id,
                shard_id = %shard.id(),
                dequeue_count = ctx.dequeue_count,
                retry_at = %next_due,
                error = %error,
                "delivery failed, retrying"
            );
            orchestrator.retry_job(&shard, &ctx, next_due).await;
            if let Some(m) = metrics {
                m.record_delivery(outcome::RETRIED, elapsed);
            }
        }
        None => {
            error!(
                job_id,
                shard_id = %shard.id(),
                dequeue_count = ctx.dequeue_count,
                error = %error,
                "delivery failed permanently, dropping job"
            );
            if let Err(e) = shard.remove(job_id).await {
                warn!(job_id, shard_id = %shard.id(), error = %e, "failed to remove failed job");
            }
            orchestrator.job_index.remove_if(job_id, |_, s| s == shard.id());
            if let Some(m) = metrics {
                m.record_delivery(outcome::FAILED, elapsed);
            }
        }
    }
}
