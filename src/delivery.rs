use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::job::JobContext;

/// What a successful sink call reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The job is done and can be removed.
    Completed,
    /// The target accepted the job but is still working on it. The sink is
    /// called again for the same attempt after the delay, until it completes
    /// or fails.
    PollAfter(Duration),
}

/// Where due jobs are handed off.
///
/// Errors are opaque to the scheduler; they only feed the retry policy.
/// Implementations should be idempotent: a job may be delivered more than once.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn deliver(
        &self,
        ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DeliveryOutcome>;
}

/// Logs each delivery and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl DeliverySink for LoggingSink {
    async fn deliver(
        &self,
        ctx: &JobContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<DeliveryOutcome> {
        info!(
            job_id = %ctx.job.id,
            name = %ctx.job.name,
            target_id = %ctx.job.target_id,
            shard_id = %ctx.job.shard_id,
            due_time = %ctx.job.due_time,
            run_id = %ctx.run_id,
            dequeue_count = ctx.dequeue_count,
            "delivering job"
        );
        Ok(DeliveryOutcome::Completed)
    }
}
