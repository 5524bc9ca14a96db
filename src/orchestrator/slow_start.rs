//! Gradual ramp of the node-wide delivery limit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::Orchestrator;

/// Next limit on the ramp: double, capped at `max`.
pub(super) fn next_limit(current: usize, max: usize) -> usize {
    current.saturating_mul(2).clamp(1, max)
}

/// Double the delivery limit every `slow_start_interval` until it reaches
/// `max_concurrent_deliveries` or the node shuts down.
pub(super) async fn run_ramp(orchestrator: Arc<Orchestrator>) {
    let period = orchestrator.config.slow_start_interval();
    let max = orchestrator.config.max_concurrent_deliveries.max(1);
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let current = orchestrator.delivery_limit();
        if current >= max {
            break;
        }
        tokio::select! {
            biased;
            _ = orchestrator.shutdown.cancelled() => {
                debug!(node_id = %orchestrator.node_id, limit = current, "slow start stopped by shutdown");
                return;
            }
            _ = ticks.tick() => {}
        }

        let next = next_limit(current, max);
        orchestrator.delivery_permits.add_permits(next - current);
        orchestrator
            .permits_withheld
            .fetch_sub(next - current, Ordering::AcqRel);
        info!(node_id = %orchestrator.node_id, from = current, to = next, "raised delivery concurrency");
    }
    debug!(node_id = %orchestrator.node_id, limit = max, "slow start finished");
}
