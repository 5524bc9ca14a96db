use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Orchestrator;

impl Orchestrator {
    /// Ask the registry for this node's shards due within the lookahead and
    /// start a loop for each one not already running. Returns how many loops
    /// were started.
    pub async fn poll_assignments(self: &Arc<Self>) -> usize {
        let shards = match self
            .registry
            .assign_shards(&self.node_id, self.config.lookahead())
            .await
        {
            Ok(shards) => shards,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "failed to fetch shard assignments, retrying next tick");
                return 0;
            }
        };

        let assigned = shards.len();
        let mut started = 0;
        for shard in shards {
            if self.adopt_shard(shard) {
                started += 1;
            }
        }
        if started > 0 {
            info!(node_id = %self.node_id, assigned, started, "started shard loops");
        } else {
            debug!(node_id = %self.node_id, assigned, "no new shards to start");
        }
        started
    }
}

/// Poll assignments immediately and then every `watcher_interval` until shutdown.
pub(super) async fn run_watcher(orchestrator: Arc<Orchestrator>) {
    let mut interval = tokio::time::interval(orchestrator.config.watcher_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = orchestrator.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        tokio::select! {
            biased;
            _ = orchestrator.shutdown.cancelled() => break,
            _ = orchestrator.poll_assignments() => {}
        }
    }
    debug!(node_id = %orchestrator.node_id, "shard watcher stopped");
}
