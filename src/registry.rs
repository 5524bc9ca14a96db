//! Shard registry: which shards exist and which node owns each of them.
//!
//! A shard is owned by at most one node. Shards without an owner (created
//! unassigned, released with jobs still pending, or left behind by an evicted
//! node) are orphans. The next node to call
//! [`ShardRegistry::assign_shards`] with a horizon covering the orphan's start
//! claims it and marks it complete, so it only drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bucket_queue::DEFAULT_POLL_INTERVAL;
use crate::job_shard::{JobShard, ShardError, ShardMetadata};
use crate::journal::{NoopJournal, ShardJournal};
use crate::shard_window::{horizon_limit, ShardId, ShardWindow, ShardWindowError};

pub type NodeId = String;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidWindow(#[from] ShardWindowError),
    #[error("failed to update shard {shard_id}: {source}")]
    Shard {
        shard_id: ShardId,
        #[source]
        source: ShardError,
    },
    #[error("registry backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ShardRegistry: Send + Sync + 'static {
    /// Create a shard for `[start, end)`. When `assign_to_creator` is false
    /// the shard is left unowned.
    async fn register_shard(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metadata: ShardMetadata,
        assign_to_creator: bool,
    ) -> Result<Arc<JobShard>, RegistryError>;

    /// Claim orphans starting within `horizon` and return every shard owned by
    /// `node_id` whose start time is at most `now + horizon`.
    async fn assign_shards(
        &self,
        node_id: &str,
        horizon: Duration,
    ) -> Result<Vec<Arc<JobShard>>, RegistryError>;

    /// Drop `node_id`'s ownership of `shard`. A shard that still holds jobs
    /// becomes an orphan instead of disappearing.
    async fn unregister_shard(&self, node_id: &str, shard: &JobShard) -> Result<(), RegistryError>;
}

/// Registry that keeps every association in process memory.
pub struct InMemoryShardRegistry {
    owned: DashMap<NodeId, DashMap<ShardId, Arc<JobShard>>>,
    orphans: DashMap<ShardId, Arc<JobShard>>,
    journal: Arc<dyn ShardJournal>,
    poll_interval: Duration,
    counter: AtomicU64,
}

impl Default for InMemoryShardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryShardRegistry {
    pub fn new() -> Self {
        Self {
            owned: DashMap::new(),
            orphans: DashMap::new(),
            journal: Arc::new(NoopJournal),
            poll_interval: DEFAULT_POLL_INTERVAL,
            counter: AtomicU64::new(0),
        }
    }

    /// Journal handed to every shard this registry creates.
    pub fn with_journal(mut self, journal: Arc<dyn ShardJournal>) -> Self {
        self.journal = journal;
        self
    }

    /// Ready-sequence tick of every shard this registry creates.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Release every shard owned by a node that is known to be gone.
    pub fn evict_node(&self, node_id: &str) -> usize {
        let Some((_, shards)) = self.owned.remove(node_id) else {
            return 0;
        };
        let released = shards.len();
        for (id, shard) in shards {
            self.orphans.insert(id, shard);
        }
        if released > 0 {
            warn!(node_id, released, "evicted node, shards orphaned");
        }
        released
    }

    pub fn owned_shards(&self, node_id: &str) -> Vec<Arc<JobShard>> {
        self.owned
            .get(node_id)
            .map(|shards| shards.iter().map(|e| Arc::clone(e.value())).collect())
            .unwrap_or_default()
    }

    pub fn orphaned_shards(&self) -> Vec<Arc<JobShard>> {
        self.orphans.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn next_shard_id(&self, start: DateTime<Utc>, node_id: &str) -> ShardId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        ShardId::generate(start, node_id, counter)
    }

    /// Move orphans starting before `limit` under `node_id`; returns the claimed shards.
    fn claim_orphans(&self, node_id: &str, limit: Option<DateTime<Utc>>) -> Vec<Arc<JobShard>> {
        let candidates: Vec<ShardId> = self
            .orphans
            .iter()
            .filter(|e| limit.map_or(true, |l| e.value().start_time() <= l))
            .map(|e| e.key().clone())
            .collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Another node may have claimed it between the scan and now.
            let Some((id, shard)) = self.orphans.remove(&id) else {
                continue;
            };
            self.owned
                .entry(node_id.to_string())
                .or_default()
                .insert(id, Arc::clone(&shard));
            claimed.push(shard);
        }
        claimed
    }
}

#[async_trait]
impl ShardRegistry for InMemoryShardRegistry {
    async fn register_shard(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metadata: ShardMetadata,
        assign_to_creator: bool,
    ) -> Result<Arc<JobShard>, RegistryError> {
        let window = ShardWindow::new(start, end)?;
        let id = self.next_shard_id(start, node_id);
        let shard = Arc::new(JobShard::new(
            id.clone(),
            window,
            metadata,
            Arc::clone(&self.journal),
            self.poll_interval,
        ));

        if assign_to_creator {
            self.owned
                .entry(node_id.to_string())
                .or_default()
                .insert(id.clone(), Arc::clone(&shard));
        } else {
            self.orphans.insert(id.clone(), Arc::clone(&shard));
        }
        info!(shard_id = %id, node_id, window = %window, assign_to_creator, "registered shard");
        Ok(shard)
    }

    async fn assign_shards(
        &self,
        node_id: &str,
        horizon: Duration,
    ) -> Result<Vec<Arc<JobShard>>, RegistryError> {
        let limit = horizon_limit(Utc::now(), horizon);

        // No map guard is held across these awaits.
        for shard in self.claim_orphans(node_id, limit) {
            info!(shard_id = %shard.id(), node_id, pending = shard.job_count(), "claimed orphaned shard");
            shard
                .mark_complete()
                .await
                .map_err(|source| RegistryError::Shard {
                    shard_id: shard.id().clone(),
                    source,
                })?;
        }

        let mut assigned: Vec<Arc<JobShard>> = match self.owned.get(node_id) {
            Some(shards) => shards
                .iter()
                .filter(|e| limit.map_or(true, |l| e.value().start_time() <= l))
                .map(|e| Arc::clone(e.value()))
                .collect(),
            None => Vec::new(),
        };
        assigned.sort_by_key(|s| s.start_time());
        debug!(node_id, count = assigned.len(), "assigned shards");
        Ok(assigned)
    }

    async fn unregister_shard(&self, node_id: &str, shard: &JobShard) -> Result<(), RegistryError> {
        let removed = self
            .owned
            .get(node_id)
            .and_then(|shards| shards.remove(shard.id()));
        let Some((id, shard)) = removed else {
            debug!(shard_id = %shard.id(), node_id, "unregister of unknown shard ignored");
            return Ok(());
        };

        if shard.job_count() > 0 {
            info!(shard_id = %id, node_id, pending = shard.job_count(), "released shard with pending jobs");
            self.orphans.insert(id, shard);
        } else {
            info!(shard_id = %id, node_id, "unregistered shard");
        }
        Ok(())
    }
}
