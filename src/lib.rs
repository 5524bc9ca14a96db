//! Time-sharded job scheduler.
//!
//! Jobs are scheduled for delivery to an addressable target at a future
//! instant. Each node partitions its jobs into time-bounded shards, each shard
//! holds a one-second-bucketed priority queue, and a per-node orchestrator runs
//! one consumption loop per active shard, handing ready jobs to a delivery sink
//! with at-least-once semantics and pluggable retry.
//!
//! - [`bucket_queue`]: the bucketed priority queue owned by every shard
//! - [`job_shard`]: time-window partitions with persistence hooks
//! - [`registry`]: shard creation and node assignment
//! - [`orchestrator`]: per-node scheduling, run-loops, delivery and retirement

pub mod bucket_queue;
pub mod delivery;
pub mod job;
pub mod job_shard;
pub mod journal;
pub mod metrics;
pub mod orchestrator;
pub mod overload;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod shard_window;
pub mod shutdown;
pub mod trace;

pub use cadence_macros::test;
