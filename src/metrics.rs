//! Prometheus metrics for the scheduler.
//!
//! Initialize once at startup and hand the (cheaply cloneable) handle to the
//! orchestrator:
//! ```ignore
//! let metrics = cadence::metrics::init()?;
//! let orchestrator = Orchestrator::new(..).with_metrics(metrics.clone());
//! cadence::metrics::run_metrics_server(addr, metrics, shutdown.clone()).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Buckets for sink call durations (seconds)
const DELIVERY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Buckets for how late a job was handed out relative to its due time (seconds)
const LATENESS_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Outcome label values for `cadence_jobs_delivered_total`.
pub mod outcome {
    pub const SUCCEEDED: &str = "succeeded";
    pub const RETRIED: &str = "retried";
    pub const FAILED: &str = "failed";
}

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    jobs_scheduled: Counter,
    jobs_delivered: CounterVec,
    jobs_cancelled: Counter,
    delivery_duration: Histogram,
    delivery_lateness: Histogram,

    shards_created: Counter,
    shards_active: Gauge,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_scheduled(&self) {
        self.jobs_scheduled.inc();
    }

    /// Record the end of a delivery attempt; `outcome` is one of [`outcome`].
    pub fn record_delivery(&self, outcome: &str, duration_secs: f64) {
        self.jobs_delivered.with_label_values(&[outcome]).inc();
        self.delivery_duration.observe(duration_secs);
    }

    pub fn record_lateness(&self, lateness_secs: f64) {
        self.delivery_lateness.observe(lateness_secs.max(0.0));
    }

    pub fn record_cancelled(&self) {
        self.jobs_cancelled.inc();
    }

    pub fn record_shard_created(&self) {
        self.shards_created.inc();
    }

    pub fn set_shards_active(&self, count: usize) {
        self.shards_active.set(count as f64);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Create a fresh registry with all scheduler instruments registered.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let jobs_scheduled = register(
        &registry,
        Counter::new("cadence_jobs_scheduled_total", "Total number of jobs scheduled")?,
    );

    let jobs_delivered = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "cadence_jobs_delivered_total",
                "Delivery attempts by outcome (succeeded, retried, failed)",
            ),
            &["outcome"],
        )?,
    );

    let jobs_cancelled = register(
        &registry,
        Counter::new(
            "cadence_jobs_cancelled_total",
            "Total number of jobs cancelled before delivery",
        )?,
    );

    let delivery_duration = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "cadence_delivery_duration_seconds",
                "Time spent in the delivery sink per attempt",
            )
            .buckets(DELIVERY_BUCKETS.to_vec()),
        )?,
    );

    let delivery_lateness = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "cadence_delivery_lateness_seconds",
                "Delay between a job's due time and its hand-out for delivery",
            )
            .buckets(LATENESS_BUCKETS.to_vec()),
        )?,
    );

    let shards_created = register(
        &registry,
        Counter::new(
            "cadence_shards_created_total",
            "Total number of shards created by this node",
        )?,
    );

    let shards_active = register(
        &registry,
        Gauge::new(
            "cadence_shards_active",
            "Number of shards with a running consumption loop on this node",
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        jobs_scheduled,
        jobs_delivered,
        jobs_cancelled,
        delivery_duration,
        delivery_lateness,
        shards_created,
        shards_active,
    })
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body.into_bytes(),
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Router serving `/metrics`.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `/metrics` on `addr` until `shutdown` is cancelled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
