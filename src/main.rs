use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration as TimeDelta, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadence::delivery::LoggingSink;
use cadence::job::JobMetadata;
use cadence::orchestrator::Orchestrator;
use cadence::registry::InMemoryShardRegistry;
use cadence::settings::{AppConfig, LogFormat};
use cadence::{metrics, shutdown, trace};

#[derive(Parser, Debug)]
#[command(version, about)]
/// Time-sharded job scheduler node
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// node identity, overrides `[node] node_id`
    #[arg(long)]
    node_id: Option<String>,

    /// log output format, overrides `[logging] format`
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// schedule this many demo jobs, one per second starting in five seconds
    #[arg(long, default_value_t = 0)]
    demo_jobs: u32,
}

fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref()).context("failed to load config")?;
    cfg.validate()?;

    trace::init(args.log_format.unwrap_or(cfg.logging.format))?;

    let node_id = args
        .node_id
        .or_else(|| cfg.node.node_id.clone())
        .or_else(get_hostname)
        .unwrap_or_else(|| "cadence-node".to_string());

    let shutdown = shutdown::install_shutdown_handler()?;

    let metrics = metrics::init()?;
    if let Some(addr) = &cfg.metrics.addr {
        let addr: SocketAddr = addr.parse().context("invalid metrics.addr")?;
        let server_metrics = metrics.clone();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(addr, server_metrics, server_shutdown).await {
                error!(error = %e, "metrics server failed");
            }
        });
        info!(addr = %addr, "serving metrics");
    }

    let registry = InMemoryShardRegistry::new()
        .with_poll_interval(cfg.scheduler.bucket_poll_interval());
    let orchestrator = Arc::new(
        Orchestrator::new(
            node_id.clone(),
            Arc::new(registry),
            Arc::new(LoggingSink),
            Arc::new(cfg.retry.clone()),
            cfg.scheduler.clone(),
        )
        .with_metrics(metrics),
    );
    orchestrator.start();
    info!(node_id = %node_id, "cadence node started");

    if args.demo_jobs > 0 {
        let first = Utc::now() + TimeDelta::seconds(5);
        let never = CancellationToken::new();
        for i in 0..args.demo_jobs {
            let mut metadata = JobMetadata::new();
            metadata.insert("source".to_string(), "demo".to_string());
            let due = first + TimeDelta::seconds(i as i64);
            let job = orchestrator
                .schedule_job("demo-target", &format!("demo-{i}"), due, Some(metadata), &never)
                .await?;
            info!(job_id = %job.id, shard_id = %job.shard_id, due_time = %job.due_time, "scheduled demo job");
        }
    }

    shutdown.cancelled().await;
    orchestrator.shutdown().await;
    Ok(())
}
