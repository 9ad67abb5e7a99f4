//! Adaptive integration optimizer service - runs the controller fleet until Ctrl-C

use adaptive_optimizer::{
    ConnectionParameters, ControlError, EventSink, IntegrationPoint, IntegrationStore,
    JetStreamEventSink, JetStreamStore, MemoryStore, ModuleType, SampleConsumer, Supervisor,
    TracingEventSink,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use nexus_config::{EventBackend, NexusConfig, StoreBackend};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(name = "aain-optimizer")]
#[command(about = "Monitors and tunes integration points between ecosystem modules")]
struct Args {
    /// Path to a JSON or YAML config file
    #[arg(long, env = "AAIN_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file listing integration points to manage at startup
    #[arg(long, env = "AAIN_SEED_POINTS")]
    seed_points: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// One entry of the seed points file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedPoint {
    point_id: String,
    source_module: String,
    target_module: String,
    #[serde(default)]
    source_type: ModuleType,
    #[serde(default)]
    target_type: ModuleType,
    #[serde(default)]
    parameters: ConnectionParameters,
}

const PUBLISHER_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting adaptive integration optimizer");
    let config = NexusConfig::load(args.config.as_deref()).context("Invalid configuration")?;

    info!("Configuration:");
    info!("  Health check interval: {:?}", config.health_check_interval);
    info!("  Aggregation window: {:?}", config.metrics_aggregation_window);
    info!("  Retrain interval: {:?}", config.retrain_interval);
    info!("  Worker pool size: {}", config.worker_pool_size);
    info!("  Store backend: {:?}", config.store.backend);
    info!("  Event backend: {:?}", config.events.backend);
    info!("  Sample ingestion: {}", config.ingest.enabled);
    info!("  Policy path: {}", config.ml_model_path.display());

    let store: Arc<dyn IntegrationStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; integration records will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::JetStream => Arc::new(JetStreamStore::connect(&config.store).await?),
    };

    let (events, publisher): (Arc<dyn EventSink>, Option<JoinHandle<()>>) =
        match config.events.backend {
            EventBackend::Log => (Arc::new(TracingEventSink), None),
            EventBackend::JetStream => {
                let url = config
                    .events
                    .nats_url
                    .as_deref()
                    .context("events.nats_url is required for the jetstream backend")?;
                let (sink, handle) =
                    JetStreamEventSink::connect(url, &config.events.stream_name).await?;
                (Arc::new(sink), Some(handle))
            }
        };

    let ingest = config.ingest.clone();
    let supervisor = Supervisor::new(config, store, events);
    supervisor
        .start_from_store()
        .await
        .context("Failed to load integration points from store")?;

    if let Some(path) = &args.seed_points {
        seed_points(&supervisor, path).await?;
    }

    if ingest.enabled {
        let consumer = SampleConsumer::new(ingest, supervisor.context().aggregator.clone());
        let shutdown = supervisor.shutdown_signal();
        supervisor.track(tokio::spawn(async move {
            if let Err(e) = consumer.run(shutdown).await {
                error!("Sample consumer failed: {:#}", e);
            }
        }));
    }

    supervisor.start_retrain_lane();
    info!(points = supervisor.point_ids().await.len(), "Optimizer running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    supervisor.shutdown().await;
    drop(supervisor);

    // the publisher exits once every sink handle is gone
    if let Some(publisher) = publisher {
        if tokio::time::timeout(PUBLISHER_DRAIN, publisher).await.is_err() {
            warn!("Event publisher did not drain in time");
        }
    }
    info!("Adaptive integration optimizer stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,adaptive_optimizer=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn read_seed_points(path: &Path) -> Result<Vec<SeedPoint>> {
    let body = std::fs::read(path)
        .with_context(|| format!("Failed to read seed points from {}", path.display()))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("Seed points file {} is malformed", path.display()))
}

async fn seed_points(supervisor: &Supervisor, path: &Path) -> Result<()> {
    let now = Utc::now();
    for seed in read_seed_points(path)? {
        let point = IntegrationPoint::new(
            seed.point_id,
            seed.source_module,
            seed.target_module,
            seed.parameters,
            now,
        )
        .with_module_types(seed.source_type, seed.target_type);

        let id = point.point_id().to_string();
        match supervisor.add_point(point).await {
            Ok(record) => info!(
                point_id = %id,
                status = %record.status(),
                version = record.version(),
                "Seeded integration point"
            ),
            Err(ControlError::AlreadyManaged(_)) => {
                debug!(point_id = %id, "Seed point already managed")
            }
            Err(e) => warn!(point_id = %id, error = %e, "Failed to seed integration point"),
        }
    }
    Ok(())
}
