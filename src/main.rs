//! Chainlens backend entry point: wires the store, the RPC pools, the
//! per-chain ingestion workers, the aggregation scheduler, and the bootstrap
//! worker, then runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainlens_backend::aggregate::{
    NodeAnalyticsBuilder, RelationAggregator, Scheduler, SnapshotBuilder,
};
use chainlens_backend::bootstrap::{BootstrapQueue, BootstrapWorker, NoopResolver};
use chainlens_backend::config::{Config, ProvidersFile};
use chainlens_backend::ingest::{ChainSyncTracker, HealthMonitor, Orchestrator};
use chainlens_backend::labels::LabelMaps;
use chainlens_backend::price::{HttpPriceProvider, PriceProvider, StaticPrices};
use chainlens_backend::rpc::{ChainAdapter, HttpTransport, RpcPool};
use chainlens_backend::store::{Db, EventStore};

#[derive(Parser, Debug)]
#[command(name = "chainlens", about = "Multi-chain transfer ingestion backend")]
struct Args {
    /// Sqlite database path.
    #[arg(long)]
    db_path: Option<String>,
    /// TOML provider tables; falls back to PROVIDERS_FILE then public endpoints.
    #[arg(long)]
    providers_file: Option<String>,
    /// TOML label-map artifact; falls back to the built-in table.
    #[arg(long, env = "LABELS_FILE")]
    labels_file: Option<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(path) = &args.providers_file {
        config.providers = ProvidersFile::load(path)?;
    }

    info!(
        networks = config.active_networks.len(),
        db = %config.database_path,
        "chainlens starting"
    );

    let labels = Arc::new(match &args.labels_file {
        Some(path) => LabelMaps::load(path)?,
        None => LabelMaps::builtin(),
    });

    let price: Arc<dyn PriceProvider> = match &config.price_endpoint {
        Some(endpoint) => Arc::new(HttpPriceProvider::new(endpoint.clone())),
        None => {
            warn!("no PRICE_ENDPOINT configured; events will carry no USD valuation");
            Arc::new(StaticPrices::default())
        }
    };

    let db = Db::open(&config.database_path)?;
    let events = EventStore::new(db.clone());
    let pool = Arc::new(RpcPool::new(&config.providers, &config.active_networks));
    let transport = Arc::new(HttpTransport::default());
    let adapter = ChainAdapter::new(transport.clone(), pool.clone());

    let tracker = Arc::new(ChainSyncTracker::new(db.clone(), config.ema_alpha));
    let start_blocks: HashMap<_, _> = config
        .active_networks
        .iter()
        .map(|&n| (n, config.providers.settings(n).start_block))
        .collect();
    tracker.init_all(&start_blocks)?;

    // Chains with no configured start block and no persisted checkpoint
    // begin near the current head instead of backfilling from genesis.
    for &network in &config.active_networks {
        let state = tracker.get(network).context("initialized chain missing")?;
        if state.last_synced_block == 0 {
            match adapter.latest_block(network).await {
                Ok(head) => {
                    let start = head.saturating_sub(chainlens_backend::ingest::window::HEAD_BUFFER);
                    tracker.reset(network, start)?;
                    info!(network = %network, start, "checkpoint initialized at head");
                }
                Err(e) => {
                    warn!(network = %network, error = %e, "head probe failed; starting from 0");
                }
            }
        }
    }

    let relations = Arc::new(RelationAggregator::new(
        events.clone(),
        db.clone(),
        labels.clone(),
        config.relation_lookback_days,
    ));
    let nodes = Arc::new(NodeAnalyticsBuilder::new(
        events.clone(),
        db.clone(),
        labels.clone(),
        config.node_analytics_address_cap,
    ));
    let snapshots = Arc::new(SnapshotBuilder::new(db.clone(), config.snapshot_keep_count));
    let health = Arc::new(HealthMonitor::new(tracker.clone()));

    let orchestrator = Orchestrator::new(
        &config,
        adapter,
        pool.clone(),
        tracker.clone(),
        events.clone(),
        price.clone(),
    );
    let control = orchestrator.control_handle();

    let scheduler = Scheduler::new(
        &config,
        control.clone(),
        tracker.clone(),
        events.clone(),
        relations.clone(),
        nodes.clone(),
        snapshots,
        health,
    );

    let bootstrap_adapter = Arc::new(ChainAdapter::new(transport, pool));
    let bootstrap_queue = BootstrapQueue::new(db, config.bootstrap_max_attempts);
    let bootstrap_worker = BootstrapWorker::new(
        bootstrap_queue,
        bootstrap_adapter,
        events,
        nodes,
        relations,
        price,
        Arc::new(NoopResolver),
        config.bootstrap_poll_secs,
    );

    let mut handles = orchestrator.spawn_workers();
    handles.push(scheduler.spawn(orchestrator.shutdown_subscriber()));
    handles.push(bootstrap_worker.spawn(orchestrator.shutdown_subscriber()));

    info!(workers = handles.len(), "all workers running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received, draining in-flight windows");
    orchestrator.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    for checkpoint in control.checkpoints() {
        info!(
            chain = %checkpoint.chain,
            block = checkpoint.last_synced_block,
            events = checkpoint.total_events_ingested,
            "final checkpoint"
        );
    }
    info!("shutdown complete");
    Ok(())
}
