//! PolyStore Node
//!
//! Joins a middleware node to the cluster: registers it in the
//! coordination store, loads the topology, and keeps the local view in
//! step with other nodes until shut down.

use anyhow::Result;
use clap::Parser;
use polystore_common::{ColumnsRange, Config, KeyInterval};
use polystore_meta_store::{CoordinationStore, RedbCoordinationStore, StoreOptions};
use polystore_metadata::{BootstrapOutcome, MetaManager};
use polystore_placement::InitialLayoutPlanner;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "polystore-node")]
#[command(about = "PolyStore middleware node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address advertised to other nodes
    #[arg(long)]
    ip: Option<String>,

    /// Client-facing port
    #[arg(long)]
    port: Option<u16>,

    /// Keep the coordination store in memory
    #[arg(long)]
    in_memory: bool,

    /// Create the initial layout if the cluster has none
    #[arg(long)]
    bootstrap: bool,

    /// Column paths the initial layout is split at
    #[arg(long = "sample-path")]
    sample_paths: Vec<String>,

    /// Seconds between flushes of local request statistics (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct ClusterSummary {
    node_id: u64,
    nodes: usize,
    storage_engines: usize,
    storage_units: usize,
    fragments: usize,
    reshard_status: String,
}

impl ClusterSummary {
    fn of(manager: &MetaManager) -> Self {
        let fragments = manager
            .fragments_by_columns(&ColumnsRange::unbounded(), None, false)
            .values()
            .map(Vec::len)
            .sum();
        Self {
            node_id: manager.node_id().as_u64(),
            nodes: manager.node_list().len(),
            storage_engines: manager.storage_engines().len(),
            storage_units: manager.storage_unit_list().len(),
            fragments,
            reshard_status: format!("{:?}", manager.reshard_status()),
        }
    }
}

fn bootstrap(manager: &MetaManager, sample_paths: &[String]) {
    if manager.has_fragment() {
        info!("Cluster already has fragments, skipping bootstrap");
        return;
    }
    let engines: Vec<_> = manager
        .writable_storage_engines()
        .iter()
        .map(|e| e.id)
        .collect();
    if engines.is_empty() {
        warn!("No writable storage engine registered, skipping bootstrap");
        return;
    }
    let plan = InitialLayoutPlanner::new(manager.config().cluster.replica_num).plan_initial(
        sample_paths,
        KeyInterval::full(),
        &engines,
        manager.id_generator(),
    );
    match manager.create_initial_fragments_and_storage_units(&plan) {
        BootstrapOutcome::InitializedByMe => info!("Initial layout created by this node"),
        BootstrapOutcome::AlreadyInitialized => info!("Initial layout loaded from the cluster"),
        BootstrapOutcome::Failed => error!("Failed to create the initial layout"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting PolyStore node");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(ip) = args.ip {
        config.node.ip = ip;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if args.in_memory {
        config.meta.in_memory = true;
    }

    let store: Arc<dyn CoordinationStore> = if config.meta.in_memory {
        Arc::new(RedbCoordinationStore::in_memory(&StoreOptions::from(&config.meta))?)
    } else {
        info!(
            "Opening coordination store at {}",
            config.meta.store_path(&config.node).display()
        );
        Arc::new(RedbCoordinationStore::from_config(&config.meta, &config.node)?)
    };

    let manager = MetaManager::new(config, store)?;
    manager.start_watch();

    if args.bootstrap {
        let node = Arc::clone(&manager);
        let paths = args.sample_paths.clone();
        tokio::task::spawn_blocking(move || bootstrap(&node, &paths)).await?;
    }

    info!("{}", serde_json::to_string(&ClusterSummary::of(&manager))?);

    let mut stats = (args.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.stats_interval)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = async {
                match stats.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if !manager.monitor().is_empty() {
                    let node = Arc::clone(&manager);
                    tokio::task::spawn_blocking(move || {
                        node.submit_fragment_requests();
                        node.submit_max_active_end_key();
                    })
                    .await?;
                }
            }
        }
    }

    info!("Shutting down...");
    manager.shutdown().await;
    info!("PolyStore node shut down gracefully");

    Ok(())
}
