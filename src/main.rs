//! docgraph-indexer - contract document indexer
//!
//! Run with: `docgraph-indexer --contract-name docs.hypha --stream-url wss://...`

use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docgraph_indexer::{
    checkpoint::{CheckpointStore, SledCheckpointStore},
    config::Args,
    graph::{DgraphClient, GraphStore, MemoryGraph},
    metrics,
    transport::{DeltaSource, ReplaySource, WebSocketSource},
    Indexer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("docgraph_indexer={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.into_config()?;

    info!("Contract: {}", config.contract_name);
    info!(
        "Tables: documents={}, edges={}",
        config.tables.documents, config.tables.edges
    );

    if let Some(addr) = config.metrics_addr {
        metrics::install_exporter(addr)?;
    }

    let graph: Arc<dyn GraphStore> = if config.dry_run {
        warn!("Dry run: indexing into an in-memory graph");
        Arc::new(MemoryGraph::new())
    } else {
        info!("Graph store: {}", config.dgraph.url);
        Arc::new(DgraphClient::new(config.dgraph.clone())?)
    };

    std::fs::create_dir_all(&config.data_path)?;
    let checkpoint: Arc<dyn CheckpointStore> =
        Arc::new(SledCheckpointStore::open(config.checkpoint_path())?);

    let indexer = Indexer::prepare(graph, checkpoint, config.tables.clone(), config.batcher()).await?;
    let start_from = indexer.resume_position(config.start_from).await?;

    let mut source: Box<dyn DeltaSource> = match &config.replay_file {
        Some(path) => Box::new(ReplaySource::open(path, start_from.min_block(), config.read_until).await?),
        None => Box::new(WebSocketSource::new(config.websocket(start_from)?)),
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    match indexer.run(source.as_mut(), shutdown_rx).await {
        Ok(summary) => {
            info!(
                "Processed {} deltas ({} failed), last block {:?}",
                summary.deltas, summary.errors, summary.last_block
            );
            Ok(())
        }
        Err(e) => {
            error!("Indexer failed: {}", e);
            if let Err(e) = indexer.finish().await {
                error!("Failed to persist checkpoint: {}", e);
            }
            std::process::exit(1);
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
