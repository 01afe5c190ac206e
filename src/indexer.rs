//! Indexer service loop
//!
//! Pulls deltas from a [`DeltaSource`], hands them to the [`BlockBatcher`] and
//! acknowledges each one once it has been handled. Graph failures are logged
//! and counted; only checkpoint and transport failures end the run.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::batcher::{BatcherConfig, BlockBatcher};
use crate::checkpoint::CheckpointStore;
use crate::delta::{Delta, DeltaOp, TableNames};
use crate::document::DocumentTransformer;
use crate::edge::EdgeResolver;
use crate::error::{IndexerError, Result};
use crate::graph::GraphStore;
use crate::metrics;
use crate::query::DocumentQueries;
use crate::schema::SchemaManager;
use crate::transport::{DeltaSource, StartFrom};

/// Totals for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub deltas: u64,
    pub errors: u64,
    pub last_block: Option<u64>,
}

pub struct Indexer {
    tables: TableNames,
    batcher: BlockBatcher,
    checkpoint: Arc<dyn CheckpointStore>,
    queries: DocumentQueries,
}

impl Indexer {
    /// Install the base schema and wire up the pipeline
    pub async fn prepare(
        graph: Arc<dyn GraphStore>,
        checkpoint: Arc<dyn CheckpointStore>,
        tables: TableNames,
        config: BatcherConfig,
    ) -> Result<Self> {
        let schema = Arc::new(SchemaManager::new(graph.clone()));
        schema.ensure_base_schema().await?;

        let batcher = BlockBatcher::new(
            DocumentTransformer::new(graph.clone()),
            EdgeResolver::new(graph.clone(), schema),
            checkpoint.clone(),
            config,
        );
        if let Some(saved) = checkpoint.load().await? {
            if saved.pinned {
                batcher.resume_pinned(saved.block_num).await;
            }
        }

        Ok(Self {
            tables,
            batcher,
            checkpoint,
            queries: DocumentQueries::new(graph),
        })
    }

    /// Position to stream from: the checkpointed block if there is one
    pub async fn resume_position(&self, configured: StartFrom) -> Result<StartFrom> {
        match self.checkpoint.load().await? {
            Some(checkpoint) => {
                info!(block = checkpoint.block_num, saved_at = %checkpoint.updated_at, "Resuming from checkpoint");
                Ok(StartFrom::Block(checkpoint.block_num))
            }
            None => {
                info!(start_from = %configured, "No checkpoint, using configured start");
                Ok(configured)
            }
        }
    }

    pub fn queries(&self) -> &DocumentQueries {
        &self.queries
    }

    pub fn batcher(&self) -> &BlockBatcher {
        &self.batcher
    }

    /// Consume `source` until it is exhausted or `shutdown` fires, then flush
    /// queued operations and the checkpoint.
    pub async fn run<S>(&self, source: &mut S, mut shutdown: broadcast::Receiver<()>) -> Result<RunSummary>
    where
        S: DeltaSource + ?Sized,
    {
        let mut summary = RunSummary::default();

        loop {
            let envelope = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
                next = source.next() => match next? {
                    Some(envelope) => envelope,
                    None => {
                        info!("Delta source exhausted");
                        break;
                    }
                },
            };

            let block_num = envelope.block_num();
            summary.deltas += 1;
            debug!(block = block_num, table = %envelope.content.table, present = envelope.content.present, "Received delta");

            let delta = match envelope.decode(&self.tables) {
                Ok(delta) => delta,
                Err(e) => {
                    warn!(block = block_num, error = %e, "Skipping undecodable delta");
                    metrics::delta_error("decode");
                    summary.errors += 1;
                    Delta {
                        block_num,
                        op: DeltaOp::Ignored {
                            table: envelope.content.table.clone(),
                        },
                    }
                }
            };

            match self.batcher.handle_delta(delta).await {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(_) => summary.errors += 1,
            }

            source.ack().await?;
            summary.last_block = Some(block_num);
        }

        self.finish().await?;
        info!(
            deltas = summary.deltas,
            errors = summary.errors,
            last_block = ?summary.last_block,
            "Indexer stopped"
        );
        Ok(summary)
    }

    /// Flush queued operations and make the checkpoint durable
    pub async fn finish(&self) -> Result<()> {
        match self.batcher.flush().await {
            Ok(()) => {}
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => warn!(error = %e, "Queued operations not applied on shutdown"),
        }
        self.checkpoint.flush().await
    }
}

/// Checkpoint failures stop the indexer; graph failures do not
fn is_fatal(error: &IndexerError) -> bool {
    matches!(error, IndexerError::Checkpoint(_) | IndexerError::Database(_))
}
