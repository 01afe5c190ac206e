//! Block batcher
//!
//! The stream marks block boundaries only implicitly: the first delta carrying
//! a new block number closes the previous block. Within a block an edge may
//! arrive before the document it points to, and a document may be removed
//! before an edge that still references it is applied. Those two operations
//! are therefore deferred until the block closes:
//!
//! | Delta                 | Handling                    |
//! |-----------------------|-----------------------------|
//! | document present      | applied immediately         |
//! | document removed      | queued as pending deletion  |
//! | edge present          | queued as pending creation  |
//! | edge removed          | applied immediately         |
//!
//! Queues are flushed, deletions first and each in arrival order, when a delta
//! for a new block arrives or when no delta arrived for `block_end_timeout`.
//!
//! All queue and block state sits behind one async mutex. `handle_delta`,
//! `flush` and the inactivity timer each hold it for their whole run, so a
//! timer flush and a new-block flush never interleave.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::delta::{Delta, DeltaOp};
use crate::document::DocumentTransformer;
use crate::edge::EdgeResolver;
use crate::error::Result;
use crate::metrics;
use crate::model::{ChainDocument, ChainEdge};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Inactivity window after which queued operations are flushed
    pub block_end_timeout: Duration,
    /// Hold the checkpoint at the first block whose handling failed
    pub pin_checkpoint_on_error: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            block_end_timeout: Duration::from_millis(2000),
            pin_checkpoint_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    NewBlock,
    Timeout,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushReason::NewBlock => "new block",
            FlushReason::Timeout => "timeout",
            FlushReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Default)]
struct BatchState {
    /// Block of the batch being accumulated
    current_block: Option<u64>,
    /// Block of the last delta handled
    last_block: Option<u64>,
    /// First block whose handling failed
    pinned_block: Option<u64>,
    /// Block the previous run was pinned at; it is retried once and not pinned again
    retried_block: Option<u64>,
    pending_deletes: VecDeque<ChainDocument>,
    pending_edges: VecDeque<ChainEdge>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is cancelled; a timer only flushes for its own generation
    generation: u64,
}

impl BatchState {
    fn has_pending(&self) -> bool {
        !self.pending_deletes.is_empty() || !self.pending_edges.is_empty()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    /// Block the persisted checkpoint should hold
    fn checkpoint_block(&self) -> Option<u64> {
        match (self.pinned_block, self.last_block) {
            (Some(pinned), Some(last)) => Some(pinned.min(last)),
            (pinned, last) => pinned.or(last),
        }
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        let block = self.checkpoint_block()?;
        Some(if self.pinned_block == Some(block) {
            Checkpoint::pinned_at(block)
        } else {
            Checkpoint::new(block)
        })
    }
}

struct BatcherInner {
    documents: DocumentTransformer,
    edges: EdgeResolver,
    checkpoint: Arc<dyn CheckpointStore>,
    config: BatcherConfig,
    state: Mutex<BatchState>,
}

/// Orders delta handling around block boundaries
#[derive(Clone)]
pub struct BlockBatcher {
    inner: Arc<BatcherInner>,
}

impl BlockBatcher {
    pub fn new(
        documents: DocumentTransformer,
        edges: EdgeResolver,
        checkpoint: Arc<dyn CheckpointStore>,
        config: BatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                documents,
                edges,
                checkpoint,
                config,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// Handle one delta.
    ///
    /// A failing mutation aborts the rest of this delta's handling and is
    /// returned; the block is checkpointed either way.
    pub async fn handle_delta(&self, delta: Delta) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.cancel_timer();

        let block_num = delta.block_num;
        let result = self.inner.process(&mut state, delta).await;
        if let Err(e) = &result {
            error!(block = block_num, error = %e, "Failed to handle delta");
            metrics::delta_error("dispatch");
        }

        if state.has_pending() {
            self.arm_timer(&mut state);
        }

        state.last_block = Some(block_num);
        let saved = self.inner.persist(&state).await;
        result.and(saved)
    }

    /// Flush queued operations now, e.g. on shutdown
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.cancel_timer();

        let result = self.inner.flush_queues(&mut state, FlushReason::Shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to flush queued operations");
            metrics::delta_error("flush");
        }

        let saved = self.inner.persist(&state).await;
        result.and(saved)
    }

    /// Number of queued (deletions, edge creations)
    pub async fn pending_counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock().await;
        (state.pending_deletes.len(), state.pending_edges.len())
    }

    pub async fn current_block(&self) -> Option<u64> {
        self.inner.state.lock().await.current_block
    }

    /// Record that the previous run stopped pinned at `block_num`. If that
    /// block fails again the checkpoint moves past it instead of replaying it
    /// on every restart.
    pub async fn resume_pinned(&self, block_num: u64) {
        warn!(block = block_num, "Retrying block that failed in the previous run");
        self.inner.state.lock().await.retried_block = Some(block_num);
    }

    /// Block the checkpoint currently holds
    pub async fn checkpoint_block(&self) -> Option<u64> {
        self.inner.state.lock().await.checkpoint_block()
    }

    fn arm_timer(&self, state: &mut BatchState) {
        let inner = Arc::clone(&self.inner);
        let generation = state.generation;
        let timeout = self.inner.config.block_end_timeout;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.flush_on_timeout(generation).await;
        }));
    }
}

impl BatcherInner {
    async fn process(&self, state: &mut BatchState, delta: Delta) -> Result<()> {
        let block_num = delta.block_num;

        if state.current_block != Some(block_num) {
            if let Err(e) = self.flush_queues(state, FlushReason::NewBlock).await {
                if let Some(previous) = state.current_block {
                    self.pin(state, previous);
                }
                return Err(e);
            }
            state.current_block = Some(block_num);
            metrics::set_block_number(block_num);
        }

        debug!(block = block_num, op = delta.op.kind(), "Handling delta");

        let dispatched = match delta.op {
            DeltaOp::DocumentUpsert(document) => self.documents.upsert(&document).await.map(|_| ()),
            DeltaOp::DocumentDelete(document) => {
                debug!(hash = %document.hash, "Queueing document delete");
                metrics::document_queued();
                state.pending_deletes.push_back(document);
                Ok(())
            }
            DeltaOp::EdgeUpsert(edge) => {
                debug!(edge = %edge.edge_name, from = %edge.from_node, to = %edge.to_node, "Queueing edge creation");
                metrics::edge_queued();
                state.pending_edges.push_back(edge);
                Ok(())
            }
            DeltaOp::EdgeDelete(edge) => self.edges.delete_edge(&edge).await.map(|_| ()),
            DeltaOp::Ignored { table } => {
                debug!(table = %table, "Ignoring delta");
                Ok(())
            }
        };

        if dispatched.is_err() {
            self.pin(state, block_num);
        }
        dispatched
    }

    /// Apply queued deletions, then queued edge creations. The first failure
    /// stops the flush; operations after it are dropped.
    async fn flush_queues(&self, state: &mut BatchState, reason: FlushReason) -> Result<()> {
        if !state.has_pending() {
            return Ok(());
        }

        info!(
            reason = %reason,
            deletes = state.pending_deletes.len(),
            edges = state.pending_edges.len(),
            "Processing queued operations"
        );

        let mut deletes = std::mem::take(&mut state.pending_deletes).into_iter();
        let mut edges = std::mem::take(&mut state.pending_edges).into_iter();

        while let Some(document) = deletes.next() {
            if let Err(e) = self.documents.delete(&document).await {
                warn!(dropped = deletes.len() + edges.len(), "Abandoning queued operations");
                return Err(e);
            }
        }

        while let Some(edge) = edges.next() {
            if let Err(e) = self.edges.upsert_edge(&edge).await {
                warn!(dropped = edges.len(), "Abandoning queued operations");
                return Err(e);
            }
        }

        Ok(())
    }

    async fn flush_on_timeout(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.timer = None;

        if let Err(e) = self.flush_queues(&mut state, FlushReason::Timeout).await {
            error!(error = %e, "Failed to flush queued operations");
            metrics::delta_error("flush");
            if let Some(block) = state.current_block {
                self.pin(&mut state, block);
            }
        }

        if let Err(e) = self.persist(&state).await {
            error!(error = %e, "Failed to save checkpoint");
        }
    }

    fn pin(&self, state: &mut BatchState, block_num: u64) {
        if !self.config.pin_checkpoint_on_error {
            return;
        }
        if state.retried_block == Some(block_num) {
            error!(block = block_num, "Block failed again after restart, not pinning checkpoint");
            return;
        }
        if state.pinned_block.is_none() {
            warn!(block = block_num, "Pinning checkpoint at failed block");
            state.pinned_block = Some(block_num);
        }
    }

    async fn persist(&self, state: &BatchState) -> Result<()> {
        match state.checkpoint() {
            Some(checkpoint) => self.checkpoint.save(&checkpoint).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::{GraphStore, MemoryGraph};
    use crate::schema::SchemaManager;
    use serde_json::json;

    async fn batcher(timeout_ms: u64) -> (Arc<MemoryGraph>, Arc<MemoryCheckpointStore>, BlockBatcher) {
        batcher_on(MemoryGraph::new(), timeout_ms).await
    }

    async fn batcher_on(
        graph: MemoryGraph,
        timeout_ms: u64,
    ) -> (Arc<MemoryGraph>, Arc<MemoryCheckpointStore>, BlockBatcher) {
        let graph = Arc::new(graph);
        let schema = Arc::new(SchemaManager::new(graph.clone()));
        schema.ensure_base_schema().await.unwrap();

        let store: Arc<dyn GraphStore> = graph.clone();
        let checkpoint = Arc::new(MemoryCheckpointStore::new());
        let batcher = BlockBatcher::new(
            DocumentTransformer::new(store.clone()),
            EdgeResolver::new(store, schema),
            checkpoint.clone(),
            BatcherConfig {
                block_end_timeout: Duration::from_millis(timeout_ms),
                pin_checkpoint_on_error: true,
            },
        );
        (graph, checkpoint, batcher)
    }

    fn create(block_num: u64, hash: &str) -> Delta {
        Delta {
            block_num,
            op: DeltaOp::DocumentUpsert(
                serde_json::from_value(json!({
                    "hash": hash,
                    "content_groups": [[ { "label": "title", "value": ["string", hash] } ]]
                }))
                .unwrap(),
            ),
        }
    }

    fn delete(block_num: u64, hash: &str) -> Delta {
        Delta {
            block_num,
            op: DeltaOp::DocumentDelete(serde_json::from_value(json!({ "hash": hash })).unwrap()),
        }
    }

    fn edge(block_num: u64, from: &str, to: &str) -> Delta {
        Delta {
            block_num,
            op: DeltaOp::EdgeUpsert(ChainEdge {
                edge_name: "owns".into(),
                from_node: from.into(),
                to_node: to.into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_edges_wait_for_block_end() {
        let (graph, checkpoint, batcher) = batcher(60_000).await;

        batcher.handle_delta(edge(5, "a", "b")).await.unwrap();
        batcher.handle_delta(create(5, "a")).await.unwrap();
        batcher.handle_delta(create(5, "b")).await.unwrap();
        assert_eq!(batcher.pending_counts().await, (0, 1));
        assert_eq!(graph.stats().edges, 0);

        batcher
            .handle_delta(Delta {
                block_num: 6,
                op: DeltaOp::Ignored { table: "other".into() },
            })
            .await
            .unwrap();

        assert_eq!(batcher.pending_counts().await, (0, 0));
        assert_eq!(graph.stats().edges, 1);
        assert_eq!(batcher.current_block().await, Some(6));
        assert_eq!(checkpoint.block_num(), Some(6));
    }

    #[tokio::test]
    async fn test_deletes_flush_before_edges_queued_earlier() {
        let (graph, _, batcher) = batcher_on(MemoryGraph::keeping_dangling_edges(), 60_000).await;
        batcher.handle_delta(create(1, "a")).await.unwrap();
        batcher.handle_delta(create(1, "b")).await.unwrap();

        batcher.handle_delta(edge(2, "b", "a")).await.unwrap();
        batcher.handle_delta(delete(2, "a")).await.unwrap();
        assert_eq!(batcher.pending_counts().await, (1, 1));

        batcher.flush().await.unwrap();

        // Target was gone before the edge was resolved, so nothing dangles
        assert_eq!(graph.stats().documents, 1);
        assert_eq!(graph.stats().edges, 0);
        assert_eq!(batcher.pending_counts().await, (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_timer_does_not_flush() {
        let (graph, _, batcher) = batcher(100).await;
        batcher.handle_delta(create(1, "a")).await.unwrap();
        batcher.handle_delta(create(1, "b")).await.unwrap();

        batcher.handle_delta(edge(1, "a", "b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        batcher.handle_delta(edge(1, "b", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // First timer was replaced, second has not expired yet
        assert_eq!(batcher.pending_counts().await, (0, 2));
        assert_eq!(graph.stats().edges, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(batcher.pending_counts().await, (0, 0));
        assert_eq!(graph.stats().edges, 2);
    }

    #[tokio::test]
    async fn test_dispatch_failure_pins_checkpoint() {
        let (graph, checkpoint, batcher) = batcher(60_000).await;
        batcher.handle_delta(create(1, "a")).await.unwrap();

        graph.inject_failures(1);
        assert!(batcher.handle_delta(create(2, "b")).await.is_err());
        batcher.handle_delta(create(3, "c")).await.unwrap();

        assert_eq!(checkpoint.block_num(), Some(2));
        assert_eq!(batcher.checkpoint_block().await, Some(2));
        assert!(checkpoint.load().await.unwrap().unwrap().pinned);
    }

    #[tokio::test]
    async fn test_block_failing_again_after_restart_is_not_pinned() {
        let (graph, checkpoint, batcher) = batcher(60_000).await;
        batcher.resume_pinned(2).await;

        graph.inject_failures(1);
        assert!(batcher.handle_delta(create(2, "b")).await.is_err());
        batcher.handle_delta(create(3, "c")).await.unwrap();

        let saved = checkpoint.load().await.unwrap().unwrap();
        assert_eq!(saved.block_num, 3);
        assert!(!saved.pinned);

        // Other blocks still pin
        graph.inject_failures(1);
        assert!(batcher.handle_delta(create(4, "d")).await.is_err());
        batcher.handle_delta(create(5, "e")).await.unwrap();
        assert_eq!(checkpoint.block_num(), Some(4));
    }

    #[tokio::test]
    async fn test_failure_without_pinning_advances() {
        let graph = Arc::new(MemoryGraph::new());
        let schema = Arc::new(SchemaManager::new(graph.clone()));
        schema.ensure_base_schema().await.unwrap();
        let store: Arc<dyn GraphStore> = graph.clone();
        let checkpoint = Arc::new(MemoryCheckpointStore::new());
        let batcher = BlockBatcher::new(
            DocumentTransformer::new(store.clone()),
            EdgeResolver::new(store, schema),
            checkpoint.clone(),
            BatcherConfig {
                pin_checkpoint_on_error: false,
                ..Default::default()
            },
        );

        graph.inject_failures(1);
        assert!(batcher.handle_delta(create(2, "b")).await.is_err());
        batcher.handle_delta(create(3, "c")).await.unwrap();

        assert_eq!(checkpoint.block_num(), Some(3));
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (graph, _, batcher) = batcher(60_000).await;
        batcher.handle_delta(create(1, "a")).await.unwrap();
        batcher.handle_delta(create(1, "b")).await.unwrap();
        batcher.handle_delta(edge(1, "a", "b")).await.unwrap();

        batcher.flush().await.unwrap();
        assert_eq!(graph.stats().edges, 1);
        assert_eq!(batcher.pending_counts().await, (0, 0));
    }
}
