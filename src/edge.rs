//! Edge resolver
//!
//! Applies chain relationship records as graph edges. Both endpoints are
//! looked up by hash in one batch; an edge with an unknown endpoint is dropped
//! with a warning and not retried.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::graph::GraphStore;
use crate::metrics;
use crate::model::{ChainEdge, Uid};
use crate::resolver::HashResolver;
use crate::schema::SchemaManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOutcome {
    Applied { from: Uid, to: Uid },
    Unresolved { from_missing: bool, to_missing: bool },
}

#[derive(Clone, Copy)]
enum EdgeAction {
    Set,
    Remove,
}

#[derive(Clone)]
pub struct EdgeResolver {
    schema: Arc<SchemaManager>,
    resolver: HashResolver,
    graph: Arc<dyn GraphStore>,
}

impl EdgeResolver {
    pub fn new(graph: Arc<dyn GraphStore>, schema: Arc<SchemaManager>) -> Self {
        Self {
            schema,
            resolver: HashResolver::new(graph.clone()),
            graph,
        }
    }

    pub async fn upsert_edge(&self, edge: &ChainEdge) -> Result<EdgeOutcome> {
        self.apply(edge, EdgeAction::Set).await
    }

    pub async fn delete_edge(&self, edge: &ChainEdge) -> Result<EdgeOutcome> {
        self.apply(edge, EdgeAction::Remove).await
    }

    async fn apply(&self, edge: &ChainEdge, action: EdgeAction) -> Result<EdgeOutcome> {
        self.schema.ensure_edge_type(&edge.edge_name).await?;

        let uids = self
            .resolver
            .resolve([edge.from_node.as_str(), edge.to_node.as_str()])
            .await?;

        let (from, to) = match (uids.get(&edge.from_node), uids.get(&edge.to_node)) {
            (Some(from), Some(to)) => (from.clone(), to.clone()),
            (from, to) => {
                warn!(
                    edge = %edge.edge_name,
                    from_node = %edge.from_node,
                    to_node = %edge.to_node,
                    from_missing = from.is_none(),
                    to_missing = to.is_none(),
                    "Edge endpoint not found, dropping edge"
                );
                metrics::edge_unresolved();
                return Ok(EdgeOutcome::Unresolved {
                    from_missing: from.is_none(),
                    to_missing: to.is_none(),
                });
            }
        };

        match action {
            EdgeAction::Set => {
                self.graph.set_edge(&from, &to, &edge.edge_name).await?;
                info!(edge = %edge.edge_name, from = %from, to = %to, "Created edge");
                metrics::edge_created();
            }
            EdgeAction::Remove => {
                self.graph.remove_edge(&from, &to, &edge.edge_name).await?;
                debug!(edge = %edge.edge_name, from = %from, to = %to, "Removed edge");
                metrics::edge_deleted();
            }
        }

        Ok(EdgeOutcome::Applied { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentTransformer;
    use crate::error::IndexerError;
    use crate::graph::MemoryGraph;
    use crate::model::ChainDocument;
    use serde_json::json;

    async fn setup() -> (Arc<MemoryGraph>, DocumentTransformer, EdgeResolver) {
        let graph = Arc::new(MemoryGraph::new());
        let schema = Arc::new(SchemaManager::new(graph.clone()));
        schema.ensure_base_schema().await.unwrap();
        (
            graph.clone(),
            DocumentTransformer::new(graph.clone()),
            EdgeResolver::new(graph, schema),
        )
    }

    fn document(hash: &str) -> ChainDocument {
        serde_json::from_value(json!({
            "hash": hash,
            "creator": "alice",
            "content_groups": [[ { "label": "title", "value": ["string", hash] } ]]
        }))
        .unwrap()
    }

    fn edge(name: &str, from: &str, to: &str) -> ChainEdge {
        ChainEdge {
            edge_name: name.into(),
            from_node: from.into(),
            to_node: to.into(),
        }
    }

    #[tokio::test]
    async fn test_edge_between_existing_documents() {
        let (graph, documents, edges) = setup().await;
        documents.upsert(&document("a")).await.unwrap();
        documents.upsert(&document("b")).await.unwrap();

        let outcome = edges.upsert_edge(&edge("owns", "a", "b")).await.unwrap();
        assert!(matches!(outcome, EdgeOutcome::Applied { .. }));
        assert_eq!(graph.stats().edges, 1);

        edges.delete_edge(&edge("owns", "a", "b")).await.unwrap();
        assert_eq!(graph.stats().edges, 0);
    }

    #[tokio::test]
    async fn test_unresolved_endpoint_reported() {
        let (graph, documents, edges) = setup().await;
        documents.upsert(&document("a")).await.unwrap();

        let outcome = edges.upsert_edge(&edge("owns", "a", "missing")).await.unwrap();
        assert_eq!(
            outcome,
            EdgeOutcome::Unresolved {
                from_missing: false,
                to_missing: true
            }
        );
        assert_eq!(graph.stats().edges, 0);
    }

    #[tokio::test]
    async fn test_invalid_edge_name_rejected() {
        let (_, _, edges) = setup().await;
        assert!(matches!(
            edges.upsert_edge(&edge("bad name", "a", "b")).await,
            Err(IndexerError::InvalidEdgeName(_))
        ));
    }
}
