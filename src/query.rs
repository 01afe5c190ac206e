//! Document read queries
//!
//! Thin facade over [`GraphStore::find_documents`] offering the lookups the
//! indexed graph is usually read with: by hash, by node id, by creator, and by
//! edge predicate.

use std::sync::Arc;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::model::{DocumentView, Uid};
use crate::schema::validate_edge_name;

/// Root selection of a document query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFilter {
    Hash(String),
    Uid(Uid),
    Creator(String),
    /// Documents that are the target of at least one edge with this predicate
    EdgeTarget(String),
}

/// Which sub-selections to expand on each returned document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub content_groups: bool,
    pub certificates: bool,
    /// Outgoing edge predicates to expand one level deep
    pub edges: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            content_groups: true,
            certificates: true,
            edges: Vec::new(),
        }
    }
}

impl QueryOptions {
    /// Only identity fields
    pub fn shallow() -> Self {
        Self {
            content_groups: false,
            certificates: false,
            edges: Vec::new(),
        }
    }

    pub fn with_edge(mut self, edge: impl Into<String>) -> Self {
        self.edges.push(edge.into());
        self
    }
}

/// Read access to indexed documents
#[derive(Clone)]
pub struct DocumentQueries {
    graph: Arc<dyn GraphStore>,
}

impl DocumentQueries {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    pub async fn get_by_hash(&self, hash: &str, options: &QueryOptions) -> Result<Option<DocumentView>> {
        self.first(DocumentFilter::Hash(hash.to_string()), options).await
    }

    pub async fn get_by_uid(&self, uid: &Uid, options: &QueryOptions) -> Result<Option<DocumentView>> {
        self.first(DocumentFilter::Uid(uid.clone()), options).await
    }

    pub async fn get_by_creator(&self, creator: &str, options: &QueryOptions) -> Result<Vec<DocumentView>> {
        self.find(DocumentFilter::Creator(creator.to_string()), options).await
    }

    pub async fn get_by_edge(&self, edge: &str, options: &QueryOptions) -> Result<Vec<DocumentView>> {
        validate_edge_name(edge)?;
        self.find(DocumentFilter::EdgeTarget(edge.to_string()), options).await
    }

    async fn first(&self, filter: DocumentFilter, options: &QueryOptions) -> Result<Option<DocumentView>> {
        Ok(self.find(filter, options).await?.into_iter().next())
    }

    async fn find(&self, filter: DocumentFilter, options: &QueryOptions) -> Result<Vec<DocumentView>> {
        for edge in &options.edges {
            validate_edge_name(edge)?;
        }
        self.graph.find_documents(&filter, options).await
    }
}
