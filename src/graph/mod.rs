//! Graph store connection
//!
//! The indexer talks to the graph database only through [`GraphStore`]. The
//! trait is typed: callers hand over node shapes and filters, and each
//! implementation decides how they are rendered on the wire.
//!
//! | Implementation | Backing                                        |
//! |----------------|------------------------------------------------|
//! | `DgraphClient` | Dgraph alpha over HTTP (`/alter`, `/query`, `/mutate`) |
//! | `MemoryGraph`  | In-process maps, for tests and dry runs        |
//!
//! Every call is its own transaction; the indexer never needs more than that.

mod dgraph;
mod memory;

pub use dgraph::{DgraphClient, DgraphConfig};
pub use memory::{MemoryGraph, MemoryStats};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CertificateNode, DocumentView, NewDocument, Uid};
use crate::query::{DocumentFilter, QueryOptions};
use crate::schema::SchemaUpdate;

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Whether every named type is declared
    async fn types_exist(&self, types: &[&str]) -> Result<bool>;

    /// Apply predicate and type declarations
    async fn apply_schema(&self, update: &SchemaUpdate) -> Result<()>;

    /// Predicate names currently declared on a type (empty if undeclared)
    async fn type_fields(&self, type_name: &str) -> Result<Vec<String>>;

    /// Map each hash that matches an existing document to its node id.
    /// Unknown hashes are absent from the result.
    async fn uids_by_hash(&self, hashes: &[String]) -> Result<HashMap<String, Uid>>;

    /// Number of certificates currently attached to a document
    async fn certificate_count(&self, uid: &Uid) -> Result<usize>;

    async fn find_documents(
        &self,
        filter: &DocumentFilter,
        options: &QueryOptions,
    ) -> Result<Vec<DocumentView>>;

    /// Write a complete document subtree in one mutation
    async fn create_document(&self, document: &NewDocument) -> Result<Uid>;

    /// Attach additional certificates to an existing document
    async fn append_certificates(&self, uid: &Uid, certificates: &[CertificateNode]) -> Result<()>;

    async fn set_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()>;

    async fn remove_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()>;

    /// Delete a document together with its content groups, contents and
    /// certificates
    async fn delete_subtree(&self, uid: &Uid) -> Result<()>;
}
