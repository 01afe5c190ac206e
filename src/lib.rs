//! docgraph-indexer - materializes contract documents and edges into a graph
//!
//! Follows a contract's table deltas and keeps a Dgraph instance in sync with
//! the documents and relationships stored on chain.
//!
//! ## Pipeline
//!
//! ```text
//! DeltaSource ──▶ DeltaEnvelope::decode ──▶ BlockBatcher ─┬─▶ DocumentTransformer ─┐
//!  (websocket /                                           └─▶ EdgeResolver ────────┴─▶ GraphStore
//!   replay file)                                  checkpoint ◀─┘
//! ```
//!
//! ## Graph Layout
//!
//! | Node         | Predicates                                                     |
//! |--------------|----------------------------------------------------------------|
//! | Document     | hash, creator, created_date, content_groups, certificates, edges |
//! | ContentGroup | content_group_sequence, contents                               |
//! | Content      | label, value, type, content_sequence, document                 |
//! | Certificate  | certifier, notes, certification_date, certification_sequence   |
//!
//! Edge predicates are added to the Document type as new relationship names
//! show up in the edge table.

pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod document;
pub mod edge;
pub mod error;
pub mod graph;
pub mod indexer;
pub mod metrics;
pub mod model;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod transport;

pub use batcher::{BatcherConfig, BlockBatcher};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SledCheckpointStore};
pub use config::{Args, IndexerConfig};
pub use delta::{Delta, DeltaEnvelope, DeltaOp, TableNames};
pub use document::{DeleteOutcome, DocumentTransformer, UpsertOutcome};
pub use edge::{EdgeOutcome, EdgeResolver};
pub use error::{IndexerError, Result};
pub use graph::{DgraphClient, DgraphConfig, GraphStore, MemoryGraph};
pub use indexer::{Indexer, RunSummary};
pub use query::{DocumentFilter, DocumentQueries, QueryOptions};
pub use resolver::HashResolver;
pub use schema::SchemaManager;
pub use transport::{DeltaSource, ReplaySource, StartFrom, WebSocketSource};
