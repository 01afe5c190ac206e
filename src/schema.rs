//! Graph schema management
//!
//! The base schema declares four node types (Document, ContentGroup, Content,
//! Certificate) and their predicates. Relationship names are not known up
//! front: each new edge name observed on chain becomes a `[uid]` predicate on
//! the Document type the first time it is seen.
//!
//! `SchemaManager` keeps the set of predicates the Document type currently
//! declares. The set is seeded from the live schema at startup, so a restarted
//! indexer neither redeclares existing edge predicates nor forgets ones an
//! earlier run added.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{IndexerError, Result};
use crate::graph::GraphStore;

pub const DOCUMENT_TYPE: &str = "Document";
pub const CONTENT_GROUP_TYPE: &str = "ContentGroup";
pub const CONTENT_TYPE: &str = "Content";
pub const CERTIFICATE_TYPE: &str = "Certificate";

/// Types whose presence means the base schema is installed
pub const BASE_TYPES: [&str; 4] = [DOCUMENT_TYPE, CONTENT_GROUP_TYPE, CONTENT_TYPE, CERTIFICATE_TYPE];

/// Scalar or reference kind of a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    String,
    DateTime,
    Int,
    UidList,
}

/// Index declared on a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Exact,
    Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateDef {
    pub name: String,
    pub kind: PredicateKind,
    pub index: Option<IndexKind>,
}

impl PredicateDef {
    pub fn new(name: &str, kind: PredicateKind, index: Option<IndexKind>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            index,
        }
    }

    /// An outgoing edge predicate
    pub fn edge(name: &str) -> Self {
        Self::new(name, PredicateKind::UidList, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub fields: Vec<String>,
}

impl TypeDef {
    pub fn new(name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// A set of predicate and type declarations applied in one schema call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaUpdate {
    pub predicates: Vec<PredicateDef>,
    pub types: Vec<TypeDef>,
}

impl SchemaUpdate {
    /// Declarations for the four base node types
    pub fn base() -> Self {
        use IndexKind::*;
        use PredicateKind::*;

        Self {
            predicates: vec![
                PredicateDef::new("hash", String, Some(Exact)),
                PredicateDef::new("created_date", DateTime, None),
                PredicateDef::new("creator", String, Some(Term)),
                PredicateDef::new("content_groups", UidList, None),
                PredicateDef::new("certificates", UidList, None),
                PredicateDef::new("content_group_sequence", Int, None),
                PredicateDef::new("contents", UidList, None),
                PredicateDef::new("label", String, Some(Term)),
                PredicateDef::new("value", String, Some(Term)),
                PredicateDef::new("type", String, Some(Term)),
                PredicateDef::new("content_sequence", Int, None),
                PredicateDef::new("document", UidList, None),
                PredicateDef::new("certifier", String, Some(Term)),
                PredicateDef::new("notes", String, None),
                PredicateDef::new("certification_date", DateTime, None),
                PredicateDef::new("certification_sequence", Int, None),
            ],
            types: vec![
                TypeDef::new(
                    DOCUMENT_TYPE,
                    &["hash", "created_date", "creator", "content_groups", "certificates"],
                ),
                TypeDef::new(CONTENT_GROUP_TYPE, &["content_group_sequence", "contents"]),
                TypeDef::new(
                    CONTENT_TYPE,
                    &["label", "value", "type", "content_sequence", "document"],
                ),
                TypeDef::new(
                    CERTIFICATE_TYPE,
                    &["certifier", "notes", "certification_date", "certification_sequence"],
                ),
            ],
        }
    }

    /// Render as DQL schema text
    pub fn to_dql(&self) -> String {
        let mut out = String::new();

        for ty in &self.types {
            let _ = writeln!(out, "type {} {{", ty.name);
            for field in &ty.fields {
                let _ = writeln!(out, "  {}", field);
            }
            out.push_str("}\n");
        }

        for predicate in &self.predicates {
            let kind = match predicate.kind {
                PredicateKind::String => "string",
                PredicateKind::DateTime => "datetime",
                PredicateKind::Int => "int",
                PredicateKind::UidList => "[uid]",
            };
            let index = match predicate.index {
                Some(IndexKind::Exact) => " @index(exact)",
                Some(IndexKind::Term) => " @index(term)",
                None => "",
            };
            let _ = writeln!(out, "{}: {}{} .", predicate.name, kind, index);
        }

        out
    }
}

/// Check that an edge name can be declared as a new Document predicate.
///
/// Names end up inside schema and query text, so only identifier characters
/// are accepted, and base predicates cannot be redeclared as edges.
pub fn validate_edge_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if !valid_start || !valid_rest || name == "uid" || name.starts_with("dgraph.") {
        return Err(IndexerError::InvalidEdgeName(name.to_string()));
    }

    if SchemaUpdate::base().predicates.iter().any(|p| p.name == name) {
        return Err(IndexerError::InvalidEdgeName(name.to_string()));
    }

    Ok(())
}

/// Installs the base schema and extends the Document type with edge predicates
pub struct SchemaManager {
    graph: Arc<dyn GraphStore>,
    /// Predicates on the Document type; `None` until `ensure_base_schema` ran
    document_fields: Mutex<Option<BTreeSet<String>>>,
}

impl SchemaManager {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            document_fields: Mutex::new(None),
        }
    }

    /// Install the base schema unless its types already exist, then load the
    /// Document type's current predicates.
    pub async fn ensure_base_schema(&self) -> Result<()> {
        let mut fields = self.document_fields.lock().await;

        if self.graph.types_exist(&BASE_TYPES).await? {
            debug!("Base schema already present");
        } else {
            info!("Installing base schema");
            self.graph.apply_schema(&SchemaUpdate::base()).await?;
        }

        let live: BTreeSet<String> = self
            .graph
            .type_fields(DOCUMENT_TYPE)
            .await?
            .into_iter()
            .collect();

        info!(predicates = live.len(), "Loaded Document type predicates");
        *fields = Some(live);
        Ok(())
    }

    /// Declare `name` as a Document edge predicate if it is not declared yet.
    ///
    /// Returns `true` when the schema was extended.
    pub async fn ensure_edge_type(&self, name: &str) -> Result<bool> {
        validate_edge_name(name)?;

        let mut guard = self.document_fields.lock().await;
        let fields = guard
            .as_mut()
            .ok_or_else(|| IndexerError::Config("base schema not prepared".into()))?;

        if fields.contains(name) {
            return Ok(false);
        }

        let mut type_fields: Vec<String> = fields.iter().cloned().collect();
        type_fields.push(name.to_string());

        let update = SchemaUpdate {
            predicates: vec![PredicateDef::edge(name)],
            types: vec![TypeDef {
                name: DOCUMENT_TYPE.to_string(),
                fields: type_fields,
            }],
        };
        self.graph.apply_schema(&update).await?;

        fields.insert(name.to_string());
        info!(edge = %name, "Declared edge predicate");
        Ok(true)
    }

    /// Whether `name` is currently declared on the Document type
    pub async fn has_predicate(&self, name: &str) -> bool {
        self.document_fields
            .lock()
            .await
            .as_ref()
            .is_some_and(|fields| fields.contains(name))
    }
}
