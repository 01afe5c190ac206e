//! Delta records
//!
//! A delta is one table-row change delivered by the stream:
//!
//! ```json
//! { "content": { "data": {...}, "block_num": 1234, "table": "documents", "present": true } }
//! ```
//!
//! It is decoded once, at the transport boundary, into a [`DeltaOp`] keyed by
//! the configured table names; nothing past this module looks at raw table
//! names or the presence flag.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{IndexerError, Result};
use crate::model::{ChainDocument, ChainEdge};
use crate::schema::validate_edge_name;

/// Names of the contract tables that carry documents and edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub documents: String,
    pub edges: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            documents: "documents".to_string(),
            edges: "edges".to_string(),
        }
    }
}

/// Raw delta as received from the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    pub content: DeltaContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaContent {
    #[serde(default)]
    pub data: Option<JsonValue>,

    #[serde(deserialize_with = "block_number")]
    pub block_num: u64,

    pub table: String,

    /// Row exists after this block (`false` means removed)
    #[serde(deserialize_with = "presence")]
    pub present: bool,
}

/// A decoded delta
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub block_num: u64,
    pub op: DeltaOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    DocumentUpsert(ChainDocument),
    DocumentDelete(ChainDocument),
    EdgeUpsert(ChainEdge),
    EdgeDelete(ChainEdge),
    /// Another table, or a row without data
    Ignored { table: String },
}

impl DeltaOp {
    pub fn kind(&self) -> &'static str {
        match self {
            DeltaOp::DocumentUpsert(_) => "document_upsert",
            DeltaOp::DocumentDelete(_) => "document_delete",
            DeltaOp::EdgeUpsert(_) => "edge_upsert",
            DeltaOp::EdgeDelete(_) => "edge_delete",
            DeltaOp::Ignored { .. } => "ignored",
        }
    }
}

impl DeltaEnvelope {
    pub fn block_num(&self) -> u64 {
        self.content.block_num
    }

    /// Parse a single record from its JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| IndexerError::InvalidDelta(format!("Unreadable delta: {}", e)))
    }

    pub fn decode(&self, tables: &TableNames) -> Result<Delta> {
        let content = &self.content;
        let block_num = content.block_num;

        let ignored = || Delta {
            block_num,
            op: DeltaOp::Ignored {
                table: content.table.clone(),
            },
        };

        let Some(data) = content.data.as_ref().filter(|d| !d.is_null()) else {
            return Ok(ignored());
        };

        let op = if content.table == tables.documents {
            let document: ChainDocument = parse_row(data, "document")?;
            if document.hash.is_empty() {
                return Err(IndexerError::InvalidDelta("document without hash".into()));
            }
            if content.present {
                DeltaOp::DocumentUpsert(document)
            } else {
                DeltaOp::DocumentDelete(document)
            }
        } else if content.table == tables.edges {
            let edge: ChainEdge = parse_row(data, "edge")?;
            validate_edge_name(&edge.edge_name)?;
            if content.present {
                DeltaOp::EdgeUpsert(edge)
            } else {
                DeltaOp::EdgeDelete(edge)
            }
        } else {
            return Ok(ignored());
        };

        Ok(Delta { block_num, op })
    }
}

fn parse_row<T: serde::de::DeserializeOwned>(data: &JsonValue, kind: &str) -> Result<T> {
    T::deserialize(data)
        .map_err(|e| IndexerError::InvalidDelta(format!("Malformed {} row: {}", kind, e)))
}

/// Block numbers arrive as JSON numbers or decimal strings
fn block_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Presence arrives as a bool, or as 0/1
fn presence<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Flag(b) => Ok(b),
        Raw::Number(n) => Ok(n != 0),
        Raw::Text(s) => match s.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid presence flag {}", other))),
        },
    }
}
