//! Document model
//!
//! Two shapes of the same data live here:
//!
//! - **Chain records** (`ChainDocument`, `ChainEdge`, ...) exactly as the
//!   contract tables deliver them inside a delta.
//! - **Graph nodes** (`NewDocument`, `ContentGroupNode`, ...) as they are written
//!   to the graph store, and the matching **views** (`DocumentView`, ...) read
//!   back from it.
//!
//! ```text
//! Document ──content_groups──▶ ContentGroup ──contents──▶ Content ──document──▶ Document
//!    │
//!    ├──certificates──▶ Certificate
//!    └──<edge_name>───▶ Document
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Content type tag marking a value as a hash reference to another document
pub const CHECKSUM256: &str = "checksum256";

/// Graph-native node identifier (e.g. `0x2a`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(uid: &str) -> Self {
        Self(uid.to_string())
    }
}

// ============================================================================
// Chain records
// ============================================================================

/// A document row from the document table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDocument {
    /// Content hash, the document's only external identity
    pub hash: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub creator: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub created_date: String,

    /// Ordered content groups, each an ordered list of contents.
    /// `None` or empty marks the row as invalid.
    #[serde(default)]
    pub content_groups: Option<Vec<Vec<ChainContent>>>,

    /// Full chain-side certificate list
    #[serde(default, deserialize_with = "null_as_default")]
    pub certificates: Vec<ChainCertificate>,
}

impl ChainDocument {
    /// A document without content groups is rejected rather than stored
    pub fn is_valid(&self) -> bool {
        self.content_groups.as_ref().is_some_and(|groups| !groups.is_empty())
    }
}

/// A single labelled value inside a content group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainContent {
    pub label: String,
    pub value: ContentValue,
}

/// Chain variant value, encoded on the wire as `[type, value]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, JsonValue)", into = "(String, JsonValue)")]
pub struct ContentValue {
    pub kind: String,
    /// String-encoded value; non-string variants keep their JSON text
    pub value: String,
}

impl ContentValue {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn is_hash_reference(&self) -> bool {
        self.kind == CHECKSUM256
    }
}

impl From<(String, JsonValue)> for ContentValue {
    fn from((kind, value): (String, JsonValue)) -> Self {
        let value = match value {
            JsonValue::String(s) => s,
            other => other.to_string(),
        };
        Self { kind, value }
    }
}

impl From<ContentValue> for (String, JsonValue) {
    fn from(value: ContentValue) -> Self {
        (value.kind, JsonValue::String(value.value))
    }
}

/// A certification attached to a document on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCertificate {
    #[serde(default, deserialize_with = "null_as_default")]
    pub certifier: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub notes: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub certification_date: String,
}

/// A relationship row from the edge table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEdge {
    pub edge_name: String,
    /// Hash of the source document
    pub from_node: String,
    /// Hash of the target document
    pub to_node: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Graph nodes (write side)
// ============================================================================

/// Full document subtree written on first insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub hash: String,
    pub creator: String,
    pub created_date: String,
    pub content_groups: Vec<ContentGroupNode>,
    pub certificates: Vec<CertificateNode>,
}

impl NewDocument {
    /// Iterate every content in group order
    pub fn contents_mut(&mut self) -> impl Iterator<Item = &mut ContentNode> {
        self.content_groups
            .iter_mut()
            .flat_map(|group| group.contents.iter_mut())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentGroupNode {
    pub content_group_sequence: u32,
    pub contents: Vec<ContentNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    pub label: String,
    pub value: String,
    pub content_type: String,
    pub content_sequence: u32,
    /// Resolved target when `content_type` is a hash reference
    pub document: Option<Uid>,
}

impl ContentNode {
    pub fn is_hash_reference(&self) -> bool {
        self.content_type == CHECKSUM256
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateNode {
    pub certifier: String,
    pub notes: String,
    pub certification_date: String,
    pub certification_sequence: u32,
}

// ============================================================================
// Graph views (read side)
// ============================================================================

/// A document as read back from the graph store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    pub uid: Uid,

    #[serde(default)]
    pub hash: String,

    #[serde(default)]
    pub creator: String,

    #[serde(default)]
    pub created_date: String,

    /// Ordered by `content_group_sequence`
    #[serde(default)]
    pub content_groups: Vec<ContentGroupView>,

    /// Ordered by `certification_sequence`
    #[serde(default)]
    pub certificates: Vec<CertificateView>,

    /// Expanded outgoing edges, keyed by predicate name
    #[serde(flatten)]
    pub edges: BTreeMap<String, Vec<DocumentView>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentGroupView {
    pub content_group_sequence: u32,

    /// Ordered by `content_sequence`
    #[serde(default)]
    pub contents: Vec<ContentView>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentView {
    pub content_sequence: u32,
    pub label: String,
    pub value: String,

    #[serde(rename = "type")]
    pub content_type: String,

    /// Linked document for hash references (at most one)
    #[serde(default)]
    pub document: Vec<DocumentRef>,
}

impl ContentView {
    pub fn linked_document(&self) -> Option<&DocumentRef> {
        self.document.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub uid: Uid,

    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateView {
    #[serde(default)]
    pub uid: Uid,

    #[serde(default)]
    pub certifier: String,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub certification_date: String,

    pub certification_sequence: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_document_from_json() {
        let data = serde_json::json!({
            "hash": "abc123",
            "creator": "alice",
            "created_date": "2020-09-15T00:00:00.000",
            "content_groups": [
                [
                    { "label": "title", "value": ["string", "Proposal"] },
                    { "label": "amount", "value": ["int64", 42] }
                ],
                [
                    { "label": "parent", "value": ["checksum256", "def456"] }
                ]
            ],
            "certificates": [
                { "certifier": "bob", "notes": "ok", "certification_date": "2020-09-16T00:00:00.000" }
            ]
        });

        let doc: ChainDocument = serde_json::from_value(data).unwrap();
        assert!(doc.is_valid());

        let groups = doc.content_groups.as_ref().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].value, ContentValue::new("string", "Proposal"));
        assert_eq!(groups[0][1].value.value, "42");
        assert!(groups[1][0].value.is_hash_reference());
        assert_eq!(doc.certificates[0].certifier, "bob");
    }

    #[test]
    fn test_chain_document_without_groups_is_invalid() {
        let missing: ChainDocument = serde_json::from_value(serde_json::json!({
            "hash": "abc", "creator": "alice", "certificates": null
        }))
        .unwrap();
        assert!(!missing.is_valid());
        assert!(missing.certificates.is_empty());

        let empty: ChainDocument = serde_json::from_value(serde_json::json!({
            "hash": "abc", "content_groups": []
        }))
        .unwrap();
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_document_view_collects_edges() {
        let view: DocumentView = serde_json::from_value(serde_json::json!({
            "uid": "0x1",
            "hash": "a",
            "owns": [ { "uid": "0x2", "hash": "b" } ]
        }))
        .unwrap();

        assert_eq!(view.uid, Uid::from("0x1"));
        assert_eq!(view.edges["owns"][0].hash, "b");
        assert!(view.content_groups.is_empty());
    }
}
