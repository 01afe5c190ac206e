//! Dgraph HTTP client
//!
//! Speaks to a Dgraph alpha over its HTTP endpoints:
//!
//! - `POST /alter` with DQL schema text
//! - `POST /query` with `{ query, variables }`
//! - `POST /mutate?commitNow=true` with `{ set }` / `{ delete }` JSON
//!
//! Errors reported in the response's `errors` array surface as
//! [`IndexerError::GraphResponse`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, trace};
use url::Url;

use crate::error::{IndexerError, Result};
use crate::graph::GraphStore;
use crate::model::{CertificateNode, ContentNode, DocumentRef, DocumentView, NewDocument, Uid};
use crate::query::{DocumentFilter, QueryOptions};
use crate::schema::{SchemaUpdate, CERTIFICATE_TYPE, CONTENT_GROUP_TYPE, CONTENT_TYPE, DOCUMENT_TYPE};

/// Blank node name of the document root in a create mutation
const DOCUMENT_BLANK_NODE: &str = "document";

#[derive(Debug, Clone)]
pub struct DgraphConfig {
    /// Alpha HTTP endpoint, e.g. `http://localhost:8080`
    pub url: String,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for DgraphConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            timeout_ms: 30_000,
        }
    }
}

pub struct DgraphClient {
    http: reqwest::Client,
    base: Url,
}

impl DgraphClient {
    pub fn new(config: DgraphConfig) -> Result<Self> {
        let mut url = config.url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        let base = Url::parse(&url)
            .map_err(|e| IndexerError::Config(format!("Invalid Dgraph URL {}: {}", config.url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| IndexerError::Config(format!("Invalid Dgraph endpoint {}: {}", path, e)))
    }

    async fn alter(&self, schema: String) -> Result<()> {
        trace!(schema = %schema, "Dgraph alter");
        let request = self.http.post(self.endpoint("alter")?).body(schema);
        self.send(request).await?;
        Ok(())
    }

    async fn query(&self, query: &str, variables: JsonValue) -> Result<JsonValue> {
        trace!(query = %query, "Dgraph query");
        let request = self
            .http
            .post(self.endpoint("query")?)
            .json(&json!({ "query": query, "variables": variables }));
        self.send(request).await
    }

    async fn mutate(&self, body: JsonValue) -> Result<JsonValue> {
        let mut url = self.endpoint("mutate")?;
        url.set_query(Some("commitNow=true"));
        let request = self.http.post(url).json(&body);
        self.send(request).await
    }

    /// Send a request and return its `data` payload
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<JsonValue> {
        let response = request
            .send()
            .await
            .map_err(|e| IndexerError::Graph(format!("Request failed: {}", e)))?;
        let status = response.status();
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| IndexerError::Graph(format!("Unreadable response (HTTP {}): {}", status, e)))?;

        if let Some(message) = response_errors(&body) {
            return Err(IndexerError::GraphResponse(message));
        }
        if !status.is_success() {
            return Err(IndexerError::GraphResponse(format!("HTTP {}", status)));
        }

        Ok(body.get("data").cloned().unwrap_or(JsonValue::Null))
    }

    async fn schema_types(&self, types: &[&str]) -> Result<Vec<SchemaType>> {
        let data = self
            .query(&format!("schema(type: [{}]) {{}}", types.join(", ")), json!({}))
            .await?;
        let parsed: SchemaTypes = serde_json::from_value(data)?;
        Ok(parsed.types)
    }
}

#[async_trait]
impl GraphStore for DgraphClient {
    async fn types_exist(&self, types: &[&str]) -> Result<bool> {
        let existing = self.schema_types(types).await?;
        Ok(types.iter().all(|name| existing.iter().any(|t| t.name == *name)))
    }

    async fn apply_schema(&self, update: &SchemaUpdate) -> Result<()> {
        self.alter(update.to_dql()).await
    }

    async fn type_fields(&self, type_name: &str) -> Result<Vec<String>> {
        let types = self.schema_types(&[type_name]).await?;
        Ok(types
            .into_iter()
            .find(|t| t.name == type_name)
            .map(|t| t.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default())
    }

    async fn uids_by_hash(&self, hashes: &[String]) -> Result<HashMap<String, Uid>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }

        let data = self.query(&hash_lookup_query(hashes)?, json!({})).await?;
        let found: Documents<DocumentRef> = serde_json::from_value(data)?;
        debug!(requested = hashes.len(), found = found.documents.len(), "Resolved hashes");

        Ok(found
            .documents
            .into_iter()
            .map(|doc| (doc.hash, doc.uid))
            .collect())
    }

    async fn certificate_count(&self, uid: &Uid) -> Result<usize> {
        let data = self
            .query(
                "query documents($uid: string) {
                    documents(func: uid($uid)) { total: count(certificates) }
                }",
                json!({ "$uid": uid }),
            )
            .await?;
        let found: Documents<CertificateTotal> = serde_json::from_value(data)?;
        Ok(found.documents.first().map(|d| d.total).unwrap_or(0))
    }

    async fn find_documents(
        &self,
        filter: &DocumentFilter,
        options: &QueryOptions,
    ) -> Result<Vec<DocumentView>> {
        let (query, variables) = render_document_query(filter, options);
        let data = self.query(&query, variables).await?;
        let found: Documents<DocumentView> = serde_json::from_value(data)?;
        Ok(found.documents)
    }

    async fn create_document(&self, document: &NewDocument) -> Result<Uid> {
        let data = self
            .mutate(json!({ "set": [document_json(document)] }))
            .await?;

        data.get("uids")
            .and_then(|uids| uids.get(DOCUMENT_BLANK_NODE))
            .and_then(|uid| uid.as_str())
            .map(Uid::from)
            .ok_or_else(|| IndexerError::GraphResponse("create returned no document uid".into()))
    }

    async fn append_certificates(&self, uid: &Uid, certificates: &[CertificateNode]) -> Result<()> {
        let certificates: Vec<JsonValue> = certificates.iter().map(certificate_json).collect();
        self.mutate(json!({
            "set": [{
                "uid": uid,
                "dgraph.type": DOCUMENT_TYPE,
                "certificates": certificates,
            }]
        }))
        .await?;
        Ok(())
    }

    async fn set_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()> {
        self.mutate(json!({ "set": [edge_json(from, to, predicate)] })).await?;
        Ok(())
    }

    async fn remove_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()> {
        self.mutate(json!({ "delete": [edge_json(from, to, predicate)] })).await?;
        Ok(())
    }

    async fn delete_subtree(&self, uid: &Uid) -> Result<()> {
        let data = self
            .query(
                "query documents($uid: string) {
                    documents(func: uid($uid)) @filter(type(Document)) {
                        uid
                        content_groups { uid contents { uid } }
                        certificates { uid }
                    }
                }",
                json!({ "$uid": uid }),
            )
            .await?;
        let found: Documents<Subtree> = serde_json::from_value(data)?;

        let Some(subtree) = found.documents.into_iter().next() else {
            return Ok(());
        };

        let nodes: Vec<JsonValue> = subtree
            .uids()
            .into_iter()
            .map(|uid| json!({ "uid": uid }))
            .collect();
        debug!(uid = %uid, nodes = nodes.len(), "Deleting document subtree");

        self.mutate(json!({ "delete": nodes })).await?;
        Ok(())
    }
}

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(bound = "T: Deserialize<'de>")]
struct Documents<T> {
    #[serde(default)]
    documents: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CertificateTotal {
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Default, Deserialize)]
struct SchemaTypes {
    #[serde(default)]
    types: Vec<SchemaType>,
}

#[derive(Debug, Deserialize)]
struct SchemaType {
    name: String,
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NodeId {
    uid: Uid,
}

#[derive(Debug, Deserialize)]
struct GroupIds {
    uid: Uid,
    #[serde(default)]
    contents: Vec<NodeId>,
}

#[derive(Debug, Deserialize)]
struct Subtree {
    uid: Uid,
    #[serde(default)]
    content_groups: Vec<GroupIds>,
    #[serde(default)]
    certificates: Vec<NodeId>,
}

impl Subtree {
    /// Children first, document root last
    fn uids(self) -> Vec<Uid> {
        let mut uids = Vec::new();
        for group in self.content_groups {
            uids.extend(group.contents.into_iter().map(|c| c.uid));
            uids.push(group.uid);
        }
        uids.extend(self.certificates.into_iter().map(|c| c.uid));
        uids.push(self.uid);
        uids
    }
}

fn response_errors(body: &JsonValue) -> Option<String> {
    let errors = body.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    let messages: Vec<String> = errors
        .iter()
        .map(|e| {
            e.get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
                .unwrap_or_else(|| e.to_string())
        })
        .collect();
    Some(messages.join("; "))
}

// ============================================================================
// Query rendering
// ============================================================================

fn hash_lookup_query(hashes: &[String]) -> Result<String> {
    let quoted = hashes
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(format!(
        "{{ documents(func: eq(hash, [{}])) {{ uid hash }} }}",
        quoted.join(", ")
    ))
}

/// Deleted documents lose their type but edges into them survive
const LIVE_DOCUMENT: &str = "@filter(type(Document))";

fn document_predicates(options: &QueryOptions) -> String {
    let mut predicates = String::from("uid hash creator created_date");

    if options.content_groups {
        predicates.push_str(&format!(
            " content_groups (orderasc: content_group_sequence) {{
                content_group_sequence
                contents (orderasc: content_sequence) {{
                    content_sequence label value type
                    document {} {{ uid hash }}
                }}
            }}",
            LIVE_DOCUMENT
        ));
    }
    if options.certificates {
        predicates.push_str(
            " certificates (orderasc: certification_sequence) {
                uid certifier notes certification_date certification_sequence
            }",
        );
    }

    predicates
}

fn document_selection(options: &QueryOptions) -> String {
    let predicates = document_predicates(options);
    let edges: String = options
        .edges
        .iter()
        .map(|edge| format!(" {} {} {{ {} }}", edge, LIVE_DOCUMENT, predicates))
        .collect();
    format!("{{ {}{} }}", predicates, edges)
}

fn render_document_query(filter: &DocumentFilter, options: &QueryOptions) -> (String, JsonValue) {
    let selection = document_selection(options);

    match filter {
        DocumentFilter::Hash(hash) => (
            format!(
                "query documents($hash: string) {{ documents(func: eq(hash, $hash)) {} }}",
                selection
            ),
            json!({ "$hash": hash }),
        ),
        DocumentFilter::Uid(uid) => (
            format!(
                "query documents($uid: string) {{ documents(func: uid($uid)) {} {} }}",
                LIVE_DOCUMENT, selection
            ),
            json!({ "$uid": uid }),
        ),
        DocumentFilter::Creator(creator) => (
            format!(
                "query documents($creator: string) {{ documents(func: eq(creator, $creator)) {} }}",
                selection
            ),
            json!({ "$creator": creator }),
        ),
        DocumentFilter::EdgeTarget(edge) => (
            format!(
                "{{ var(func: has({edge})) {{ matched as {edge} {{ uid }} }} documents(func: uid(matched)) {live} {selection} }}",
                edge = edge,
                live = LIVE_DOCUMENT,
                selection = selection
            ),
            json!({}),
        ),
    }
}

// ============================================================================
// Mutation rendering
// ============================================================================

fn insert_non_empty(map: &mut Map<String, JsonValue>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

fn content_json(content: &ContentNode) -> JsonValue {
    let mut map = Map::new();
    map.insert("dgraph.type".into(), json!(CONTENT_TYPE));
    map.insert("label".into(), json!(content.label));
    map.insert("value".into(), json!(content.value));
    map.insert("type".into(), json!(content.content_type));
    map.insert("content_sequence".into(), json!(content.content_sequence));
    if let Some(target) = &content.document {
        map.insert("document".into(), json!({ "uid": target }));
    }
    JsonValue::Object(map)
}

fn certificate_json(certificate: &CertificateNode) -> JsonValue {
    let mut map = Map::new();
    map.insert("dgraph.type".into(), json!(CERTIFICATE_TYPE));
    map.insert("certifier".into(), json!(certificate.certifier));
    map.insert("notes".into(), json!(certificate.notes));
    insert_non_empty(&mut map, "certification_date", &certificate.certification_date);
    map.insert(
        "certification_sequence".into(),
        json!(certificate.certification_sequence),
    );
    JsonValue::Object(map)
}

fn document_json(document: &NewDocument) -> JsonValue {
    let groups: Vec<JsonValue> = document
        .content_groups
        .iter()
        .map(|group| {
            json!({
                "dgraph.type": CONTENT_GROUP_TYPE,
                "content_group_sequence": group.content_group_sequence,
                "contents": group.contents.iter().map(content_json).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut map = Map::new();
    map.insert("uid".into(), json!(format!("_:{}", DOCUMENT_BLANK_NODE)));
    map.insert("dgraph.type".into(), json!(DOCUMENT_TYPE));
    map.insert("hash".into(), json!(document.hash));
    map.insert("creator".into(), json!(document.creator));
    insert_non_empty(&mut map, "created_date", &document.created_date);
    map.insert("content_groups".into(), JsonValue::Array(groups));
    map.insert(
        "certificates".into(),
        JsonValue::Array(document.certificates.iter().map(certificate_json).collect()),
    );
    JsonValue::Object(map)
}

fn edge_json(from: &Uid, to: &Uid, predicate: &str) -> JsonValue {
    let mut map = Map::new();
    map.insert("uid".into(), json!(from));
    map.insert(predicate.to_string(), json!({ "uid": to }));
    JsonValue::Object(map)
}
