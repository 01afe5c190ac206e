//! In-memory graph store
//!
//! Mirrors the node layout the indexer writes to Dgraph closely enough to run
//! the full pipeline without a database: `--dry-run` and the test suite both
//! use it. Node ids are allocated sequentially as `0x1`, `0x2`, ...
//!
//! By default deleting a document also drops every edge and content link that
//! pointed at it. [`MemoryGraph::keeping_dangling_edges`] instead leaves those
//! references in place the way Dgraph does; reads skip them either way.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{IndexerError, Result};
use crate::graph::GraphStore;
use crate::model::{
    CertificateNode, CertificateView, ContentGroupView, ContentView, DocumentRef, DocumentView,
    NewDocument, Uid,
};
use crate::query::{DocumentFilter, QueryOptions};
use crate::schema::SchemaUpdate;

/// Counters exposed for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub documents: usize,
    pub edges: usize,
    pub schema_updates: usize,
    pub mutations: usize,
}

#[derive(Debug)]
struct StoredContent {
    label: String,
    value: String,
    content_type: String,
    content_sequence: u32,
    document: Option<u64>,
}

#[derive(Debug)]
struct StoredGroup {
    content_group_sequence: u32,
    contents: Vec<StoredContent>,
}

#[derive(Debug)]
struct StoredCertificate {
    uid: u64,
    certifier: String,
    notes: String,
    certification_date: String,
    certification_sequence: u32,
}

#[derive(Debug)]
struct StoredDocument {
    hash: String,
    creator: String,
    created_date: String,
    content_groups: Vec<StoredGroup>,
    certificates: Vec<StoredCertificate>,
    edges: BTreeMap<String, BTreeSet<u64>>,
}

#[derive(Debug, Default)]
struct GraphState {
    last_uid: u64,
    predicates: BTreeSet<String>,
    types: BTreeMap<String, Vec<String>>,
    documents: BTreeMap<u64, StoredDocument>,
    by_hash: HashMap<String, u64>,
    schema_updates: usize,
    mutations: usize,
    failures_pending: usize,
    /// Hash lists received by `uids_by_hash`, in call order
    lookups: Vec<Vec<String>>,
}

impl GraphState {
    fn allocate(&mut self) -> u64 {
        self.last_uid += 1;
        self.last_uid
    }

    /// Count a mutation, failing it if a failure was injected
    fn begin_mutation(&mut self) -> Result<()> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(IndexerError::GraphResponse("injected mutation failure".into()));
        }
        self.mutations += 1;
        Ok(())
    }

    fn document(&self, uid: &Uid) -> Result<(u64, &StoredDocument)> {
        let id = parse_uid(uid)?;
        self.documents
            .get(&id)
            .map(|doc| (id, doc))
            .ok_or_else(|| IndexerError::GraphResponse(format!("no document with uid {}", uid)))
    }

    fn document_ref(&self, id: u64) -> Option<DocumentRef> {
        self.documents.get(&id).map(|doc| DocumentRef {
            uid: format_uid(id),
            hash: doc.hash.clone(),
        })
    }

    fn view(&self, id: u64, options: &QueryOptions, expand_edges: bool) -> Option<DocumentView> {
        let doc = self.documents.get(&id)?;

        let mut view = DocumentView {
            uid: format_uid(id),
            hash: doc.hash.clone(),
            creator: doc.creator.clone(),
            created_date: doc.created_date.clone(),
            ..Default::default()
        };

        if options.content_groups {
            view.content_groups = doc
                .content_groups
                .iter()
                .map(|group| ContentGroupView {
                    content_group_sequence: group.content_group_sequence,
                    contents: group
                        .contents
                        .iter()
                        .map(|content| ContentView {
                            content_sequence: content.content_sequence,
                            label: content.label.clone(),
                            value: content.value.clone(),
                            content_type: content.content_type.clone(),
                            document: content
                                .document
                                .and_then(|target| self.document_ref(target))
                                .into_iter()
                                .collect(),
                        })
                        .collect(),
                })
                .collect();
            view.content_groups.sort_by_key(|g| g.content_group_sequence);
            for group in &mut view.content_groups {
                group.contents.sort_by_key(|c| c.content_sequence);
            }
        }

        if options.certificates {
            view.certificates = doc
                .certificates
                .iter()
                .map(|cert| CertificateView {
                    uid: format_uid(cert.uid),
                    certifier: cert.certifier.clone(),
                    notes: cert.notes.clone(),
                    certification_date: cert.certification_date.clone(),
                    certification_sequence: cert.certification_sequence,
                })
                .collect();
            view.certificates.sort_by_key(|c| c.certification_sequence);
        }

        if expand_edges {
            for edge in &options.edges {
                let targets: Vec<DocumentView> = doc
                    .edges
                    .get(edge)
                    .into_iter()
                    .flatten()
                    .filter_map(|target| self.view(*target, options, false))
                    .collect();
                if !targets.is_empty() {
                    view.edges.insert(edge.clone(), targets);
                }
            }
        }

        Some(view)
    }

    fn matching(&self, filter: &DocumentFilter) -> Result<Vec<u64>> {
        let ids = match filter {
            DocumentFilter::Hash(hash) => self.by_hash.get(hash).copied().into_iter().collect(),
            DocumentFilter::Uid(uid) => {
                let id = parse_uid(uid)?;
                if self.documents.contains_key(&id) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            DocumentFilter::Creator(creator) => self
                .documents
                .iter()
                .filter(|(_, doc)| doc.creator == *creator)
                .map(|(id, _)| *id)
                .collect(),
            DocumentFilter::EdgeTarget(edge) => {
                let targets: BTreeSet<u64> = self
                    .documents
                    .values()
                    .filter_map(|doc| doc.edges.get(edge))
                    .flatten()
                    .copied()
                    .filter(|id| self.documents.contains_key(id))
                    .collect();
                targets.into_iter().collect()
            }
        };
        Ok(ids)
    }
}

fn format_uid(id: u64) -> Uid {
    Uid(format!("{:#x}", id))
}

fn parse_uid(uid: &Uid) -> Result<u64> {
    uid.as_str()
        .strip_prefix("0x")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| IndexerError::GraphResponse(format!("malformed uid {}", uid)))
}

fn stored_certificate(uid: u64, certificate: &CertificateNode) -> StoredCertificate {
    StoredCertificate {
        uid,
        certifier: certificate.certifier.clone(),
        notes: certificate.notes.clone(),
        certification_date: certificate.certification_date.clone(),
        certification_sequence: certificate.certification_sequence,
    }
}

#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    keep_dangling: bool,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph whose deletes leave incoming edges and links pointing at the
    /// removed node
    pub fn keeping_dangling_edges() -> Self {
        Self {
            keep_dangling: true,
            ..Self::default()
        }
    }

    fn with_state<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut GraphState) -> Result<R>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| IndexerError::Graph(format!("Lock poisoned: {}", e)))?;
        f(&mut state)
    }

    /// Make the next `count` mutations fail with a graph response error
    pub fn inject_failures(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failures_pending = count;
        }
    }

    /// Every hash list passed to `uids_by_hash` so far
    pub fn lookups(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .map(|state| state.lookups.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state
            .lock()
            .map(|state| MemoryStats {
                documents: state.documents.len(),
                edges: state
                    .documents
                    .values()
                    .flat_map(|doc| doc.edges.values())
                    .map(|targets| targets.len())
                    .sum(),
                schema_updates: state.schema_updates,
                mutations: state.mutations,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn types_exist(&self, types: &[&str]) -> Result<bool> {
        self.with_state(|state| Ok(types.iter().all(|t| state.types.contains_key(*t))))
    }

    async fn apply_schema(&self, update: &SchemaUpdate) -> Result<()> {
        self.with_state(|state| {
            for predicate in &update.predicates {
                state.predicates.insert(predicate.name.clone());
            }
            for ty in &update.types {
                state.types.insert(ty.name.clone(), ty.fields.clone());
            }
            state.schema_updates += 1;
            Ok(())
        })
    }

    async fn type_fields(&self, type_name: &str) -> Result<Vec<String>> {
        self.with_state(|state| Ok(state.types.get(type_name).cloned().unwrap_or_default()))
    }

    async fn uids_by_hash(&self, hashes: &[String]) -> Result<HashMap<String, Uid>> {
        self.with_state(|state| {
            state.lookups.push(hashes.to_vec());
            Ok(hashes
                .iter()
                .filter_map(|hash| {
                    state
                        .by_hash
                        .get(hash)
                        .map(|id| (hash.clone(), format_uid(*id)))
                })
                .collect())
        })
    }

    async fn certificate_count(&self, uid: &Uid) -> Result<usize> {
        self.with_state(|state| {
            let id = parse_uid(uid)?;
            Ok(state
                .documents
                .get(&id)
                .map(|doc| doc.certificates.len())
                .unwrap_or(0))
        })
    }

    async fn find_documents(
        &self,
        filter: &DocumentFilter,
        options: &QueryOptions,
    ) -> Result<Vec<DocumentView>> {
        self.with_state(|state| {
            Ok(state
                .matching(filter)?
                .into_iter()
                .filter_map(|id| state.view(id, options, true))
                .collect())
        })
    }

    async fn create_document(&self, document: &NewDocument) -> Result<Uid> {
        self.with_state(|state| {
            state.begin_mutation()?;

            if state.by_hash.contains_key(&document.hash) {
                return Err(IndexerError::GraphResponse(format!(
                    "document {} already stored",
                    document.hash
                )));
            }

            let id = state.allocate();
            let mut content_groups = Vec::with_capacity(document.content_groups.len());
            for group in &document.content_groups {
                state.allocate();
                let mut contents = Vec::with_capacity(group.contents.len());
                for content in &group.contents {
                    state.allocate();
                    let target = content.document.as_ref().map(parse_uid).transpose()?;
                    contents.push(StoredContent {
                        label: content.label.clone(),
                        value: content.value.clone(),
                        content_type: content.content_type.clone(),
                        content_sequence: content.content_sequence,
                        document: target,
                    });
                }
                content_groups.push(StoredGroup {
                    content_group_sequence: group.content_group_sequence,
                    contents,
                });
            }

            let certificates = document
                .certificates
                .iter()
                .map(|cert| {
                    let uid = state.allocate();
                    stored_certificate(uid, cert)
                })
                .collect();

            state.documents.insert(
                id,
                StoredDocument {
                    hash: document.hash.clone(),
                    creator: document.creator.clone(),
                    created_date: document.created_date.clone(),
                    content_groups,
                    certificates,
                    edges: BTreeMap::new(),
                },
            );
            state.by_hash.insert(document.hash.clone(), id);

            Ok(format_uid(id))
        })
    }

    async fn append_certificates(&self, uid: &Uid, certificates: &[CertificateNode]) -> Result<()> {
        self.with_state(|state| {
            state.begin_mutation()?;
            let (id, _) = state.document(uid)?;

            let stored: Vec<StoredCertificate> = certificates
                .iter()
                .map(|cert| {
                    let cert_uid = state.allocate();
                    stored_certificate(cert_uid, cert)
                })
                .collect();

            if let Some(doc) = state.documents.get_mut(&id) {
                doc.certificates.extend(stored);
            }
            Ok(())
        })
    }

    async fn set_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()> {
        self.with_state(|state| {
            state.begin_mutation()?;

            if !state.predicates.contains(predicate) {
                return Err(IndexerError::GraphResponse(format!(
                    "predicate {} is not declared",
                    predicate
                )));
            }
            let (target, _) = state.document(to)?;
            let (source, _) = state.document(from)?;

            if let Some(doc) = state.documents.get_mut(&source) {
                doc.edges.entry(predicate.to_string()).or_default().insert(target);
            }
            Ok(())
        })
    }

    async fn remove_edge(&self, from: &Uid, to: &Uid, predicate: &str) -> Result<()> {
        self.with_state(|state| {
            state.begin_mutation()?;
            let source = parse_uid(from)?;
            let target = parse_uid(to)?;

            if let Some(doc) = state.documents.get_mut(&source) {
                if let Some(targets) = doc.edges.get_mut(predicate) {
                    targets.remove(&target);
                    if targets.is_empty() {
                        doc.edges.remove(predicate);
                    }
                }
            }
            Ok(())
        })
    }

    async fn delete_subtree(&self, uid: &Uid) -> Result<()> {
        self.with_state(|state| {
            state.begin_mutation()?;
            let id = parse_uid(uid)?;

            let Some(removed) = state.documents.remove(&id) else {
                return Ok(());
            };
            state.by_hash.remove(&removed.hash);
            if self.keep_dangling {
                return Ok(());
            }

            for doc in state.documents.values_mut() {
                doc.edges.retain(|_, targets| {
                    targets.remove(&id);
                    !targets.is_empty()
                });
                for content in doc.content_groups.iter_mut().flat_map(|g| g.contents.iter_mut()) {
                    if content.document == Some(id) {
                        content.document = None;
                    }
                }
            }
            Ok(())
        })
    }
}
