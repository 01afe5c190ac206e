//! Document transformer
//!
//! Turns chain document records into graph subtrees. A document's hash is its
//! identity: the first record for a hash creates the full subtree, later
//! records for the same hash can only append certificates.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::graph::GraphStore;
use crate::metrics;
use crate::model::{
    CertificateNode, ChainCertificate, ChainDocument, ContentGroupNode, ContentNode, NewDocument, Uid,
};
use crate::resolver::HashResolver;

/// Result of applying a document record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { uid: Uid },
    /// The document existed; `appended` certificates were added
    Updated { uid: Uid, appended: usize },
    /// The record had no content groups and was dropped
    Invalid,
}

/// Result of applying a document removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { uid: Uid },
    /// No stored document had that hash
    Missing,
}

/// Build the node subtree for a first insertion.
///
/// Content groups and contents are numbered by their position in the record,
/// certificates from 0. Hash references are left unlinked. Returns `None` for
/// a record without content groups.
pub fn build_document(record: &ChainDocument) -> Option<NewDocument> {
    if !record.is_valid() {
        return None;
    }

    let content_groups = record
        .content_groups
        .iter()
        .flatten()
        .enumerate()
        .map(|(group_index, group)| ContentGroupNode {
            content_group_sequence: group_index as u32,
            contents: group
                .iter()
                .enumerate()
                .map(|(content_index, content)| ContentNode {
                    label: content.label.clone(),
                    value: content.value.value.clone(),
                    content_type: content.value.kind.clone(),
                    content_sequence: content_index as u32,
                    document: None,
                })
                .collect(),
        })
        .collect();

    Some(NewDocument {
        hash: record.hash.clone(),
        creator: record.creator.clone(),
        created_date: record.created_date.clone(),
        content_groups,
        certificates: certificates_from(&record.certificates, 0),
    })
}

/// Certificates at positions `>= start`, sequenced by their position
pub fn certificates_from(certificates: &[ChainCertificate], start: usize) -> Vec<CertificateNode> {
    certificates
        .iter()
        .enumerate()
        .skip(start)
        .map(|(index, cert)| CertificateNode {
            certifier: cert.certifier.clone(),
            notes: cert.notes.clone(),
            certification_date: cert.certification_date.clone(),
            certification_sequence: index as u32,
        })
        .collect()
}

#[derive(Clone)]
pub struct DocumentTransformer {
    graph: Arc<dyn GraphStore>,
    resolver: HashResolver,
}

impl DocumentTransformer {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        let resolver = HashResolver::new(graph.clone());
        Self { graph, resolver }
    }

    pub async fn upsert(&self, record: &ChainDocument) -> Result<UpsertOutcome> {
        match self.resolver.resolve_one(&record.hash).await? {
            Some(uid) => self.update(uid, record).await,
            None => self.create(record).await,
        }
    }

    async fn create(&self, record: &ChainDocument) -> Result<UpsertOutcome> {
        let Some(mut document) = build_document(record) else {
            warn!(hash = %record.hash, "Document has no content groups, skipping");
            metrics::document_invalid();
            return Ok(UpsertOutcome::Invalid);
        };

        self.link_references(&mut document).await?;

        let uid = self.graph.create_document(&document).await?;
        info!(
            hash = %document.hash,
            uid = %uid,
            groups = document.content_groups.len(),
            certificates = document.certificates.len(),
            "Created document"
        );
        metrics::document_created();

        Ok(UpsertOutcome::Created { uid })
    }

    async fn update(&self, uid: Uid, record: &ChainDocument) -> Result<UpsertOutcome> {
        let stored = self.graph.certificate_count(&uid).await?;
        let appended = certificates_from(&record.certificates, stored);

        if !appended.is_empty() {
            self.graph.append_certificates(&uid, &appended).await?;
        }

        info!(
            hash = %record.hash,
            uid = %uid,
            appended = appended.len(),
            "Updated document"
        );
        metrics::document_updated();

        Ok(UpsertOutcome::Updated {
            uid,
            appended: appended.len(),
        })
    }

    /// Point hash-typed contents at documents that already exist
    async fn link_references(&self, document: &mut NewDocument) -> Result<()> {
        let hashes: Vec<String> = document
            .contents_mut()
            .filter(|c| c.is_hash_reference())
            .map(|c| c.value.clone())
            .collect();

        if hashes.is_empty() {
            return Ok(());
        }

        let resolved = self.resolver.resolve(&hashes).await?;
        debug!(
            hash = %document.hash,
            references = hashes.len(),
            resolved = resolved.len(),
            "Linked content references"
        );

        for content in document.contents_mut().filter(|c| c.is_hash_reference()) {
            content.document = resolved.get(&content.value).cloned();
        }
        Ok(())
    }

    pub async fn delete(&self, record: &ChainDocument) -> Result<DeleteOutcome> {
        let Some(uid) = self.resolver.resolve_one(&record.hash).await? else {
            debug!(hash = %record.hash, "Document to delete not found");
            return Ok(DeleteOutcome::Missing);
        };

        self.graph.delete_subtree(&uid).await?;
        info!(hash = %record.hash, uid = %uid, "Deleted document");
        metrics::document_deleted();

        Ok(DeleteOutcome::Deleted { uid })
    }
}
