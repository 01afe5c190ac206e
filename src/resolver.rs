//! Hash → node id resolution

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::model::Uid;

/// Resolves document hashes to graph node ids in a single round trip
#[derive(Clone)]
pub struct HashResolver {
    graph: Arc<dyn GraphStore>,
}

impl HashResolver {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// Resolve a batch of hashes. Duplicates are queried once; hashes with no
    /// stored document are absent from the result.
    pub async fn resolve<I, S>(&self, hashes: I) -> Result<HashMap<String, Uid>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = hashes
            .into_iter()
            .map(|h| h.as_ref().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let hashes: Vec<String> = unique.into_iter().collect();
        self.graph.uids_by_hash(&hashes).await
    }

    pub async fn resolve_one(&self, hash: &str) -> Result<Option<Uid>> {
        Ok(self.resolve([hash]).await?.remove(hash))
    }
}
