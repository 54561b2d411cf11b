//! Sink-side index abstraction.
//!
//! [`SearchIndex`] is what the loader writes into. Two implementations
//! exist: [`crate::connector_search::SearchIndexConnector`] talks to
//! OpenSearch or Elasticsearch over HTTP, and [`InMemoryIndex`] keeps
//! documents in a map for dry runs and tests.
//!
//! Writes are upserts keyed by document id, so re-submitting the same
//! document leaves one copy in the index.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::NormalizedDocument;

/// Per-document result of a bulk write. `error` is `None` on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Create `index` if it does not exist. `dims` adds a vector mapping.
    async fn ensure_index(&self, index: &str, dims: Option<usize>) -> Result<()>;

    async fn upsert(&self, index: &str, doc: &NormalizedDocument) -> Result<()>;

    /// Write many documents in one request. The returned outcomes follow
    /// the order of `docs`. An `Err` means the whole request failed.
    async fn bulk_upsert(&self, index: &str, docs: &[NormalizedDocument])
        -> Result<Vec<ItemOutcome>>;

    async fn count(&self, index: &str) -> Result<usize>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>>;
}

/// Index kept in process memory.
pub struct InMemoryIndex {
    indices: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
        }
    }

    fn write(&self, index: &str, doc: &NormalizedDocument) -> Result<()> {
        let mut indices = self
            .indices
            .write()
            .map_err(|_| Error::permanent("in-memory index lock poisoned"))?;
        indices
            .entry(index.to_string())
            .or_default()
            .insert(doc.id.clone(), doc.to_index_body());
        Ok(())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_index(&self, index: &str, _dims: Option<usize>) -> Result<()> {
        let mut indices = self
            .indices
            .write()
            .map_err(|_| Error::permanent("in-memory index lock poisoned"))?;
        indices.entry(index.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, index: &str, doc: &NormalizedDocument) -> Result<()> {
        self.write(index, doc)
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        docs: &[NormalizedDocument],
    ) -> Result<Vec<ItemOutcome>> {
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            self.write(index, doc)?;
            outcomes.push(ItemOutcome::ok(&doc.id));
        }
        Ok(outcomes)
    }

    async fn count(&self, index: &str) -> Result<usize> {
        let indices = self
            .indices
            .read()
            .map_err(|_| Error::permanent("in-memory index lock poisoned"))?;
        Ok(indices.get(index).map_or(0, HashMap::len))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let indices = self
            .indices
            .read()
            .map_err(|_| Error::permanent("in-memory index lock poisoned"))?;
        Ok(indices.get(index).and_then(|docs| docs.get(id)).cloned())
    }
}
