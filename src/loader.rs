//! Writing documents into the sink index.
//!
//! Two ingestors share the [`Ingestor`] trait:
//!
//! - [`SingleIngestor`] issues one upsert per document.
//! - [`BulkIngestor`] groups documents into sub-batches bounded by count
//!   and serialized size and submits each with one `_bulk` request.
//!
//! Both embed documents that lack a vector when `require_vectors` is set.
//! An embedding failure marks only that document as failed.
//!
//! Cancellation is checked before every request. Documents not yet sent
//! when it fires are reported as `not_submitted`; a request that has
//! already been sent is awaited, so the report always says exactly which
//! documents were committed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{IngestMode, SinkConfig};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::index::SearchIndex;
use crate::models::{ItemFailure, NormalizedDocument};
use crate::resilience::Resilience;

/// Per-document result of an ingest call.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    /// Ids the sink acknowledged.
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemFailure>,
    /// Ids never sent because the run was cancelled.
    pub not_submitted: Vec<String>,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.not_submitted.len()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.not_submitted.extend(other.not_submitted);
    }

    /// `Err(PartialIngest)` when any document failed.
    pub fn into_result(self) -> Result<IngestReport> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialIngest {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }

    fn fail(&mut self, id: &str, reason: impl Into<String>) {
        self.failed.push(ItemFailure {
            id: id.to_string(),
            reason: reason.into(),
        });
    }
}

#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest_documents(
        &self,
        docs: Vec<NormalizedDocument>,
        cancel: &CancellationToken,
    ) -> IngestReport;
}

// ═══════════════════════════════════════════════════════════════════════
// Embedding stage
// ═══════════════════════════════════════════════════════════════════════

/// Fills in missing vectors before submission.
#[derive(Clone)]
pub struct EmbeddingStage {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingStage {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Embed every document that has text but no vector. Returns the
    /// documents ready for submission and the ones that failed.
    pub async fn prepare(
        &self,
        mut docs: Vec<NormalizedDocument>,
    ) -> (Vec<NormalizedDocument>, Vec<ItemFailure>) {
        let pending: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.vector.is_none() && d.is_embeddable())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return (docs, Vec::new());
        }

        let texts: Vec<String> = pending
            .iter()
            .map(|&i| docs[i].text.clone().unwrap_or_default())
            .collect();
        let mut failed_at = Vec::new();
        let mut failures = Vec::new();
        match self.embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == pending.len() => {
                for (&i, v) in pending.iter().zip(vectors) {
                    docs[i].vector = Some(v);
                }
            }
            batch_result => {
                if let Err(e) = &batch_result {
                    warn!(docs = pending.len(), error = %e.report(), "batch embedding failed, embedding one by one");
                }
                for (&i, text) in pending.iter().zip(texts) {
                    match self.embedder.embed(std::slice::from_ref(&text)).await {
                        Ok(mut v) if v.len() == 1 => docs[i].vector = v.pop(),
                        Ok(v) => {
                            failed_at.push(i);
                            failures.push(ItemFailure {
                                id: docs[i].id.clone(),
                                reason: format!("embedder returned {} vectors for 1 text", v.len()),
                            });
                        }
                        Err(e) => {
                            failed_at.push(i);
                            failures.push(ItemFailure {
                                id: docs[i].id.clone(),
                                reason: format!("embedding failed: {}", e.report()),
                            });
                        }
                    }
                }
            }
        }

        if !failed_at.is_empty() {
            let mut i = 0;
            docs.retain(|_| {
                let keep = !failed_at.contains(&i);
                i += 1;
                keep
            });
        }
        (docs, failures)
    }
}

async fn embed_if_configured(
    stage: Option<&EmbeddingStage>,
    docs: Vec<NormalizedDocument>,
    report: &mut IngestReport,
) -> Vec<NormalizedDocument> {
    match stage {
        Some(stage) => {
            let (ready, failures) = stage.prepare(docs).await;
            report.failed.extend(failures);
            ready
        }
        None => docs,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Single
// ═══════════════════════════════════════════════════════════════════════

pub struct SingleIngestor {
    index: Arc<dyn SearchIndex>,
    index_name: String,
    resilience: Resilience,
    embedding: Option<EmbeddingStage>,
}

impl SingleIngestor {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        index_name: &str,
        resilience: Resilience,
        embedding: Option<EmbeddingStage>,
    ) -> Self {
        Self {
            index,
            index_name: index_name.to_string(),
            resilience,
            embedding,
        }
    }

    /// Upsert one document, embedding it first if required.
    pub async fn ingest(&self, doc: NormalizedDocument) -> Result<()> {
        let doc = match &self.embedding {
            Some(stage) => {
                let (mut ready, failures) = stage.prepare(vec![doc]).await;
                if let Some(f) = failures.into_iter().next() {
                    return Err(Error::permanent(f.reason));
                }
                ready.pop().ok_or_else(|| Error::permanent("document lost during embedding"))?
            }
            None => doc,
        };
        self.resilience
            .call("upsert", || self.index.upsert(&self.index_name, &doc))
            .await
    }
}

#[async_trait]
impl Ingestor for SingleIngestor {
    async fn ingest_documents(
        &self,
        docs: Vec<NormalizedDocument>,
        cancel: &CancellationToken,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let mut docs = docs.into_iter();
        while let Some(doc) = docs.next() {
            if cancel.is_cancelled() {
                report.not_submitted.push(doc.id);
                report.not_submitted.extend(docs.map(|d| d.id));
                break;
            }
            let id = doc.id.clone();
            match self.ingest(doc).await {
                Ok(()) => report.succeeded.push(id),
                Err(e) => {
                    warn!(doc = %id, error = %e.report(), "upsert failed");
                    report.fail(&id, e.report());
                }
            }
        }
        report
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Bulk
// ═══════════════════════════════════════════════════════════════════════

/// Fixed per-document overhead of the NDJSON action line.
const ACTION_LINE_BYTES: usize = 96;

pub struct BulkIngestor {
    index: Arc<dyn SearchIndex>,
    index_name: String,
    resilience: Resilience,
    embedding: Option<EmbeddingStage>,
    batch_size: usize,
    max_batch_bytes: usize,
    resubmit_failed: u32,
}

impl BulkIngestor {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        index_name: &str,
        resilience: Resilience,
        embedding: Option<EmbeddingStage>,
    ) -> Self {
        Self {
            index,
            index_name: index_name.to_string(),
            resilience,
            embedding,
            batch_size: 500,
            max_batch_bytes: 10 * 1024 * 1024,
            resubmit_failed: 0,
        }
    }

    pub fn with_limits(mut self, batch_size: usize, max_batch_bytes: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    pub fn with_resubmit(mut self, times: u32) -> Self {
        self.resubmit_failed = times;
        self
    }

    /// Embed, split and submit `docs`, reporting every document's fate.
    pub async fn ingest_batch(
        &self,
        docs: Vec<NormalizedDocument>,
        cancel: &CancellationToken,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let docs = embed_if_configured(self.embedding.as_ref(), docs, &mut report).await;

        let mut batches = split_batches(docs, self.batch_size, self.max_batch_bytes).into_iter();
        while let Some(batch) = batches.next() {
            if cancel.is_cancelled() {
                report.not_submitted.extend(batch.into_iter().map(|d| d.id));
                report
                    .not_submitted
                    .extend(batches.flatten().map(|d| d.id));
                info!(not_submitted = report.not_submitted.len(), "cancelled before submitting remaining documents");
                break;
            }
            self.submit(batch, cancel, &mut report).await;
        }
        report
    }

    async fn submit(
        &self,
        mut batch: Vec<NormalizedDocument>,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) {
        let mut round = 0u32;
        loop {
            debug!(docs = batch.len(), round, "submitting bulk request");
            let outcomes = match self
                .resilience
                .call("bulk upsert", || self.index.bulk_upsert(&self.index_name, &batch))
                .await
            {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!(docs = batch.len(), error = %e.report(), "bulk request failed");
                    for doc in &batch {
                        report.fail(&doc.id, e.report());
                    }
                    return;
                }
            };

            if outcomes.len() != batch.len() {
                warn!(docs = batch.len(), outcomes = outcomes.len(), "sink returned a mismatched bulk report");
            }
            let mut outcomes = outcomes.into_iter();
            let mut retry = Vec::new();
            let mut reasons = Vec::new();
            for doc in batch {
                match outcomes.next().map(|o| o.error) {
                    Some(None) => report.succeeded.push(doc.id),
                    Some(Some(reason)) => {
                        reasons.push(reason);
                        retry.push(doc);
                    }
                    None => report.fail(&doc.id, "no outcome returned by sink"),
                }
            }
            if retry.is_empty() {
                return;
            }
            if round >= self.resubmit_failed || cancel.is_cancelled() {
                for (doc, reason) in retry.iter().zip(reasons) {
                    report.fail(&doc.id, reason);
                }
                warn!(failed = retry.len(), "bulk items rejected by the sink");
                return;
            }
            round += 1;
            batch = retry;
        }
    }
}

#[async_trait]
impl Ingestor for BulkIngestor {
    async fn ingest_documents(
        &self,
        docs: Vec<NormalizedDocument>,
        cancel: &CancellationToken,
    ) -> IngestReport {
        self.ingest_batch(docs, cancel).await
    }
}

/// Group documents into batches of at most `max_docs` documents and about
/// `max_bytes` of request body. An oversized document travels alone.
pub fn split_batches(
    docs: Vec<NormalizedDocument>,
    max_docs: usize,
    max_bytes: usize,
) -> Vec<Vec<NormalizedDocument>> {
    let max_docs = max_docs.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;
    for doc in docs {
        let size = doc.to_index_body().to_string().len() + ACTION_LINE_BYTES;
        if !current.is_empty() && (current.len() >= max_docs || current_bytes + size > max_bytes) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(doc);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Build the ingestor selected by `sink.mode`.
pub fn create_ingestor(
    sink: &SinkConfig,
    index: Arc<dyn SearchIndex>,
    resilience: Resilience,
    embedder: Option<Arc<dyn Embedder>>,
) -> Box<dyn Ingestor> {
    let embedding = if sink.require_vectors {
        embedder.map(EmbeddingStage::new)
    } else {
        None
    };
    match sink.mode {
        IngestMode::Single => Box::new(SingleIngestor::new(index, &sink.index, resilience, embedding)),
        IngestMode::Bulk => Box::new(
            BulkIngestor::new(index, &sink.index, resilience, embedding)
                .with_limits(sink.batch_size, sink.max_batch_bytes)
                .with_resubmit(sink.resubmit_failed),
        ),
    }
}
