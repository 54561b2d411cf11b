//! Raw records → normalized documents.
//!
//! Two transformers cover the source shapes:
//!
//! - [`StructuredTransformer`] maps the columns of a row onto metadata and
//!   joins the configured text columns.
//! - [`UnstructuredTransformer`] parses a document body or a MIME message
//!   into text, splits attachments out (or merges them in) and optionally
//!   chunks long texts.
//!
//! A record that cannot be transformed is reported as a [`SkippedRecord`];
//! the rest of the batch is unaffected.

use std::sync::Arc;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::chunk::{chunk_text, chunk_windows, Chunk};
use crate::config::{AttachmentMode, StructuredOptions, TransformConfig, UnstructuredOptions};
use crate::error::{Error, Result};
use crate::models::{MimePart, NormalizedDocument, RawAttachment, RawContent, RawRecord, SkippedRecord};
use crate::parse::{content_type_for, html_to_text, is_supported, parse_text, ParseError};

/// Gmail bodies are base64url, sometimes padded.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const RESERVED_KEYS: &[&str] = &["source", "source_id", "content_hash", "text", "vector"];

pub trait Transformer: Send + Sync {
    fn transform(&self, record: &RawRecord) -> Result<Vec<NormalizedDocument>>;
}

pub fn create_transformer(config: &TransformConfig) -> Arc<dyn Transformer> {
    match config {
        TransformConfig::Structured(opts) => Arc::new(StructuredTransformer::new(opts.clone())),
        TransformConfig::Unstructured(opts) => {
            Arc::new(UnstructuredTransformer::new(opts.clone()))
        }
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn doc_key(source: &str, source_id: &str) -> String {
    format!("{}:{}", source, source_id)
}

// ═══════════════════════════════════════════════════════════════════════
// Structured
// ═══════════════════════════════════════════════════════════════════════

pub struct StructuredTransformer {
    options: StructuredOptions,
}

impl StructuredTransformer {
    pub fn new(options: StructuredOptions) -> Self {
        Self { options }
    }
}

impl Transformer for StructuredTransformer {
    fn transform(&self, record: &RawRecord) -> Result<Vec<NormalizedDocument>> {
        let RawContent::Row(row) = &record.content else {
            return Err(Error::parse(&record.id, "structured transformer expects a row"));
        };

        let source_id = match &self.options.id_column {
            Some(col) => row
                .get(col)
                .and_then(value_to_text)
                .ok_or_else(|| Error::parse(&record.id, format!("id column '{}' is missing or null", col)))?,
            None => record.id.clone(),
        };

        let text = if self.options.text_columns.is_empty() {
            None
        } else {
            let mut parts = Vec::new();
            for col in &self.options.text_columns {
                let value = row.get(col).ok_or_else(|| {
                    Error::parse(&source_id, format!("text column '{}' not in row", col))
                })?;
                parts.extend(value_to_text(value));
            }
            Some(parts.join(&self.options.separator)).filter(|t| !t.trim().is_empty())
        };

        let mut doc =
            NormalizedDocument::new(&doc_key(&record.source, &source_id), &record.source, &source_id, text);
        let columns = row.iter().filter_map(|(col, v)| {
            if self.options.column_mapping.is_empty() {
                Some((col.clone(), v))
            } else {
                self.options.column_mapping.get(col).map(|name| (name.clone(), v))
            }
        });
        for (name, value) in columns {
            if !RESERVED_KEYS.contains(&name.as_str()) {
                doc.metadata.insert(name, value.clone());
            }
        }
        for (k, v) in &record.metadata {
            doc.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(vec![doc])
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Unstructured
// ═══════════════════════════════════════════════════════════════════════

pub struct UnstructuredTransformer {
    options: UnstructuredOptions,
}

/// Body text plus attachments pulled out of a record.
struct Parts {
    body: Option<String>,
    attachments: Vec<RawAttachment>,
}

impl UnstructuredTransformer {
    pub fn new(options: UnstructuredOptions) -> Self {
        Self { options }
    }

    fn check_size(&self, len: usize) -> std::result::Result<(), ParseError> {
        if len > self.options.max_part_bytes {
            return Err(ParseError::TooLarge {
                size: len,
                limit: self.options.max_part_bytes,
            });
        }
        Ok(())
    }

    fn split(&self, record: &RawRecord) -> Result<Parts> {
        match &record.content {
            RawContent::Row(_) => Err(Error::parse(
                &record.id,
                "unstructured transformer cannot handle rows",
            )),
            RawContent::Document {
                content_type,
                body,
                attachments,
            } => {
                self.check_size(body.len())
                    .map_err(|e| Error::parse(&record.id, e))?;
                let text = parse_text(body, content_type).map_err(|e| Error::parse(&record.id, e))?;
                Ok(Parts {
                    body: Some(text),
                    attachments: attachments.clone(),
                })
            }
            RawContent::Message(root) => {
                let mut walk = MessageWalk::default();
                walk.visit(root).map_err(|reason| Error::parse(&record.id, reason))?;
                let body = match (walk.plain, walk.html) {
                    (Some(plain), _) => Some(plain),
                    (None, Some(html)) => {
                        Some(html_to_text(&html).map_err(|e| Error::parse(&record.id, e))?)
                    }
                    (None, None) => None,
                };
                Ok(Parts {
                    body,
                    attachments: walk.attachments,
                })
            }
        }
    }

    fn prefix(&self, metadata: &Map<String, Value>) -> String {
        self.options
            .prepend_fields
            .iter()
            .filter_map(|f| metadata.get(f).and_then(value_to_text))
            .filter(|v| !v.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Expand `doc` into chunk documents when it exceeds `max_tokens` or
    /// spans more than one word window.
    fn chunked(&self, doc: NormalizedDocument, key: &str, out: &mut Vec<NormalizedDocument>) {
        let pieces = match doc.text.as_deref() {
            Some(text) => self.pieces(text),
            None => Vec::new(),
        };
        if pieces.len() <= 1 {
            out.push(doc);
            return;
        }
        let field = |name: &str| {
            doc.metadata
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let (source, source_id) = (field("source"), field("source_id"));
        for (i, (text, position)) in pieces.into_iter().enumerate() {
            let mut chunk = NormalizedDocument::new(
                &format!("{}#chunk{}", key, i),
                &source,
                &source_id,
                Some(text),
            );
            chunk.metadata.extend(position);
            for (k, v) in &doc.metadata {
                chunk.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
            chunk
                .metadata
                .entry("parent_id".to_string())
                .or_insert_with(|| Value::String(doc.id.clone()));
            chunk.metadata.insert("chunk_index".into(), Value::from(i));
            out.push(chunk);
        }
    }

    /// Chunk texts plus the position metadata each chunk carries.
    fn pieces(&self, text: &str) -> Vec<(String, Map<String, Value>)> {
        match (&self.options.window, self.options.max_tokens) {
            (Some(window), _) => chunk_windows(text, window)
                .into_iter()
                .map(|c| {
                    let position = chunk_position(&c);
                    (c.text, position)
                })
                .collect(),
            (None, Some(max_tokens)) => chunk_text(text, max_tokens)
                .into_iter()
                .map(|t| (t, Map::new()))
                .collect(),
            (None, None) => Vec::new(),
        }
    }
}

fn chunk_position(chunk: &Chunk) -> Map<String, Value> {
    let mut m = Map::new();
    if let Some(title) = &chunk.section_title {
        m.insert("section_title".into(), Value::String(title.clone()));
    }
    m.insert("word_count".into(), Value::from(chunk.word_count));
    m.insert("start_char".into(), Value::from(chunk.start_char));
    m.insert("end_char".into(), Value::from(chunk.end_char));
    m.insert("overlap_with_previous".into(), Value::from(chunk.overlap_with_previous));
    m.insert("overlap_with_next".into(), Value::from(chunk.overlap_with_next));
    m
}

impl Transformer for UnstructuredTransformer {
    fn transform(&self, record: &RawRecord) -> Result<Vec<NormalizedDocument>> {
        let parts = self.split(record)?;

        let mut attachment_texts = Vec::new();
        let mut attachment_errors: Vec<Value> = record
            .metadata
            .get("attachment_errors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for att in &parts.attachments {
            let ct = content_type_for(&att.content_type, Some(&att.name));
            if !is_supported(&ct) {
                debug!(record = %record.id, attachment = %att.name, content_type = %ct, "ignoring unsupported attachment");
                continue;
            }
            let parsed = self
                .check_size(att.data.len())
                .and_then(|_| parse_text(&att.data, &ct));
            match parsed {
                Ok(text) => attachment_texts.push((att, ct, text)),
                Err(e) => {
                    warn!(record = %record.id, attachment = %att.name, error = %e, "attachment parse failed");
                    attachment_errors.push(serde_json::json!({
                        "name": att.name,
                        "reason": e.to_string(),
                    }));
                }
            }
        }

        let prefix = self.prefix(&record.metadata);
        let mut text = match (prefix.is_empty(), parts.body) {
            (true, body) => body.unwrap_or_default(),
            (false, Some(body)) => format!("{}\n\n{}", prefix, body.trim()),
            (false, None) => prefix,
        };
        if self.options.attachments == AttachmentMode::Merge {
            for (att, _, att_text) in &attachment_texts {
                if !att_text.trim().is_empty() {
                    text.push_str(&format!("\n\n[attachment: {}]\n{}", att.name, att_text.trim()));
                }
            }
        }

        let key = doc_key(&record.source, &record.id);
        let text = Some(text.trim().to_string()).filter(|t| !t.is_empty());
        let mut parent = NormalizedDocument::new(&key, &record.source, &record.id, text);
        for (k, v) in &record.metadata {
            if !RESERVED_KEYS.contains(&k.as_str()) {
                parent.metadata.insert(k.clone(), v.clone());
            }
        }
        if attachment_errors.is_empty() {
            parent.metadata.remove("attachment_errors");
        } else {
            parent
                .metadata
                .insert("attachment_errors".into(), Value::Array(attachment_errors));
        }

        let mut docs = Vec::new();
        if self.options.attachments == AttachmentMode::Separate {
            for (i, (att, ct, att_text)) in attachment_texts.into_iter().enumerate() {
                let source_id = format!("{}/attachment/{}", record.id, i);
                let att_key = doc_key(&record.source, &source_id);
                let att_text = Some(att_text.trim().to_string()).filter(|t| !t.is_empty());
                let mut doc = NormalizedDocument::new(&att_key, &record.source, &source_id, att_text);
                doc.metadata
                    .insert("parent_id".into(), Value::String(parent.id.clone()));
                doc.metadata
                    .insert("attachment_name".into(), Value::String(att.name.clone()));
                doc.metadata.insert("content_type".into(), Value::String(ct));
                self.chunked(doc, &att_key, &mut docs);
            }
        }
        let mut out = Vec::with_capacity(docs.len() + 1);
        self.chunked(parent, &key, &mut out);
        out.extend(docs);
        Ok(out)
    }
}

/// Depth-first walk over a message part tree.
#[derive(Default)]
struct MessageWalk {
    plain: Option<String>,
    html: Option<String>,
    attachments: Vec<RawAttachment>,
}

impl MessageWalk {
    fn visit(&mut self, part: &MimePart) -> std::result::Result<(), String> {
        if part.is_attachment() {
            if let Some(data) = &part.body.data {
                let name = part.filename.clone().unwrap_or_default();
                let bytes = BASE64_URL
                    .decode(data.trim())
                    .map_err(|e| format!("attachment '{}' is not valid base64url: {}", name, e))?;
                self.attachments.push(RawAttachment {
                    name,
                    content_type: part.mime_type.clone(),
                    data: bytes,
                });
            }
            return Ok(());
        }
        let mime = part.mime_type.to_ascii_lowercase();
        if mime == "text/plain" || mime == "text/html" {
            if let Some(data) = &part.body.data {
                let bytes = BASE64_URL
                    .decode(data.trim())
                    .map_err(|e| format!("{} body is not valid base64url: {}", mime, e))?;
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let slot = if mime == "text/plain" {
                    &mut self.plain
                } else {
                    &mut self.html
                };
                if slot.is_none() {
                    *slot = Some(text);
                }
            }
        }
        for child in &part.parts {
            self.visit(child)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Batch helpers
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub documents: Vec<NormalizedDocument>,
    pub skipped: Vec<SkippedRecord>,
    /// Records that produced at least one document.
    pub transformed: usize,
}

impl TransformOutcome {
    fn absorb(&mut self, id: String, result: Result<Vec<NormalizedDocument>>) {
        match result {
            Ok(docs) => {
                if !docs.is_empty() {
                    self.transformed += 1;
                }
                self.documents.extend(docs);
            }
            Err(e) => {
                let reason = match e {
                    Error::RecordParse { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(record = %id, reason = %reason, "skipping record");
                self.skipped.push(SkippedRecord { id, reason });
            }
        }
    }
}

/// Transform `records` in order on the current thread.
pub fn transform_batch(transformer: &dyn Transformer, records: &[RawRecord]) -> TransformOutcome {
    let mut outcome = TransformOutcome::default();
    for record in records {
        outcome.absorb(record.id.clone(), transformer.transform(record));
    }
    outcome
}

/// Transform `records` on the blocking pool, at most `concurrency` at a
/// time. Output order follows input order.
pub async fn transform_concurrent(
    transformer: Arc<dyn Transformer>,
    records: Vec<RawRecord>,
    concurrency: usize,
) -> TransformOutcome {
    let results: Vec<(String, Result<Vec<NormalizedDocument>>)> = stream::iter(records)
        .map(|record| {
            let transformer = Arc::clone(&transformer);
            async move {
                let id = record.id.clone();
                let joined = tokio::task::spawn_blocking(move || transformer.transform(&record)).await;
                let result = joined
                    .unwrap_or_else(|e| Err(Error::parse(&id, format!("transform task failed: {}", e))));
                (id, result)
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = TransformOutcome::default();
    for (id, result) in results {
        outcome.absorb(id, result);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowOptions;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn b64(s: &[u8]) -> String {
        BASE64_URL.encode(s)
    }

    fn row_record(id: &str, row: Value) -> RawRecord {
        RawRecord {
            id: id.into(),
            source: "rdbms:articles".into(),
            metadata: Map::new(),
            content: RawContent::Row(row.as_object().unwrap().clone()),
        }
    }

    fn unstructured(mode: AttachmentMode) -> UnstructuredTransformer {
        UnstructuredTransformer::new(UnstructuredOptions {
            attachments: mode,
            ..Default::default()
        })
    }

    fn message(parts: Value) -> RawRecord {
        let mut metadata = Map::new();
        metadata.insert("subject".into(), json!("Weekly report"));
        RawRecord {
            id: "m1".into(),
            source: "gmail:inbox".into(),
            metadata,
            content: RawContent::Message(serde_json::from_value(parts).unwrap()),
        }
    }

    #[test]
    fn test_structured_mapping_and_text() {
        let t = StructuredTransformer::new(StructuredOptions {
            id_column: Some("id".into()),
            text_columns: vec!["title".into(), "body".into()],
            separator: " | ".into(),
            column_mapping: BTreeMap::from([
                ("title".to_string(), "headline".to_string()),
                ("id".to_string(), "article_id".to_string()),
            ]),
        });
        let docs = t
            .transform(&row_record(
                "0",
                json!({"id": 7, "title": "Hi", "body": "There", "secret": "x"}),
            ))
            .unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.text.as_deref(), Some("Hi | There"));
        assert_eq!(doc.metadata["headline"], "Hi");
        assert_eq!(doc.metadata["article_id"], 7);
        assert_eq!(doc.metadata["source_id"], "7");
        assert!(doc.metadata.get("secret").is_none());
        assert_eq!(doc.id, crate::models::document_id("rdbms:articles:7"));
    }

    #[test]
    fn test_structured_without_text_columns_has_no_text() {
        let t = StructuredTransformer::new(StructuredOptions::default());
        let docs = t.transform(&row_record("3", json!({"a": 1}))).unwrap();
        assert_eq!(docs[0].text, None);
        assert_eq!(docs[0].metadata["a"], 1);
        assert!(!docs[0].is_embeddable());
    }

    #[test]
    fn test_batch_with_malformed_record_skips_one() {
        let t = StructuredTransformer::new(StructuredOptions {
            id_column: Some("id".into()),
            text_columns: vec!["body".into()],
            ..Default::default()
        });
        let mut records: Vec<RawRecord> = (1..=4)
            .map(|i| row_record(&i.to_string(), json!({"id": i, "body": format!("row {}", i)})))
            .collect();
        records.insert(2, row_record("bad", json!({"body": "no id"})));
        let outcome = transform_batch(&t, &records);
        assert_eq!(outcome.documents.len(), 4);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].id, "bad");
        assert_eq!(outcome.transformed, 4);
    }

    struct EvenOnly;

    impl Transformer for EvenOnly {
        fn transform(&self, record: &RawRecord) -> Result<Vec<NormalizedDocument>> {
            let n: u32 = record.id.parse().map_err(|_| Error::parse(&record.id, "not a number"))?;
            if n % 2 == 1 {
                return Ok(Vec::new());
            }
            Ok(vec![NormalizedDocument::new(&record.id, &record.source, &record.id, None)])
        }
    }

    #[test]
    fn test_records_without_documents_are_not_counted_as_transformed() {
        let mut records: Vec<RawRecord> = (0..5)
            .map(|i| row_record(&i.to_string(), json!({"n": i})))
            .collect();
        records.push(row_record("x", json!({})));
        let outcome = transform_batch(&EvenOnly, &records);
        assert_eq!(outcome.documents.len(), 3);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.transformed, 3);
    }

    #[test]
    fn test_message_prefers_plain_text_and_separates_attachments() {
        let record = message(json!({
            "mimeType": "multipart/mixed",
            "parts": [
                {"mimeType": "multipart/alternative", "parts": [
                    {"mimeType": "text/html", "body": {"data": b64(b"<p>html body</p>")}},
                    {"mimeType": "text/plain", "body": {"data": b64(b"plain body")}}
                ]},
                {"mimeType": "text/plain", "filename": "notes.txt",
                 "body": {"attachmentId": "A", "data": b64(b"attached notes")}},
                {"mimeType": "image/png", "filename": "logo.png",
                 "body": {"attachmentId": "B", "data": b64(b"\x89PNG")}}
            ]
        }));
        let docs = unstructured(AttachmentMode::Separate).transform(&record).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text.as_deref(), Some("plain body"));
        assert_eq!(docs[0].metadata["subject"], "Weekly report");
        assert_eq!(docs[1].text.as_deref(), Some("attached notes"));
        assert_eq!(docs[1].metadata["parent_id"], docs[0].id.as_str());
        assert_eq!(docs[1].metadata["attachment_name"], "notes.txt");
        assert_eq!(
            docs[1].id,
            crate::models::document_id("gmail:inbox:m1/attachment/0")
        );
    }

    #[test]
    fn test_merge_mode_and_attachment_errors() {
        let record = message(json!({
            "mimeType": "multipart/mixed",
            "parts": [
                {"mimeType": "text/plain", "body": {"data": b64(b"body")}},
                {"mimeType": "text/plain", "filename": "a.txt", "body": {"data": b64(b"extra")}},
                {"mimeType": "application/pdf", "filename": "broken.pdf", "body": {"data": b64(b"nope")}}
            ]
        }));
        let docs = unstructured(AttachmentMode::Merge).transform(&record).unwrap();
        assert_eq!(docs.len(), 1);
        let text = docs[0].text.as_deref().unwrap();
        assert!(text.starts_with("body"));
        assert!(text.contains("[attachment: a.txt]\nextra"));
        let errors = docs[0].metadata["attachment_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["name"], "broken.pdf");
    }

    #[test]
    fn test_html_only_message_and_prepend_fields() {
        let t = UnstructuredTransformer::new(UnstructuredOptions {
            prepend_fields: vec!["subject".into()],
            ..Default::default()
        });
        let record = message(json!({
            "mimeType": "text/html",
            "body": {"data": b64(b"<div>Hello <em>team</em></div>")}
        }));
        let docs = t.transform(&record).unwrap();
        let text = docs[0].text.as_deref().unwrap();
        assert!(text.starts_with("Weekly report\n\n"));
        assert!(text.contains("Hello"));
        assert!(!text.contains("<div>"));
    }

    #[test]
    fn test_invalid_base64_body_is_parse_error() {
        let record = message(json!({"mimeType": "text/plain", "body": {"data": "***"}}));
        let err = unstructured(AttachmentMode::Separate).transform(&record).unwrap_err();
        assert!(matches!(err, Error::RecordParse { .. }));
    }

    #[test]
    fn test_empty_message_yields_document_without_text() {
        let record = message(json!({"mimeType": "multipart/mixed", "parts": []}));
        let docs = unstructured(AttachmentMode::Separate).transform(&record).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, None);
        assert!(!docs[0].is_embeddable());
    }

    #[test]
    fn test_document_too_large_and_chunking() {
        let small = UnstructuredTransformer::new(UnstructuredOptions {
            max_part_bytes: 4,
            ..Default::default()
        });
        let record = RawRecord {
            id: "p1".into(),
            source: "arxiv:cs.AI".into(),
            metadata: Map::new(),
            content: RawContent::Document {
                content_type: "text/plain".into(),
                body: b"first paragraph here\n\nsecond paragraph here".to_vec(),
                attachments: Vec::new(),
            },
        };
        assert!(small.transform(&record).is_err());

        let chunking = UnstructuredTransformer::new(UnstructuredOptions {
            max_tokens: Some(6),
            ..Default::default()
        });
        let docs = chunking.transform(&record).unwrap();
        assert_eq!(docs.len(), 2);
        let parent_id = crate::models::document_id("arxiv:cs.AI:p1");
        assert_eq!(docs[0].metadata["parent_id"], parent_id.as_str());
        assert_eq!(docs[1].metadata["chunk_index"], 1);
        assert_eq!(docs[1].id, crate::models::document_id("arxiv:cs.AI:p1#chunk1"));
        assert_eq!(docs[1].text.as_deref(), Some("second paragraph here"));
    }

    #[test]
    fn test_window_chunks_carry_position_metadata() {
        let words: Vec<String> = (0..30).map(|i| format!("w{}", i)).collect();
        let record = RawRecord {
            id: "p2".into(),
            source: "arxiv:cs.AI".into(),
            metadata: Map::new(),
            content: RawContent::Document {
                content_type: "text/plain".into(),
                body: words.join(" ").into_bytes(),
                attachments: Vec::new(),
            },
        };
        let t = UnstructuredTransformer::new(UnstructuredOptions {
            window: Some(WindowOptions {
                chunk_words: 12,
                overlap_words: 4,
                min_chunk_words: 5,
                ..Default::default()
            }),
            ..Default::default()
        });
        let docs = t.transform(&record).unwrap();
        // windows start at words 0, 8, 16; the 24..30 tail has 6 words and stays
        assert_eq!(docs.len(), 4);
        assert_eq!(docs[0].metadata["overlap_with_previous"], 0);
        assert_eq!(docs[0].metadata["overlap_with_next"], 4);
        assert_eq!(docs[1].metadata["start_char"], 24);
        assert_eq!(docs[1].text.as_deref(), Some(words[8..20].join(" ").as_str()));
        assert_eq!(docs[3].metadata["word_count"], 6);
        assert_eq!(docs[3].metadata["overlap_with_next"], 0);
        assert!(docs[0].metadata.get("section_title").is_none());
        let parent_id = crate::models::document_id("arxiv:cs.AI:p2");
        assert!(docs.iter().all(|d| d.metadata["parent_id"] == parent_id.as_str()));
    }

    #[tokio::test]
    async fn test_concurrent_transform_keeps_order() {
        let t: Arc<dyn Transformer> = Arc::new(StructuredTransformer::new(StructuredOptions {
            text_columns: vec!["body".into()],
            ..Default::default()
        }));
        let records: Vec<RawRecord> = (0..10)
            .map(|i| row_record(&i.to_string(), json!({"body": format!("row {}", i)})))
            .collect();
        let outcome = transform_concurrent(t, records, 3).await;
        assert_eq!(outcome.documents.len(), 10);
        for (i, doc) in outcome.documents.iter().enumerate() {
            assert_eq!(doc.metadata["source_id"], i.to_string().as_str());
        }
    }
}
