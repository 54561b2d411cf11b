//! Core data types that flow through the pipeline.
//!
//! ```text
//! RawRecord ──transform──▶ NormalizedDocument ──ingest──▶ index
//!     │                          │
//!     └── SkippedRecord          └── ItemFailure
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque unit of extracted data: a row, an email, a paper.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Stable, source-local identifier (primary key, message id, arxiv id).
    pub id: String,
    /// Source label, e.g. `gmail:inbox`. Part of the document id.
    pub source: String,
    pub metadata: Map<String, Value>,
    pub content: RawContent,
}

#[derive(Debug, Clone)]
pub enum RawContent {
    /// A tabular row keyed by column name.
    Row(Map<String, Value>),
    /// A binary or text body plus embedded sub-parts.
    Document {
        content_type: String,
        body: Vec<u8>,
        attachments: Vec<RawAttachment>,
    },
    /// A MIME part tree with base64url-encoded bodies (Gmail `format=full`).
    Message(MimePart),
}

#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// One node of a message part tree, in the shape the Gmail API returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MimePart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<MimeHeader>,
    #[serde(default)]
    pub body: MimeBody,
    #[serde(default)]
    pub parts: Vec<MimePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimeHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MimeBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// base64url, with or without padding.
    #[serde(default)]
    pub data: Option<String>,
}

impl MimePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn is_attachment(&self) -> bool {
        self.filename.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// The sink-facing document shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub id: String,
    /// `None` when the source has nothing to embed.
    pub text: Option<String>,
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl NormalizedDocument {
    /// Build a document whose id derives from `key` and whose metadata
    /// carries `source`, `source_id` and a content hash.
    pub fn new(key: &str, source: &str, source_id: &str, text: Option<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::String(source.to_string()));
        metadata.insert("source_id".into(), Value::String(source_id.to_string()));
        if let Some(t) = text.as_deref() {
            metadata.insert("content_hash".into(), Value::String(content_hash(t)));
        }
        Self {
            id: document_id(key),
            text,
            metadata,
            vector: None,
        }
    }

    /// True when the document has non-blank text to embed.
    pub fn is_embeddable(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Body sent to the index: metadata fields plus `text` and `vector`.
    pub fn to_index_body(&self) -> Value {
        let mut body = self.metadata.clone();
        body.insert(
            "text".into(),
            self.text.clone().map(Value::String).unwrap_or(Value::Null),
        );
        if let Some(v) = &self.vector {
            body.insert(
                "vector".into(),
                Value::Array(v.iter().map(|x| Value::from(*x as f64)).collect()),
            );
        }
        Value::Object(body)
    }
}

/// Deterministic document id for a source key.
pub fn document_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A record dropped before reaching the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub id: String,
    pub reason: String,
}

/// A document the sink (or the embedder) rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}
