//! Embedding providers.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - [`DisabledEmbedder`]: fails every call; used when `[embedding]` is off.
//! - [`HttpEmbedder`]: OpenAI-compatible `POST <base>/embeddings` for the
//!   `openai` and `jina` providers.
//!
//! # Provider Selection
//!
//! | Config Value | Endpoint | API key fallback |
//! |-------------|----------|------------------|
//! | `"disabled"` | none | none |
//! | `"openai"` | `https://api.openai.com/v1/embeddings` | `OPENAI_API_KEY` |
//! | `"jina"` | `https://api.jina.ai/v1/embeddings` | `JINA_API_KEY` |
//!
//! The key is read from the `api_key` field of `embedding.credential` when
//! one is configured.
//!
//! # Retry Strategy
//!
//! Every request goes through the `[embedding.resilience]` policy. 429 and
//! 5xx responses are retried (a `Retry-After` header is honoured), other
//! 4xx responses fail at once. A vector whose length differs from
//! `embedding.dims` is a permanent error.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::credentials::CredentialFactory;
use crate::error::{check_response, ConfigError, Error, Result};
use crate::resilience::Resilience;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::permanent("embedding provider is disabled"))
    }
}

// ============ HTTP Provider ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    OpenAi,
    Jina,
}

impl EmbedderKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(EmbedderKind::OpenAi),
            "jina" => Some(EmbedderKind::Jina),
            _ => None,
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            EmbedderKind::OpenAi => "https://api.openai.com/v1",
            EmbedderKind::Jina => "https://api.jina.ai/v1",
        }
    }

    fn key_env(&self) -> &'static str {
        match self {
            EmbedderKind::OpenAi => "OPENAI_API_KEY",
            EmbedderKind::Jina => "JINA_API_KEY",
        }
    }
}

pub struct HttpEmbedder {
    kind: EmbedderKind,
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    task: Option<String>,
    batch_size: usize,
    resilience: Resilience,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        kind: EmbedderKind,
        config: &EmbeddingConfig,
        api_key: String,
    ) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConfigError::invalid("embedding", "model is required"))?;
        let dims = config
            .dims
            .ok_or_else(|| ConfigError::invalid("embedding", "dims is required"))?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("embedding", e))?;
        Ok(Self {
            kind,
            client,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            model,
            dims,
            task: config.task.clone(),
            batch_size: config.batch_size.max(1),
            resilience: config.resilience.build(),
        })
    }

    fn request_body(&self, texts: &[String]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if self.kind == EmbedderKind::Jina {
            body["dimensions"] = self.dims.into();
            if let Some(task) = &self.task {
                body["task"] = task.clone().into();
            }
        }
        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<EmbeddingResponse> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let resp = check_response(resp).await?;
        resp.json().await.map_err(Error::permanent)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = self.request_body(texts);
        let resp = self
            .resilience
            .call("embed", || self.post(&body))
            .await?;
        let vectors = order_by_index(resp.data)?;
        if vectors.len() != texts.len() {
            return Err(Error::permanent(format!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(Error::permanent(format!(
                "embedding has {} dimensions, expected {}",
                bad.len(),
                self.dims
            )));
        }
        Ok(vectors)
    }
}

/// Sort response items by their `index` field; items without one keep
/// their position.
fn order_by_index(items: Vec<EmbeddingItem>) -> Result<Vec<Vec<f32>>> {
    let mut indexed: Vec<(usize, Vec<f32>)> = items
        .into_iter()
        .enumerate()
        .map(|(pos, item)| (item.index.unwrap_or(pos), item.embedding))
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    for (expected, (i, _)) in indexed.iter().enumerate() {
        if *i != expected {
            return Err(Error::permanent(format!(
                "embedding response is missing index {}",
                expected
            )));
        }
    }
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(model = %self.model, texts = batch.len(), "embedding batch");
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

/// Build the embedder named by `config.provider`.
pub async fn create_embedder(
    config: &EmbeddingConfig,
    credentials: &CredentialFactory,
) -> Result<Arc<dyn Embedder>> {
    if !config.is_enabled() {
        return Ok(Arc::new(DisabledEmbedder));
    }
    let kind = EmbedderKind::parse(&config.provider).ok_or_else(|| {
        ConfigError::invalid(
            "embedding",
            format!("unknown provider '{}'", config.provider),
        )
    })?;
    let api_key = match &config.credential {
        Some(cref) => {
            let cred = credentials
                .resolve_ref(cref, &config.resilience.build())
                .await?;
            cred.get_str("api_key")
                .map(str::to_string)
                .ok_or_else(|| {
                    ConfigError::invalid(
                        "embedding",
                        format!("credential '{}' has no api_key field", cref.id),
                    )
                })?
        }
        None => std::env::var(kind.key_env()).map_err(|_| {
            ConfigError::invalid(
                "embedding",
                format!("{} is not set and no credential is configured", kind.key_env()),
            )
        })?,
    };
    Ok(Arc::new(HttpEmbedder::new(kind, config, api_key)?))
}
