//! TOML configuration: credential providers, embedding, and jobs.
//!
//! ```toml
//! [credentials.vault]
//! kind = "file"
//! path = "./secrets.toml"
//!
//! [jobs.inbox]
//! concurrency = 4
//!
//! [jobs.inbox.source]
//! source_type = "gmail"
//! credential = { provider = "vault", id = "gmail" }
//!
//! [jobs.inbox.extract]
//! query = "label:papers"
//!
//! [jobs.inbox.transform]
//! kind = "unstructured"
//! attachments = "separate"
//!
//! [jobs.inbox.resilience]
//! rate_limit = { calls = 5, period_secs = 1.0 }
//! retry = { max_attempts = 4, backoff = "exponential", base_delay_ms = 250 }
//!
//! [jobs.inbox.sink]
//! index = "mail"
//!
//! [jobs.inbox.sink.connector]
//! source_type = "opensearch"
//! host = "localhost"
//! ```
//!
//! Everything is validated by [`load_config`] so a bad job fails before
//! any connection is opened.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::connector::{ConnectorFactory, ConnectorRole};
use crate::error::ConfigError;
use crate::extractor;
use crate::resilience::{Backoff, RateLimit, RateLimiter, Resilience, RetryPolicy};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialProviderConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

// ═══════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CredentialProviderConfig {
    /// `<PREFIX>_<IDENTIFIER>_<FIELD>` environment variables.
    Env {
        #[serde(default = "default_env_prefix")]
        prefix: String,
    },
    /// A TOML file with one table per identifier.
    File { path: PathBuf },
    /// Entries written directly in the config file.
    Inline {
        #[serde(default)]
        entries: BTreeMap<String, toml::Table>,
    },
}

fn default_env_prefix() -> String {
    "IH".to_string()
}

/// Points at a credential: `{ provider = "vault", id = "gmail" }`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CredentialRef {
    pub provider: String,
    pub id: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Connectors
// ═══════════════════════════════════════════════════════════════════════

/// Connection settings for one source or sink.
///
/// Everything besides `source_type` and `credential` is passed to the
/// connector constructor as its parameter table.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    pub source_type: String,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl ConnectorConfig {
    pub fn new(source_type: &str, params: toml::Table) -> Self {
        Self {
            source_type: source_type.to_string(),
            credential: None,
            params,
        }
    }

    /// Parameters as a JSON object.
    pub fn params_json(&self) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
        table_to_json(&self.params, &self.source_type)
    }
}

pub(crate) fn table_to_json(
    table: &toml::Table,
    component: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
    match serde_json::to_value(table) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::invalid(component, "expected a table")),
        Err(e) => Err(ConfigError::invalid(component, e)),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub source: ConnectorConfig,
    /// Source-specific extractor options, validated per source type.
    #[serde(default)]
    pub extract: toml::Table,
    /// Defaults to structured for `rdbms`, unstructured otherwise.
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    pub sink: SinkConfig,
    /// Cap on concurrently running fetches and parses.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

impl JobConfig {
    pub fn transform_config(&self) -> TransformConfig {
        match &self.transform {
            Some(t) => t.clone(),
            None if self.source.source_type.eq_ignore_ascii_case("rdbms") => {
                TransformConfig::Structured(StructuredOptions::default())
            }
            None => TransformConfig::Unstructured(UnstructuredOptions::default()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransformConfig {
    Structured(StructuredOptions),
    Unstructured(UnstructuredOptions),
}

#[derive(Debug, Deserialize, Clone)]
pub struct StructuredOptions {
    /// Column holding the source-local id. Falls back to the record id.
    #[serde(default)]
    pub id_column: Option<String>,
    /// Columns concatenated into the document text. Empty means no text.
    #[serde(default)]
    pub text_columns: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// `column -> metadata key`. When empty every column is kept as-is.
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
}

impl Default for StructuredOptions {
    fn default() -> Self {
        Self {
            id_column: None,
            text_columns: Vec::new(),
            separator: default_separator(),
            column_mapping: BTreeMap::new(),
        }
    }
}

fn default_separator() -> String {
    "\n".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentMode {
    /// Each attachment becomes its own document pointing at the parent.
    #[default]
    Separate,
    /// Attachment text is appended to the parent's text.
    Merge,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnstructuredOptions {
    #[serde(default)]
    pub attachments: AttachmentMode,
    /// Metadata fields placed before the body text (e.g. `title`).
    #[serde(default)]
    pub prepend_fields: Vec<String>,
    /// Bodies or attachments larger than this are rejected.
    #[serde(default = "default_max_part_bytes")]
    pub max_part_bytes: usize,
    /// Split long texts into chunk documents of roughly this many tokens.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Section-aware overlapping word windows. Replaces `max_tokens`.
    #[serde(default)]
    pub window: Option<WindowOptions>,
}

impl Default for UnstructuredOptions {
    fn default() -> Self {
        Self {
            attachments: AttachmentMode::default(),
            prepend_fields: Vec::new(),
            max_part_bytes: default_max_part_bytes(),
            max_tokens: None,
            window: None,
        }
    }
}

fn default_max_part_bytes() -> usize {
    50 * 1024 * 1024
}

/// Word-window chunking, counted in whitespace-separated words.
///
/// Text is split into sections at markdown headings. Sections shorter than
/// `min_section_words` are merged with the ones that follow, sections up to
/// `max_section_words` stay whole, and longer ones are cut into windows of
/// `chunk_words` sharing `overlap_words` with the next window. A trailing
/// window under `min_chunk_words` is folded into the one before it. Text
/// without headings is windowed directly.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct WindowOptions {
    #[serde(default = "default_chunk_words")]
    pub chunk_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
    #[serde(default = "default_min_chunk_words")]
    pub min_chunk_words: usize,
    #[serde(default = "default_min_section_words")]
    pub min_section_words: usize,
    #[serde(default = "default_max_section_words")]
    pub max_section_words: usize,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            chunk_words: default_chunk_words(),
            overlap_words: default_overlap_words(),
            min_chunk_words: default_min_chunk_words(),
            min_section_words: default_min_section_words(),
            max_section_words: default_max_section_words(),
        }
    }
}

impl WindowOptions {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.chunk_words == 0 {
            return Err("transform.window.chunk_words must be > 0".into());
        }
        if self.overlap_words >= self.chunk_words {
            return Err(format!(
                "transform.window.overlap_words ({}) must be smaller than chunk_words ({})",
                self.overlap_words, self.chunk_words
            ));
        }
        if self.min_section_words > self.max_section_words {
            return Err("transform.window.min_section_words exceeds max_section_words".into());
        }
        Ok(())
    }
}

fn default_chunk_words() -> usize {
    600
}
fn default_overlap_words() -> usize {
    120
}
fn default_min_chunk_words() -> usize {
    150
}
fn default_min_section_words() -> usize {
    100
}
fn default_max_section_words() -> usize {
    800
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Single,
    #[default]
    Bulk,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub connector: ConnectorConfig,
    pub index: String,
    #[serde(default)]
    pub mode: IngestMode,
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Embed documents that have text but no vector before submitting.
    #[serde(default)]
    pub require_vectors: bool,
    /// How many times the failed subset of a bulk batch is re-submitted.
    #[serde(default)]
    pub resubmit_failed: u32,
    #[serde(default = "default_true")]
    pub create_index: bool,
}

fn default_sink_batch_size() -> usize {
    500
}
fn default_max_batch_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════
// Resilience
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub calls: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: f64,
}

fn default_period_secs() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff() -> Backoff {
    Backoff::Exponential
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: self.retry.backoff,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit.as_ref().map(|r| RateLimit {
            calls: r.calls,
            period: Duration::from_secs_f64(r.period_secs),
        })
    }

    /// Build the policy object with a fresh limiter. Call once per job and
    /// clone the result so every component shares the same bucket.
    pub fn build(&self) -> Resilience {
        let limiter = self.rate_limit().map(|l| Arc::new(RateLimiter::new(l)));
        Resilience::new(self.retry_policy(), limiter)
    }

    fn validate(&self, component: &str) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(component, "retry.max_attempts must be >= 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                component,
                "retry.max_delay_ms must be >= retry.base_delay_ms",
            ));
        }
        if let Some(rl) = &self.rate_limit {
            if rl.calls == 0 {
                return Err(ConfigError::invalid(component, "rate_limit.calls must be >= 1"));
            }
            if !(rl.period_secs.is_finite() && rl.period_secs > 0.0) {
                return Err(ConfigError::invalid(
                    component,
                    "rate_limit.period_secs must be > 0",
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Embedding
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the provider's API endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Jina task hint, e.g. `retrieval.passage`.
    #[serde(default)]
    pub task: Option<String>,
    /// Where the API key comes from. Falls back to the provider's env var.
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            timeout_secs: 30,
            base_url: None,
            task: None,
            credential: None,
            resilience: ResilienceConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Loading and validation
// ═══════════════════════════════════════════════════════════════════════

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn job(&self, name: &str) -> Result<&JobConfig, ConfigError> {
        self.jobs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_embedding()?;
        let factory = ConnectorFactory::with_builtins();
        for (name, job) in &self.jobs {
            self.validate_job(name, job, &factory)?;
        }
        Ok(())
    }

    fn validate_embedding(&self) -> Result<(), ConfigError> {
        let e = &self.embedding;
        match e.provider.as_str() {
            "disabled" | "openai" | "jina" => {}
            other => {
                return Err(ConfigError::invalid(
                    "embedding",
                    format!(
                        "unknown provider '{}'. Must be disabled, openai, or jina",
                        other
                    ),
                ))
            }
        }
        if e.is_enabled() {
            if e.dims.unwrap_or(0) == 0 {
                return Err(ConfigError::invalid(
                    "embedding",
                    format!("dims must be > 0 when provider is '{}'", e.provider),
                ));
            }
            if e.model.is_none() {
                return Err(ConfigError::invalid(
                    "embedding",
                    format!("model must be specified when provider is '{}'", e.provider),
                ));
            }
            if e.batch_size == 0 {
                return Err(ConfigError::invalid("embedding", "batch_size must be > 0"));
            }
        }
        if let Some(cred) = &e.credential {
            self.check_provider_exists("embedding", cred)?;
        }
        e.resilience.validate("embedding")
    }

    fn validate_job(
        &self,
        name: &str,
        job: &JobConfig,
        factory: &ConnectorFactory,
    ) -> Result<(), ConfigError> {
        let component = format!("job '{}'", name);

        let source_type = job.source.source_type.to_ascii_lowercase();
        match factory.role_of(&source_type) {
            Some(ConnectorRole::Source) => {}
            Some(ConnectorRole::Sink) => {
                return Err(ConfigError::invalid(
                    &component,
                    format!("'{}' can only be used as a sink", source_type),
                ))
            }
            None => return Err(factory.unknown(&source_type)),
        }

        let sink_type = job.sink.connector.source_type.to_ascii_lowercase();
        match factory.role_of(&sink_type) {
            Some(ConnectorRole::Sink) => {}
            Some(ConnectorRole::Source) => {
                return Err(ConfigError::invalid(
                    &component,
                    format!("'{}' cannot be used as a sink", sink_type),
                ))
            }
            None => return Err(factory.unknown(&sink_type)),
        }

        for cred in [&job.source.credential, &job.sink.connector.credential]
            .into_iter()
            .flatten()
        {
            self.check_provider_exists(&component, cred)?;
        }

        if job.concurrency == 0 {
            return Err(ConfigError::invalid(&component, "concurrency must be >= 1"));
        }
        if job.sink.index.trim().is_empty() {
            return Err(ConfigError::invalid(&component, "sink.index must not be empty"));
        }
        if job.sink.batch_size == 0 {
            return Err(ConfigError::invalid(&component, "sink.batch_size must be >= 1"));
        }
        if job.sink.max_batch_bytes < 1024 {
            return Err(ConfigError::invalid(
                &component,
                "sink.max_batch_bytes must be >= 1024",
            ));
        }
        if job.sink.require_vectors && !self.embedding.is_enabled() {
            return Err(ConfigError::invalid(
                &component,
                "sink.require_vectors needs an enabled embedding provider",
            ));
        }

        match (source_type.as_str(), job.transform_config()) {
            ("rdbms", TransformConfig::Unstructured(_)) => {
                return Err(ConfigError::invalid(
                    &component,
                    "rdbms rows need the structured transformer",
                ))
            }
            ("gmail" | "arxiv", TransformConfig::Structured(_)) => {
                return Err(ConfigError::invalid(
                    &component,
                    format!("{} records need the unstructured transformer", source_type),
                ))
            }
            (_, TransformConfig::Unstructured(opts)) if opts.max_tokens == Some(0) => {
                return Err(ConfigError::invalid(&component, "transform.max_tokens must be > 0"))
            }
            (_, TransformConfig::Unstructured(opts)) if opts.window.is_some() && opts.max_tokens.is_some() => {
                return Err(ConfigError::invalid(
                    &component,
                    "transform.max_tokens and transform.window are mutually exclusive",
                ))
            }
            (_, TransformConfig::Unstructured(UnstructuredOptions { window: Some(window), .. })) => {
                window.validate().map_err(|e| ConfigError::invalid(&component, e))?
            }
            _ => {}
        }

        job.resilience.validate(&component)?;
        extractor::validate_options(&source_type, &job.extract)
    }

    fn check_provider_exists(&self, component: &str, cred: &CredentialRef) -> Result<(), ConfigError> {
        if self.credentials.contains_key(&cred.provider) {
            Ok(())
        } else {
            Err(ConfigError::invalid(
                component,
                format!("credential provider '{}' is not configured", cred.provider),
            ))
        }
    }
}
