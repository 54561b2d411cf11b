//! Gmail source: OAuth2 refresh-token client for the Gmail REST API.
//!
//! # Configuration
//!
//! ```toml
//! [jobs.inbox.source]
//! source_type = "gmail"
//! credential = { provider = "vault", id = "gmail" }   # refresh_token, client_id, client_secret
//!
//! [jobs.inbox.extract]
//! query = "label:papers has:attachment"
//! batch_size = 50
//! fields = ["from", "to", "subject", "date"]
//! include_attachments = true
//! attachment_budget = "shared"   # or "independent"
//! ```
//!
//! One listing page becomes one batch. Every message in the page is fetched
//! with `format=full` and its attachment bodies are inlined into the part
//! tree, so the transformer gets a self-contained [`MimePart`]. Message and
//! attachment fetches draw from one pool of `concurrency` request slots, so
//! no more than that many requests are ever in flight, and all of them go
//! through the resilience layer. Attachments whose type the parser cannot
//! read are not downloaded.
//!
//! With `attachment_budget = "shared"` attachment downloads draw from the
//! job's rate limiter; `"independent"` gives them a limiter of their own with
//! the same rate.

use chrono::DateTime;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connector::{flexible, parse_params, string_or_list};
use crate::error::{check_response, ConfigError, Error, Result};
use crate::extractor::{
    BatchStream, ExtractBatch, ExtractContext, ExtractFilter, ExtractOptions, Extractor,
};
use crate::models::{MimePart, RawContent, RawRecord, SkippedRecord};
use crate::parse::{content_type_for, is_supported};
use crate::resilience::Resilience;

#[derive(Debug, Deserialize)]
struct GmailParams {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    scopes: Vec<String>,
    #[serde(default = "default_account")]
    account: String,
    #[serde(default = "default_api_base")]
    api_base: String,
    /// Pre-issued token; skips the refresh flow.
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default = "default_timeout_secs", deserialize_with = "flexible")]
    timeout_secs: u64,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_account() -> String {
    "me".to_string()
}
fn default_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

struct GmailAuth {
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    scopes: Vec<String>,
    static_token: Option<String>,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Clone)]
pub struct GmailConnector {
    client: reqwest::Client,
    api_base: String,
    account: String,
    auth: Arc<GmailAuth>,
}

impl GmailConnector {
    pub fn from_params(params: Map<String, Value>) -> Result<Self, ConfigError> {
        let p: GmailParams = parse_params("gmail", params)?;
        if p.access_token.is_none() {
            let missing: Vec<&str> = [
                ("refresh_token", p.refresh_token.is_none()),
                ("client_id", p.client_id.is_none()),
                ("client_secret", p.client_secret.is_none()),
            ]
            .into_iter()
            .filter(|(_, absent)| *absent)
            .map(|(name, _)| name)
            .collect();
            if !missing.is_empty() {
                return Err(ConfigError::invalid(
                    "gmail",
                    format!("missing {} (or an access_token)", missing.join(", ")),
                ));
            }
        }
        for (field, url) in [("api_base", &p.api_base), ("token_uri", &p.token_uri)] {
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::invalid("gmail", format!("{} '{}': {}", field, url, e)))?;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(p.timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("gmail", e))?;

        Ok(Self {
            client,
            api_base: p.api_base.trim_end_matches('/').to_string(),
            account: p.account,
            auth: Arc::new(GmailAuth {
                token_uri: p.token_uri,
                client_id: p.client_id.unwrap_or_default(),
                client_secret: p.client_secret.unwrap_or_default(),
                refresh_token: p.refresh_token.unwrap_or_default(),
                scopes: p.scopes,
                static_token: p.access_token,
                cached: Mutex::new(None),
            }),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn user_url(&self) -> String {
        format!("{}/users/{}", self.api_base, self.account)
    }

    pub fn messages_url(&self) -> String {
        format!("{}/messages", self.user_url())
    }

    /// Current access token, refreshing it a minute before expiry.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = &self.auth.static_token {
            return Ok(token.clone());
        }
        let mut cached = self.auth.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Instant::now() < c.expires_at {
                return Ok(c.token.clone());
            }
        }
        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn refresh(&self) -> Result<CachedToken> {
        debug!(token_uri = %self.auth.token_uri, "refreshing gmail access token");
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", self.auth.refresh_token.clone()),
            ("client_id", self.auth.client_id.clone()),
            ("client_secret", self.auth.client_secret.clone()),
        ];
        if !self.auth.scopes.is_empty() {
            form.push(("scope", self.auth.scopes.join(" ")));
        }
        let resp = self
            .client
            .post(&self.auth.token_uri)
            .form(&form)
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let body: TokenResponse = resp.json().await.map_err(Error::permanent)?;
        let lifetime = Duration::from_secs(body.expires_in.saturating_sub(60).max(1));
        Ok(CachedToken {
            token: body.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }

    pub(crate) async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let resp = check_response(resp).await?;
        resp.json().await.map_err(Error::permanent)
    }

    pub async fn check(&self) -> Result<()> {
        self.get_json(&format!("{}/profile", self.user_url()), &[])
            .await
            .map(drop)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentBudget {
    #[default]
    Shared,
    Independent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailExtractOptions {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    #[serde(default)]
    pub attachment_budget: AttachmentBudget,
}

fn default_batch_size() -> usize {
    50
}
fn default_fields() -> Vec<String> {
    ["from", "to", "subject", "date"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_true() -> bool {
    true
}

impl ExtractOptions for GmailExtractOptions {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err("batch_size must be in 1..=500".into());
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: MimePart,
}

#[derive(Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: String,
}

struct Cursor {
    page_token: Option<String>,
    seen: usize,
    done: bool,
}

pub struct GmailExtractor {
    connector: GmailConnector,
    options: GmailExtractOptions,
    source: String,
    resilience: Resilience,
    attachment_resilience: Resilience,
    concurrency: usize,
    /// Shared by message and attachment fetches.
    slots: Arc<Semaphore>,
}

impl GmailExtractor {
    pub fn new(connector: GmailConnector, mut options: GmailExtractOptions, ctx: ExtractContext) -> Self {
        options.fields = options
            .fields
            .iter()
            .map(|f| f.to_ascii_lowercase())
            .collect();
        let attachment_resilience = match options.attachment_budget {
            AttachmentBudget::Shared => ctx.resilience.clone(),
            AttachmentBudget::Independent => ctx.resilience.with_independent_limiter(),
        };
        Self {
            connector,
            options,
            source: ctx.source_label,
            resilience: ctx.resilience,
            attachment_resilience,
            concurrency: ctx.concurrency.max(1),
            slots: Arc::new(Semaphore::new(ctx.concurrency.max(1))),
        }
    }

    /// GET holding one request slot for the duration of the call.
    async fn get_json_slotted(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let _slot = self.slots.acquire().await.map_err(|_| Error::Cancelled)?;
        self.connector.get_json(url, query).await
    }

    /// Gmail search string with the date filter folded in. `before:` is
    /// exclusive, so the inclusive `until` date is moved one day forward.
    fn search_query(&self, filter: &ExtractFilter) -> String {
        let mut parts = Vec::new();
        if !self.options.query.trim().is_empty() {
            parts.push(self.options.query.trim().to_string());
        }
        if let Some(since) = filter.since {
            parts.push(format!("after:{}", since.format("%Y/%m/%d")));
        }
        if let Some(until) = filter.until {
            let next = until.succ_opt().unwrap_or(until);
            parts.push(format!("before:{}", next.format("%Y/%m/%d")));
        }
        parts.join(" ")
    }

    async fn next_page(
        &self,
        query: &str,
        filter: &ExtractFilter,
        cursor: Cursor,
    ) -> Result<Option<(ExtractBatch, Cursor)>> {
        if cursor.done {
            return Ok(None);
        }
        let max = match filter.remaining(cursor.seen) {
            Some(0) => return Ok(None),
            Some(left) => left.min(self.options.batch_size),
            None => self.options.batch_size,
        };
        let mut params = vec![("maxResults", max.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        if let Some(token) = &cursor.page_token {
            params.push(("pageToken", token.clone()));
        }

        let url = self.connector.messages_url();
        let value = self
            .resilience
            .call("gmail list", || self.connector.get_json(&url, &params))
            .await?;
        let list: MessageList = serde_json::from_value(value).map_err(Error::permanent)?;

        let mut ids: Vec<String> = list.messages.into_iter().map(|m| m.id).collect();
        ids.truncate(max);
        if ids.is_empty() {
            return Ok(None);
        }
        let fetched = ids.len();

        let results: Vec<(String, Result<RawRecord>)> = stream::iter(ids)
            .map(|id| async move {
                let record = self.fetch_message(&id).await;
                (id, record)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut batch = ExtractBatch::default();
        for (id, result) in results {
            match result {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    warn!(source = %self.source, message = %id, error = %e.report(), "message fetch failed");
                    batch.failures.push(SkippedRecord {
                        id,
                        reason: e.report(),
                    });
                }
            }
        }
        debug!(source = %self.source, messages = fetched, "fetched gmail page");

        let next = Cursor {
            done: list.next_page_token.is_none(),
            page_token: list.next_page_token,
            seen: cursor.seen + fetched,
        };
        Ok(Some((batch, next)))
    }

    async fn fetch_message(&self, id: &str) -> Result<RawRecord> {
        let url = format!("{}/{}", self.connector.messages_url(), id);
        let query = [("format", "full".to_string())];
        let value = self
            .resilience
            .call("gmail get", || self.get_json_slotted(&url, &query))
            .await?;
        let mut message: GmailMessage =
            serde_json::from_value(value).map_err(|e| Error::parse(id, e))?;

        let mut attachment_errors = Vec::new();
        if self.options.include_attachments {
            let mut pending = Vec::new();
            collect_attachment_ids(&message.payload, &mut pending);
            let message_id = message.id.clone();
            let fetched: Vec<(String, Result<String>)> = stream::iter(pending)
                .map(|aid| {
                    let message_id = &message_id;
                    async move {
                        let data = self.fetch_attachment(message_id, &aid).await;
                        (aid, data)
                    }
                })
                .buffered(self.concurrency)
                .collect()
                .await;
            let mut data = HashMap::new();
            for (aid, result) in fetched {
                match result {
                    Ok(d) => {
                        data.insert(aid, d);
                    }
                    Err(e) => attachment_errors.push(serde_json::json!({
                        "attachment_id": aid,
                        "reason": e.report(),
                    })),
                }
            }
            fill_attachment_data(&mut message.payload, &data);
        }

        let mut metadata = Map::new();
        metadata.insert("account".into(), Value::String(self.connector.account().to_string()));
        if let Some(thread) = &message.thread_id {
            metadata.insert("thread_id".into(), Value::String(thread.clone()));
        }
        metadata.insert(
            "label_ids".into(),
            Value::Array(message.label_ids.iter().cloned().map(Value::String).collect()),
        );
        metadata.insert("snippet".into(), Value::String(message.snippet.clone()));
        if let Some(received) = message
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
        {
            metadata.insert("received_at".into(), Value::String(received.to_rfc3339()));
        }
        for header in &message.payload.headers {
            let name = header.name.to_ascii_lowercase();
            if self.options.fields.contains(&name) {
                metadata.insert(name, Value::String(header.value.clone()));
            }
        }
        if !attachment_errors.is_empty() {
            metadata.insert("attachment_errors".into(), Value::Array(attachment_errors));
        }

        Ok(RawRecord {
            id: message.id,
            source: self.source.clone(),
            metadata,
            content: RawContent::Message(message.payload),
        })
    }

    async fn fetch_attachment(&self, message_id: &str, attachment_id: &str) -> Result<String> {
        let url = format!(
            "{}/{}/attachments/{}",
            self.connector.messages_url(),
            message_id,
            attachment_id
        );
        let value = self
            .attachment_resilience
            .call("gmail attachment", || self.get_json_slotted(&url, &[]))
            .await?;
        let body: AttachmentBody = serde_json::from_value(value).map_err(Error::permanent)?;
        Ok(body.data)
    }
}

impl Extractor for GmailExtractor {
    fn source_label(&self) -> &str {
        &self.source
    }

    fn extract<'a>(&'a self, filter: &'a ExtractFilter) -> BatchStream<'a> {
        let query = self.search_query(filter);
        let start = Cursor {
            page_token: None,
            seen: 0,
            done: false,
        };
        stream::try_unfold(start, move |cursor| {
            let query = query.clone();
            async move { self.next_page(&query, filter, cursor).await }
        })
        .boxed()
    }
}

/// Attachment ids of parts whose body still has to be downloaded and
/// whose content type the parser can read.
fn collect_attachment_ids(part: &MimePart, out: &mut Vec<String>) {
    if let Some(aid) = &part.body.attachment_id {
        let content_type = content_type_for(&part.mime_type, part.filename.as_deref());
        if part.body.data.is_none() && is_supported(&content_type) {
            out.push(aid.clone());
        } else if part.body.data.is_none() {
            debug!(attachment = %aid, content_type = %content_type, "not downloading unsupported attachment");
        }
    }
    for child in &part.parts {
        collect_attachment_ids(child, out);
    }
}

fn fill_attachment_data(part: &mut MimePart, data: &HashMap<String, String>) {
    if let Some(aid) = &part.body.attachment_id {
        if let Some(d) = data.get(aid) {
            part.body.data = Some(d.clone());
        }
    }
    for child in &mut part.parts {
        fill_attachment_data(child, data);
    }
}
