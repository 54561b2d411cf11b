//! OpenSearch / Elasticsearch sink over the REST API.
//!
//! # Configuration
//!
//! ```toml
//! [jobs.rows.sink.connector]
//! source_type = "opensearch"        # or "elasticsearch"
//! scheme = "https"
//! host = "search.internal"
//! port = 9200
//! verify_certs = true
//! credential = { provider = "env", id = "opensearch" }   # login, password
//! ```
//!
//! Documents are written with their id as `_id`, so every write is an
//! upsert. Bulk writes use the NDJSON `_bulk` endpoint and report a result
//! per document.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use async_trait::async_trait;

use crate::connector::{flexible, parse_params};
use crate::error::{check_response, ConfigError, Error, Result};
use crate::index::{ItemOutcome, SearchIndex};
use crate::models::NormalizedDocument;

/// Which vector mapping dialect the cluster speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFlavor {
    OpenSearch,
    Elasticsearch,
}

impl SearchFlavor {
    pub fn tag(&self) -> &'static str {
        match self {
            SearchFlavor::OpenSearch => "opensearch",
            SearchFlavor::Elasticsearch => "elasticsearch",
        }
    }

    fn index_body(&self, dims: Option<usize>) -> Value {
        let mut properties = json!({
            "text": { "type": "text" },
            "source": { "type": "keyword" },
            "source_id": { "type": "keyword" },
            "content_hash": { "type": "keyword" },
        });
        match (self, dims) {
            (SearchFlavor::OpenSearch, Some(d)) => {
                properties["vector"] = json!({ "type": "knn_vector", "dimension": d });
                json!({
                    "settings": { "index": { "knn": true } },
                    "mappings": { "properties": properties },
                })
            }
            (SearchFlavor::Elasticsearch, Some(d)) => {
                properties["vector"] = json!({ "type": "dense_vector", "dims": d });
                json!({ "mappings": { "properties": properties } })
            }
            (_, None) => json!({ "mappings": { "properties": properties } }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default = "default_scheme", alias = "schema", alias = "schema_type")]
    scheme: String,
    host: String,
    #[serde(default = "default_port", deserialize_with = "flexible")]
    port: u16,
    #[serde(default, deserialize_with = "flexible")]
    verify_certs: bool,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_timeout_secs", deserialize_with = "flexible")]
    timeout_secs: u64,
}

fn default_scheme() -> String {
    "http".to_string()
}
fn default_port() -> u16 {
    9200
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone)]
pub struct SearchIndexConnector {
    flavor: SearchFlavor,
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, Option<String>)>,
}

impl SearchIndexConnector {
    pub fn from_params(flavor: SearchFlavor, params: Map<String, Value>) -> Result<Self, ConfigError> {
        let tag = flavor.tag();
        let p: SearchParams = parse_params(tag, params)?;
        let scheme = p.scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::invalid(
                tag,
                format!("scheme must be http or https, got '{}'", p.scheme),
            ));
        }
        if p.host.trim().is_empty() {
            return Err(ConfigError::invalid(tag, "host must not be empty"));
        }
        let base_url = format!("{}://{}:{}", scheme, p.host.trim(), p.port);
        reqwest::Url::parse(&base_url)
            .map_err(|e| ConfigError::invalid(tag, format!("'{}': {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(p.timeout_secs))
            .danger_accept_invalid_certs(!p.verify_certs)
            .build()
            .map_err(|e| ConfigError::invalid(tag, e))?;
        Ok(Self {
            flavor,
            client,
            base_url,
            auth: p.login.map(|login| (login, p.password)),
        })
    }

    pub fn flavor(&self) -> SearchFlavor {
        self.flavor
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.auth {
            Some((login, password)) => req.basic_auth(login, password.as_deref()),
            None => req,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let resp = self.request(Method::GET, "/").send().await?;
        check_response(resp).await.map(drop)
    }
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

/// Pair bulk response items with the submitted documents, in order.
fn bulk_outcomes(docs: &[NormalizedDocument], resp: BulkResponse) -> Vec<ItemOutcome> {
    let mut items = resp.items.into_iter();
    docs.iter()
        .map(|doc| {
            let Some(item) = items.next() else {
                return ItemOutcome::failed(&doc.id, "no result returned for document");
            };
            let result = item.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);
            let status = result["status"].as_u64().unwrap_or(0);
            match result.get("error") {
                Some(err) if !err.is_null() => {
                    let reason = match (err["type"].as_str(), err["reason"].as_str()) {
                        (Some(t), Some(r)) => format!("{}: {}", t, r),
                        _ => err.to_string(),
                    };
                    ItemOutcome::failed(&doc.id, reason)
                }
                _ if !(200..300).contains(&status) => {
                    ItemOutcome::failed(&doc.id, format!("status {}", status))
                }
                _ => ItemOutcome::ok(&doc.id),
            }
        })
        .collect()
}

#[async_trait]
impl SearchIndex for SearchIndexConnector {
    fn name(&self) -> &str {
        self.flavor.tag()
    }

    async fn ensure_index(&self, index: &str, dims: Option<usize>) -> Result<()> {
        let resp = self.request(Method::HEAD, index).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != StatusCode::NOT_FOUND {
            return check_response(resp).await.map(drop);
        }
        debug!(index, flavor = self.flavor.tag(), ?dims, "creating index");
        let resp = self
            .request(Method::PUT, index)
            .json(&self.flavor.index_body(dims))
            .send()
            .await?;
        match check_response(resp).await {
            Ok(_) => Ok(()),
            // Lost a creation race with another writer.
            Err(Error::Permanent(msg)) if msg.contains("resource_already_exists_exception") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, index: &str, doc: &NormalizedDocument) -> Result<()> {
        let resp = self
            .request(Method::PUT, &format!("{}/_doc/{}", index, doc.id))
            .json(&doc.to_index_body())
            .send()
            .await?;
        check_response(resp).await.map(drop)
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        docs: &[NormalizedDocument],
    ) -> Result<Vec<ItemOutcome>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = String::new();
        for doc in docs {
            let action = json!({ "index": { "_index": index, "_id": doc.id } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc.to_index_body().to_string());
            body.push('\n');
        }
        let resp = self
            .request(Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let parsed: BulkResponse = resp.json().await.map_err(Error::permanent)?;
        Ok(bulk_outcomes(docs, parsed))
    }

    async fn count(&self, index: &str) -> Result<usize> {
        let resp = self
            .request(Method::GET, &format!("{}/_count", index))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let body: Value = check_response(resp).await?.json().await.map_err(Error::permanent)?;
        Ok(body["count"].as_u64().unwrap_or(0) as usize)
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let resp = self
            .request(Method::GET, &format!("{}/_doc/{}", index, id))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check_response(resp).await?.json().await.map_err(Error::permanent)?;
        Ok(body.get("_source").cloned())
    }
}
