//! Arxiv source: Atom feed search plus PDF download.
//!
//! # Configuration
//!
//! ```toml
//! [jobs.papers.source]
//! source_type = "arxiv"
//! base_url = "http://export.arxiv.org/api/query"
//!
//! [jobs.papers.extract]
//! search_category = "cs.AI"
//! page_size = 100
//! max_results = 500
//! download_pdfs = true
//!
//! [jobs.papers.resilience]
//! rate_limit = { calls = 1, period_secs = 3.0 }
//! ```
//!
//! Each feed page becomes one batch. PDFs for the entries of a page are
//! downloaded concurrently. A paper whose PDF cannot be downloaded is still
//! emitted, with a plain-text body (title and abstract) and a `pdf_error`
//! metadata field.

use futures::stream::{self, StreamExt};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::connector::{flexible, parse_params};
use crate::error::{check_response, ConfigError, Error, Result};
use crate::extractor::{
    BatchStream, ExtractBatch, ExtractContext, ExtractFilter, ExtractOptions, Extractor,
};
use crate::models::{RawContent, RawRecord};
use crate::resilience::Resilience;

const MIME_PDF: &str = "application/pdf";

#[derive(Debug, Deserialize)]
struct ArxivParams {
    base_url: String,
    #[serde(default = "default_timeout_secs", deserialize_with = "flexible")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone)]
pub struct ArxivConnector {
    client: reqwest::Client,
    base_url: String,
}

impl ArxivConnector {
    pub fn from_params(params: Map<String, Value>) -> Result<Self, ConfigError> {
        let p: ArxivParams = parse_params("arxiv", params)?;
        reqwest::Url::parse(&p.base_url).map_err(|e| {
            ConfigError::invalid("arxiv", format!("base_url '{}': {}", p.base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(p.timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("arxiv", e))?;
        Ok(Self {
            client,
            base_url: p.base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run one feed query and parse the entries.
    pub async fn query(&self, params: &[(&str, String)]) -> Result<Vec<ArxivEntry>> {
        let resp = self.client.get(&self.base_url).query(params).send().await?;
        let body = check_response(resp).await?.text().await?;
        parse_feed(&body)
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        let bytes = check_response(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    pub async fn check(&self) -> Result<()> {
        self.query(&[
            ("search_query", "all:test".to_string()),
            ("max_results", "0".to_string()),
        ])
        .await
        .map(drop)
    }
}

/// One `<entry>` of an Atom feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArxivEntry {
    pub arxiv_id: String,
    pub title: String,
    pub summary: String,
    pub published: String,
    pub updated: String,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub pdf_url: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Id,
    Title,
    Summary,
    Published,
    Updated,
    AuthorName,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        Some(match tag {
            b"id" => Field::Id,
            b"title" => Field::Title,
            b"summary" => Field::Summary,
            b"published" => Field::Published,
            b"updated" => Field::Updated,
            b"name" => Field::AuthorName,
            _ => return None,
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn feed_error(e: impl std::fmt::Display) -> Error {
    Error::permanent(format!("malformed arxiv feed: {}", e))
}

/// Parse an Arxiv Atom feed. An API error entry becomes a permanent error.
pub fn parse_feed(xml: &str) -> Result<Vec<ArxivEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<ArxivEntry> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"entry" => current = Some(ArxivEntry::default()),
                b"link" | b"category" => {
                    if let Some(entry) = current.as_mut() {
                        apply_attributes(entry, &e)?;
                    }
                }
                tag => {
                    if current.is_some() {
                        if let Some(f) = Field::from_tag(tag) {
                            field = Some(f);
                            text.clear();
                        }
                    }
                }
            },
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    apply_attributes(entry, &e)?;
                }
            }
            Ok(Event::Text(t)) if field.is_some() => {
                text.push_str(&t.unescape().map_err(feed_error)?);
            }
            Ok(Event::End(e)) => {
                let tag = e.local_name();
                if tag.as_ref() == b"entry" {
                    if let Some(entry) = current.take() {
                        if entry.arxiv_id.starts_with("errors#") {
                            return Err(Error::permanent(format!(
                                "arxiv api error: {}",
                                entry.summary
                            )));
                        }
                        entries.push(entry);
                    }
                } else if let (Some(f), Some(entry)) = (field, current.as_mut()) {
                    if Field::from_tag(tag.as_ref()) == Some(f) {
                        let value = text.trim().to_string();
                        match f {
                            Field::Id => {
                                entry.arxiv_id =
                                    value.rsplit('/').next().unwrap_or_default().to_string()
                            }
                            Field::Title => entry.title = collapse_whitespace(&value),
                            Field::Summary => entry.summary = collapse_whitespace(&value),
                            Field::Published => entry.published = value,
                            Field::Updated => entry.updated = value,
                            Field::AuthorName => entry.authors.push(collapse_whitespace(&value)),
                        }
                        field = None;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(feed_error(e)),
            _ => {}
        }
    }
    Ok(entries)
}

fn apply_attributes(entry: &mut ArxivEntry, e: &BytesStart<'_>) -> Result<()> {
    let mut href = None;
    let mut term = None;
    let mut is_pdf = false;
    for attr in e.attributes() {
        let attr = attr.map_err(feed_error)?;
        let value = attr.unescape_value().map_err(feed_error)?;
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"term" => term = Some(value.into_owned()),
            b"type" if value == MIME_PDF => is_pdf = true,
            b"title" if value == "pdf" => is_pdf = true,
            _ => {}
        }
    }
    match e.local_name().as_ref() {
        b"link" if is_pdf && entry.pdf_url.is_none() => entry.pdf_url = href,
        b"category" => entry.categories.extend(term),
        _ => {}
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ArxivExtractOptions {
    pub search_category: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub download_pdfs: bool,
}

fn default_page_size() -> usize {
    100
}
fn default_max_results() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl ExtractOptions for ArxivExtractOptions {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.search_category.trim().is_empty() {
            return Err("search_category must not be empty".into());
        }
        if self.page_size == 0 || self.page_size > 2000 {
            return Err("page_size must be in 1..=2000".into());
        }
        if self.max_results == 0 {
            return Err("max_results must be >= 1".into());
        }
        Ok(())
    }
}

pub struct ArxivExtractor {
    connector: ArxivConnector,
    options: ArxivExtractOptions,
    source: String,
    resilience: Resilience,
    concurrency: usize,
}

impl ArxivExtractor {
    pub fn new(connector: ArxivConnector, options: ArxivExtractOptions, ctx: ExtractContext) -> Self {
        Self {
            connector,
            options,
            source: ctx.source_label,
            resilience: ctx.resilience,
            concurrency: ctx.concurrency.max(1),
        }
    }

    fn search_query(&self, filter: &ExtractFilter) -> String {
        let mut query = format!("cat:{}", self.options.search_category.trim());
        if filter.since.is_some() || filter.until.is_some() {
            let from = filter
                .since
                .map(|d| format!("{}0000", d.format("%Y%m%d")))
                .unwrap_or_else(|| "*".into());
            let to = filter
                .until
                .map(|d| format!("{}2359", d.format("%Y%m%d")))
                .unwrap_or_else(|| "*".into());
            query.push_str(&format!(" AND submittedDate:[{} TO {}]", from, to));
        }
        query
    }

    fn cap(&self, filter: &ExtractFilter) -> usize {
        filter
            .limit
            .map_or(self.options.max_results, |l| l.min(self.options.max_results))
    }

    async fn next_page(
        &self,
        query: &str,
        filter: &ExtractFilter,
        start: Option<usize>,
    ) -> Result<Option<(ExtractBatch, Option<usize>)>> {
        let Some(start) = start else {
            return Ok(None);
        };
        let cap = self.cap(filter);
        if start >= cap {
            return Ok(None);
        }
        let want = self.options.page_size.min(cap - start);
        let params = [
            ("search_query", query.to_string()),
            ("start", start.to_string()),
            ("max_results", want.to_string()),
            ("sortBy", "submittedDate".to_string()),
            ("sortOrder", "descending".to_string()),
        ];
        let mut entries = self
            .resilience
            .call("arxiv query", || self.connector.query(&params))
            .await?;
        entries.truncate(want);
        if entries.is_empty() {
            return Ok(None);
        }
        let got = entries.len();
        debug!(source = %self.source, start, entries = got, "fetched arxiv page");

        let records: Vec<RawRecord> = stream::iter(entries)
            .map(|entry| self.to_record(entry))
            .buffered(self.concurrency)
            .collect()
            .await;

        let next = (got == want).then_some(start + got);
        Ok(Some((
            ExtractBatch {
                records,
                failures: Vec::new(),
            },
            next,
        )))
    }

    async fn to_record(&self, entry: ArxivEntry) -> RawRecord {
        let mut metadata = Map::new();
        metadata.insert("arxiv_id".into(), Value::String(entry.arxiv_id.clone()));
        metadata.insert("title".into(), Value::String(entry.title.clone()));
        metadata.insert("abstract".into(), Value::String(entry.summary.clone()));
        metadata.insert("published".into(), Value::String(entry.published.clone()));
        if !entry.updated.is_empty() {
            metadata.insert("updated".into(), Value::String(entry.updated.clone()));
        }
        metadata.insert(
            "authors".into(),
            Value::Array(entry.authors.iter().cloned().map(Value::String).collect()),
        );
        metadata.insert(
            "categories".into(),
            Value::Array(entry.categories.iter().cloned().map(Value::String).collect()),
        );
        if let Some(url) = &entry.pdf_url {
            metadata.insert("pdf_url".into(), Value::String(url.clone()));
        }

        let pdf = match (&entry.pdf_url, self.options.download_pdfs) {
            (Some(url), true) => Some(
                self.resilience
                    .call("arxiv pdf", || self.connector.download(url))
                    .await,
            ),
            (None, true) => Some(Err(Error::permanent("entry has no pdf link"))),
            (_, false) => None,
        };

        let content = match pdf {
            Some(Ok(body)) => RawContent::Document {
                content_type: MIME_PDF.to_string(),
                body,
                attachments: Vec::new(),
            },
            other => {
                if let Some(Err(e)) = other {
                    warn!(source = %self.source, paper = %entry.arxiv_id, error = %e.report(), "pdf download failed");
                    metadata.insert("pdf_error".into(), Value::String(e.report()));
                }
                RawContent::Document {
                    content_type: "text/plain".to_string(),
                    body: format!("{}\n\n{}", entry.title, entry.summary).into_bytes(),
                    attachments: Vec::new(),
                }
            }
        };

        RawRecord {
            id: entry.arxiv_id,
            source: self.source.clone(),
            metadata,
            content,
        }
    }
}

impl Extractor for ArxivExtractor {
    fn source_label(&self) -> &str {
        &self.source
    }

    fn extract<'a>(&'a self, filter: &'a ExtractFilter) -> BatchStream<'a> {
        let query = self.search_query(filter);
        stream::try_unfold(Some(0usize), move |start| {
            let query = query.clone();
            async move { self.next_page(&query, filter, start).await }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>http://arxiv.org/api/query</id>
  <title type="html">ArXiv Query</title>
  <entry>
    <id>http://arxiv.org/abs/2401.00001v2</id>
    <updated>2024-01-03T00:00:00Z</updated>
    <published>2024-01-01T00:00:00Z</published>
    <title>Attention   Is
      Everything &amp; More</title>
    <summary>  We study things.
    </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2401.00001v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.00001v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.AI"/>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2401.00002v1</id>
    <published>2024-01-02T00:00:00Z</published>
    <title>No PDF Here</title>
    <summary>Short.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_entries() {
        let entries = parse_feed(FEED).unwrap();
        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert_eq!(first.arxiv_id, "2401.00001v2");
        assert_eq!(first.title, "Attention Is Everything & More");
        assert_eq!(first.summary, "We study things.");
        assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(first.categories, vec!["cs.AI", "cs.LG"]);
        assert_eq!(
            first.pdf_url.as_deref(),
            Some("http://arxiv.org/pdf/2401.00001v2")
        );
        assert_eq!(entries[1].pdf_url, None);
    }

    #[test]
    fn test_api_error_entry_is_permanent() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format</id>
            <summary>incorrect id format</summary></entry></feed>"#;
        let err = parse_feed(xml).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("incorrect id format"));
    }

    #[test]
    fn test_malformed_feed_is_error() {
        assert!(parse_feed("<feed><entry><title>x</feed>").is_err());
    }

    #[tokio::test]
    async fn test_search_query_with_dates() {
        let mut params = Map::new();
        params.insert("base_url".into(), Value::String("http://localhost/api".into()));
        let ex = ArxivExtractor::new(
            ArxivConnector::from_params(params).unwrap(),
            ArxivExtractOptions {
                search_category: "cs.AI".into(),
                page_size: 10,
                max_results: 30,
                download_pdfs: false,
            },
            ExtractContext {
                source_label: "arxiv:cs.AI".into(),
                resilience: Resilience::passthrough(),
                concurrency: 1,
            },
        );
        assert_eq!(ex.search_query(&ExtractFilter::default()), "cat:cs.AI");
        let filter = ExtractFilter {
            since: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
            until: None,
            limit: Some(5),
        };
        assert_eq!(
            ex.search_query(&filter),
            "cat:cs.AI AND submittedDate:[202401010000 TO *]"
        );
        assert_eq!(ex.cap(&filter), 5);
    }
}
