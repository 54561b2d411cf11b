//! Pipeline driver: runs one job end to end.
//!
//! ```text
//! credentials ─▶ connectors ─▶ extractor ─▶ transformer ─▶ ingestor ─▶ index
//!                                 (stream)    (blocking pool)  (single/bulk)
//! ```
//!
//! One [`Resilience`] is built per run and cloned into every component, so
//! the extractor, attachment fetches, and sink requests all draw from the
//! same rate-limit bucket.
//!
//! Batches flow through the pipeline one at a time. Cancellation is
//! observed while waiting for the next batch, between batches, and by the
//! bulk ingestor before each sub-batch. Connectors are closed on every
//! exit path.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConnectorConfig, CredentialRef, JobConfig};
use crate::connector::{Connector, ConnectorFactory};
use crate::credentials::{Credential, CredentialFactory};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{ConfigError, Result};
use crate::extractor::{create_extractor, ExtractContext, ExtractFilter};
use crate::index::{InMemoryIndex, SearchIndex};
use crate::loader::create_ingestor;
use crate::models::{ItemFailure, SkippedRecord};
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::resilience::Resilience;
use crate::transform::{create_transformer, transform_concurrent};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub filter: ExtractFilter,
    /// Write into a process-local index instead of the configured sink,
    /// and skip embedding.
    pub dry_run: bool,
}

/// What a run did, record by record.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub job: String,
    pub dry_run: bool,
    /// Records read from the source, including ones that failed to fetch.
    pub extracted: usize,
    /// Records that produced at least one document.
    pub transformed: usize,
    /// Documents produced (attachments and chunks included).
    pub documents: usize,
    pub skipped: Vec<SkippedRecord>,
    pub ingested: usize,
    pub failed: Vec<ItemFailure>,
    pub not_submitted: Vec<String>,
    pub cancelled: bool,
    /// Set when the source stream ended with an error.
    pub aborted: Option<String>,
}

impl RunSummary {
    fn new(job: &str, dry_run: bool) -> Self {
        Self {
            job: job.to_string(),
            dry_run,
            ..Default::default()
        }
    }

    /// Nothing skipped, failed, or left behind.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
            && self.failed.is_empty()
            && self.not_submitted.is_empty()
            && !self.cancelled
            && self.aborted.is_none()
    }
}

/// Run `job_name` from `config` to completion, cancellation, or a fatal
/// source error.
///
/// Configuration and credential problems are returned as `Err` before any
/// record is read. Everything after that is reported in the summary.
pub async fn run_job(
    config: &Config,
    job_name: &str,
    options: &RunOptions,
    progress: &dyn RunProgressReporter,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let job = config.job(job_name)?;
    let credentials = CredentialFactory::from_config(config)?;
    let resilience = job.resilience.build();
    let factory = ConnectorFactory::with_builtins();

    let source = build_connector(&factory, &credentials, &job.source, &resilience).await?;
    let sink = if options.dry_run {
        None
    } else {
        match build_connector(&factory, &credentials, &job.sink.connector, &resilience).await {
            Ok(c) => Some(c),
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        }
    };

    info!(
        job = job_name,
        source = %source.describe(),
        sink = sink.as_ref().map(|s| s.describe()).unwrap_or_else(|| "in-memory".into()),
        "starting run"
    );

    let result = drive(
        config,
        job_name,
        job,
        options,
        &source,
        sink.as_ref(),
        &credentials,
        resilience,
        progress,
        cancel,
    )
    .await;

    source.close().await;
    if let Some(sink) = sink {
        sink.close().await;
    }
    result
}

async fn build_connector(
    factory: &ConnectorFactory,
    credentials: &CredentialFactory,
    config: &ConnectorConfig,
    resilience: &Resilience,
) -> Result<Connector> {
    let credential = resolve_optional(credentials, config.credential.as_ref(), resilience).await?;
    Ok(factory.create(config, credential.as_ref())?)
}

async fn resolve_optional(
    credentials: &CredentialFactory,
    cref: Option<&CredentialRef>,
    resilience: &Resilience,
) -> Result<Option<Credential>> {
    match cref {
        Some(cref) => Ok(Some(credentials.resolve_ref(cref, resilience).await?)),
        None => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    config: &Config,
    job_name: &str,
    job: &JobConfig,
    options: &RunOptions,
    source: &Connector,
    sink: Option<&Connector>,
    credentials: &CredentialFactory,
    resilience: Resilience,
    progress: &dyn RunProgressReporter,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let index: Arc<dyn SearchIndex> = match sink {
        Some(Connector::SearchIndex(c)) => Arc::new(c.clone()),
        Some(other) => {
            return Err(ConfigError::invalid(
                format!("job '{}'", job_name),
                format!("'{}' is not a search index", other.source_type()),
            )
            .into())
        }
        None => Arc::new(InMemoryIndex::new()),
    };

    let embedder: Option<Arc<dyn Embedder>> = if config.embedding.is_enabled() && !options.dry_run {
        Some(create_embedder(&config.embedding, credentials).await?)
    } else {
        None
    };

    if job.sink.create_index {
        let dims = embedder.as_ref().map(|e| e.dims());
        resilience
            .call("ensure index", || index.ensure_index(&job.sink.index, dims))
            .await?;
    }

    let extractor = create_extractor(
        source,
        &job.extract,
        ExtractContext {
            source_label: format!("{}:{}", source.source_type(), job_name),
            resilience: resilience.clone(),
            concurrency: job.concurrency,
        },
    )?;
    let transformer = create_transformer(&job.transform_config());
    let ingestor = create_ingestor(&job.sink, index, resilience, embedder);

    let mut summary = RunSummary::new(job_name, options.dry_run);
    let mut stream = extractor.extract(&options.filter);
    let mut batch_no = 0u64;

    loop {
        batch_no += 1;
        progress.report(RunProgressEvent::Extracting {
            job: job_name.to_string(),
            batch: batch_no,
        });

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }
            next = stream.next() => next,
        };
        let batch = match next {
            None => break,
            Some(Ok(batch)) => batch,
            Some(Err(e)) => {
                error!(job = job_name, error = %e.report(), "source failed, stopping run");
                summary.aborted = Some(e.report());
                break;
            }
        };

        summary.extracted += batch.len();
        summary.skipped.extend(batch.failures);

        let outcome =
            transform_concurrent(Arc::clone(&transformer), batch.records, job.concurrency).await;
        summary.transformed += outcome.transformed;
        summary.documents += outcome.documents.len();
        summary.skipped.extend(outcome.skipped);

        if cancel.is_cancelled() {
            summary
                .not_submitted
                .extend(outcome.documents.into_iter().map(|d| d.id));
            summary.cancelled = true;
            break;
        }

        let report = ingestor.ingest_documents(outcome.documents, cancel).await;
        summary.ingested += report.succeeded.len();
        summary.failed.extend(report.failed);
        summary.not_submitted.extend(report.not_submitted);

        progress.report(RunProgressEvent::Batch {
            job: job_name.to_string(),
            batch: batch_no,
            extracted: summary.extracted as u64,
            ingested: summary.ingested as u64,
            failed: summary.failed.len() as u64,
        });

        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
    }

    if summary.cancelled {
        warn!(job = job_name, not_submitted = summary.not_submitted.len(), "run cancelled");
    }
    info!(
        job = job_name,
        extracted = summary.extracted,
        ingested = summary.ingested,
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        "run finished"
    );
    Ok(summary)
}

/// Print the run summary to stdout.
pub fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("run {} (dry-run)", summary.job);
    } else {
        println!("run {}", summary.job);
    }
    println!("  extracted: {} records", summary.extracted);
    println!("  transformed: {} records", summary.transformed);
    println!("  documents: {}", summary.documents);
    println!("  skipped: {}", summary.skipped.len());
    for s in &summary.skipped {
        println!("    {}: {}", s.id, s.reason);
    }
    println!("  ingested: {}", summary.ingested);
    println!("  failed: {}", summary.failed.len());
    for f in &summary.failed {
        println!("    {}: {}", f.id, f.reason);
    }
    if !summary.not_submitted.is_empty() {
        println!("  not submitted: {}", summary.not_submitted.len());
    }
    match (&summary.aborted, summary.cancelled) {
        (Some(reason), _) => println!("aborted: {}", reason),
        (None, true) => println!("cancelled"),
        (None, false) => println!("ok"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::progress::NoProgress;

    async fn seeded_db(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("items.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, uid TEXT, title TEXT, body TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for i in 1..=5 {
            let uid = if i == 3 { None } else { Some(format!("item-{}", i)) };
            sqlx::query("INSERT INTO items (id, uid, title, body) VALUES (?, ?, ?, ?)")
                .bind(i)
                .bind(uid)
                .bind(format!("title {}", i))
                .bind(format!("body {}", i))
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
        url
    }

    fn config_for(url: &str) -> Config {
        parse_config(&format!(
            r#"
            [jobs.items.source]
            source_type = "rdbms"
            url = "{url}"

            [jobs.items.extract]
            query = "SELECT id, uid, title, body FROM items ORDER BY id"
            id_column = "id"
            batch_size = 2

            [jobs.items.transform]
            kind = "structured"
            id_column = "uid"
            text_columns = ["title", "body"]

            [jobs.items.sink]
            index = "items"
            [jobs.items.sink.connector]
            source_type = "opensearch"
            host = "localhost"
            "#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_reports_skips_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let url = seeded_db(&dir).await;
        let config = config_for(&url);
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let summary = run_job(&config, "items", &options, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.extracted, 5);
        assert_eq!(summary.transformed, 4);
        assert_eq!(summary.ingested, 4);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].id, "3");
        assert!(!summary.cancelled);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let url = seeded_db(&dir).await;
        let config = config_for(&url);
        let options = RunOptions {
            dry_run: true,
            filter: ExtractFilter {
                limit: Some(2),
                ..Default::default()
            },
        };
        let summary = run_job(&config, "items", &options, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.extracted, 2);
        assert!(summary.is_clean());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let url = seeded_db(&dir).await;
        let config = config_for(&url);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let summary = run_job(&config, "items", &options, &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.extracted, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_config_error() {
        let config = Config::default();
        let err = run_job(
            &config,
            "nope",
            &RunOptions::default(),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(ConfigError::UnknownJob(_))));
    }
}
