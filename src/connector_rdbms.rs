//! Relational source: SQLite through `sqlx`.
//!
//! # Configuration
//!
//! ```toml
//! [jobs.rows.source]
//! source_type = "rdbms"
//! url = "sqlite://data/app.db"
//! max_connections = 4
//!
//! [jobs.rows.extract]
//! query = "SELECT id, title, body, updated_at FROM articles"
//! id_column = "id"
//! batch_size = 500
//! timestamp_column = "updated_at"   # optional, enables --since/--until
//! ```
//!
//! Rows are read page by page with `LIMIT`/`OFFSET` over the configured
//! query, so at most `batch_size` rows are held in memory at once. This
//! source does not go through the resilience layer.

use base64::Engine;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

use crate::connector::{flexible, parse_params};
use crate::error::{ConfigError, Result};
use crate::extractor::{
    BatchStream, ExtractBatch, ExtractContext, ExtractFilter, ExtractOptions, Extractor,
};
use crate::models::{RawContent, RawRecord, SkippedRecord};

const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Deserialize)]
struct RdbmsParams {
    url: String,
    #[serde(default = "default_max_connections", deserialize_with = "flexible")]
    max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Clone)]
pub struct RdbmsConnector {
    pool: SqlitePool,
    url: String,
}

impl RdbmsConnector {
    /// Builds a lazy pool; nothing is opened until the first query.
    pub fn from_params(params: Map<String, Value>) -> Result<Self, ConfigError> {
        let p: RdbmsParams = parse_params("rdbms", params)?;
        if p.max_connections == 0 {
            return Err(ConfigError::invalid("rdbms", "max_connections must be >= 1"));
        }
        let options = SqliteConnectOptions::from_str(&p.url)
            .map_err(|e| ConfigError::invalid("rdbms", format!("bad url '{}': {}", p.url, e)))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(p.max_connections)
            .connect_lazy_with(options);
        Ok(Self { pool, url: p.url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RdbmsExtractOptions {
    pub query: String,
    pub id_column: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub timestamp_column: Option<String>,
}

fn default_batch_size() -> usize {
    500
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

impl ExtractOptions for RdbmsExtractOptions {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        if self.id_column.trim().is_empty() {
            return Err("id_column must not be empty".into());
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(format!("batch_size must be in 1..={}", MAX_BATCH_SIZE));
        }
        if let Some(col) = &self.timestamp_column {
            if !is_identifier(col) {
                return Err(format!("timestamp_column '{}' is not a plain column name", col));
            }
        }
        Ok(())
    }
}

pub struct RdbmsExtractor {
    connector: RdbmsConnector,
    options: RdbmsExtractOptions,
    source: String,
}

impl RdbmsExtractor {
    pub fn new(connector: RdbmsConnector, options: RdbmsExtractOptions, ctx: ExtractContext) -> Self {
        Self {
            connector,
            options,
            source: ctx.source_label,
        }
    }

    fn page_sql(&self, filter: &ExtractFilter) -> String {
        let inner = self.options.query.trim().trim_end_matches(';');
        let mut sql = format!("SELECT * FROM ({}) AS src", inner);
        if let Some(col) = &self.options.timestamp_column {
            let mut clauses = Vec::new();
            if filter.since.is_some() {
                clauses.push(format!("{} >= ?", col));
            }
            if filter.until.is_some() {
                clauses.push(format!("{} <= ?", col));
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
        }
        sql.push_str(" LIMIT ? OFFSET ?");
        sql
    }

    async fn fetch_page(
        &self,
        sql: &str,
        filter: &ExtractFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SqliteRow>> {
        let mut query = sqlx::query(sql);
        if self.options.timestamp_column.is_some() {
            if let Some(since) = filter.since {
                query = query.bind(since.format("%Y-%m-%d").to_string());
            }
            if let Some(until) = filter.until {
                query = query.bind(format!("{} 23:59:59", until.format("%Y-%m-%d")));
            }
        }
        let rows = query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(self.connector.pool())
            .await?;
        Ok(rows)
    }

    /// `position` is the row's offset in the query result; it names rows
    /// that have no usable id.
    fn to_record(&self, row: &SqliteRow, position: usize) -> std::result::Result<RawRecord, SkippedRecord> {
        let columns = row_to_json(row).map_err(|e| SkippedRecord {
            id: format!("row {}", position),
            reason: format!("row decode failed: {}", e),
        })?;
        let id = match columns.get(&self.options.id_column) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(SkippedRecord {
                    id: format!("row {}", position),
                    reason: format!("missing or empty id column '{}'", self.options.id_column),
                })
            }
        };
        Ok(RawRecord {
            id,
            source: self.source.clone(),
            metadata: Map::new(),
            content: RawContent::Row(columns),
        })
    }
}

impl Extractor for RdbmsExtractor {
    fn source_label(&self) -> &str {
        &self.source
    }

    fn extract<'a>(&'a self, filter: &'a ExtractFilter) -> BatchStream<'a> {
        let sql = self.page_sql(filter);
        stream::try_unfold(Some(0usize), move |offset| {
            let sql = sql.clone();
            async move { self.next_page(&sql, filter, offset).await }
        })
        .boxed()
    }
}

impl RdbmsExtractor {
    /// One page of rows starting at `offset`; `None` once the query is drained.
    async fn next_page(
        &self,
        sql: &str,
        filter: &ExtractFilter,
        offset: Option<usize>,
    ) -> Result<Option<(ExtractBatch, Option<usize>)>> {
        let Some(offset) = offset else {
            return Ok(None);
        };
        let page = match filter.remaining(offset) {
            Some(left) => left.min(self.options.batch_size),
            None => self.options.batch_size,
        };
        if page == 0 {
            return Ok(None);
        }
        let rows = self.fetch_page(sql, filter, page, offset).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        debug!(source = %self.source, offset, rows = rows.len(), "fetched rows");
        let n = rows.len();
        let mut batch = ExtractBatch::default();
        for (i, row) in rows.iter().enumerate() {
            match self.to_record(row, offset + i) {
                Ok(r) => batch.records.push(r),
                Err(skip) => batch.failures.push(skip),
            }
        }
        let next = if n < page { None } else { Some(offset + n) };
        Ok(Some((batch, next)))
    }
}

/// Convert a row to a JSON object keyed by column name.
fn row_to_json(row: &SqliteRow) -> std::result::Result<Map<String, Value>, sqlx::Error> {
    let mut out = Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            out.insert(column.name().to_string(), Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "INT8" | "BOOLEAN" => {
                Value::from(row.try_get_unchecked::<i64, _>(idx)?)
            }
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                Value::from(row.try_get_unchecked::<f64, _>(idx)?)
            }
            "BLOB" => {
                let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Resilience;
    use futures::TryStreamExt;

    async fn seed(rows: usize) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT, score REAL, updated_at TEXT, note TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        for i in 1..=rows {
            sqlx::query("INSERT INTO items (id, title, score, updated_at, note) VALUES (?, ?, ?, ?, NULL)")
                .bind(i as i64)
                .bind(format!("item {}", i))
                .bind(i as f64 / 2.0)
                .bind(format!("2024-01-{:02}", i.min(28)))
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
        (dir, format!("sqlite:{}", path.display()))
    }

    fn extractor(url: &str, batch_size: usize) -> RdbmsExtractor {
        let mut params = Map::new();
        params.insert("url".into(), Value::String(url.to_string()));
        let connector = RdbmsConnector::from_params(params).unwrap();
        let options = RdbmsExtractOptions {
            query: "SELECT * FROM items ORDER BY id;".into(),
            id_column: "id".into(),
            batch_size,
            timestamp_column: Some("updated_at".into()),
        };
        RdbmsExtractor::new(
            connector,
            options,
            ExtractContext {
                source_label: "rdbms:items".into(),
                resilience: Resilience::passthrough(),
                concurrency: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_rows_are_paged_by_batch_size() {
        let (_dir, url) = seed(7).await;
        let ex = extractor(&url, 3);
        let filter = ExtractFilter::default();
        let batches: Vec<ExtractBatch> = ex.extract(&filter).try_collect().await.unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.records.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let first = &batches[0].records[0];
        assert_eq!(first.id, "1");
        assert_eq!(first.source, "rdbms:items");
        match &first.content {
            RawContent::Row(cols) => {
                assert_eq!(cols["title"], "item 1");
                assert_eq!(cols["score"], 0.5);
                assert_eq!(cols["note"], Value::Null);
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limit_and_date_filter() {
        let (_dir, url) = seed(10).await;
        let ex = extractor(&url, 4);
        let filter = ExtractFilter {
            since: chrono::NaiveDate::from_ymd_opt(2024, 1, 3),
            until: chrono::NaiveDate::from_ymd_opt(2024, 1, 8),
            limit: Some(5),
        };
        let batches: Vec<ExtractBatch> = ex.extract(&filter).try_collect().await.unwrap();
        let ids: Vec<String> = batches
            .into_iter()
            .flat_map(|b| b.records)
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["3", "4", "5", "6", "7"]);
    }

    #[tokio::test]
    async fn test_missing_id_column_is_reported_not_fatal() {
        let (_dir, url) = seed(2).await;
        let mut ex = extractor(&url, 10);
        ex.options.id_column = "nope".into();
        let filter = ExtractFilter::default();
        let batches: Vec<ExtractBatch> = ex.extract(&filter).try_collect().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].records.is_empty());
        let ids: Vec<&str> = batches[0].failures.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["row 0", "row 1"]);
    }

    #[test]
    fn test_options_validation() {
        let mut opts = RdbmsExtractOptions {
            query: "SELECT 1".into(),
            id_column: "id".into(),
            batch_size: 10,
            timestamp_column: None,
        };
        assert!(opts.validate().is_ok());
        opts.batch_size = MAX_BATCH_SIZE + 1;
        assert!(opts.validate().is_err());
        opts.batch_size = 10;
        opts.timestamp_column = Some("updated_at; DROP TABLE x".into());
        assert!(opts.validate().is_err());
    }
}
