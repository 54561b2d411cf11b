//! Extractor contract and the factory that picks one per source.
//!
//! An extractor turns a source [`Connector`] into a lazy stream of
//! [`ExtractBatch`]es. The stream is finite and not resumable: re-running
//! with the same [`ExtractFilter`] starts over from the beginning.
//!
//! Row sources yield one batch per page of rows. Document sources yield one
//! batch per listing page, with one [`RawRecord`] per message or paper.
//! Items that cannot be fetched end up in [`ExtractBatch::failures`]
//! instead of failing the stream; only a failed listing call ends it.

use chrono::NaiveDate;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;

use crate::connector::Connector;
use crate::connector_arxiv::{ArxivExtractOptions, ArxivExtractor};
use crate::connector_gmail::{GmailExtractOptions, GmailExtractor};
use crate::connector_rdbms::{RdbmsExtractOptions, RdbmsExtractor};
use crate::error::{ConfigError, Result};
use crate::models::{RawRecord, SkippedRecord};
use crate::resilience::Resilience;

/// Narrows what an extraction run reads.
#[derive(Debug, Clone, Default)]
pub struct ExtractFilter {
    /// Inclusive lower bound on the source's date field.
    pub since: Option<NaiveDate>,
    /// Inclusive upper bound on the source's date field.
    pub until: Option<NaiveDate>,
    /// Stop after this many items.
    pub limit: Option<usize>,
}

impl ExtractFilter {
    /// How many more items may be read after `seen`, if limited.
    pub fn remaining(&self, seen: usize) -> Option<usize> {
        self.limit.map(|l| l.saturating_sub(seen))
    }
}

#[derive(Debug, Default)]
pub struct ExtractBatch {
    pub records: Vec<RawRecord>,
    pub failures: Vec<SkippedRecord>,
}

impl ExtractBatch {
    pub fn len(&self) -> usize {
        self.records.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type BatchStream<'a> = BoxStream<'a, Result<ExtractBatch>>;

pub trait Extractor: Send + Sync {
    /// Label stamped on every record, e.g. `gmail:inbox`.
    fn source_label(&self) -> &str;

    fn extract<'a>(&'a self, filter: &'a ExtractFilter) -> BatchStream<'a>;
}

/// Runtime context shared by all extractors of a job.
#[derive(Clone)]
pub struct ExtractContext {
    pub source_label: String,
    pub resilience: Resilience,
    pub concurrency: usize,
}

/// Options types implement this to reject bad values up front.
pub(crate) trait ExtractOptions: DeserializeOwned {
    fn validate(&self) -> std::result::Result<(), String>;
}

pub(crate) fn parse_options<T: ExtractOptions>(
    source_type: &str,
    options: &toml::Table,
) -> Result<T, ConfigError> {
    let component = format!("{} extract", source_type);
    let parsed: T = toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e| ConfigError::invalid(&component, e))?;
    parsed
        .validate()
        .map_err(|reason| ConfigError::invalid(&component, reason))?;
    Ok(parsed)
}

/// Check the `[extract]` table of a job without building anything.
pub fn validate_options(source_type: &str, options: &toml::Table) -> Result<(), ConfigError> {
    match source_type {
        "rdbms" => parse_options::<RdbmsExtractOptions>(source_type, options).map(drop),
        "gmail" => parse_options::<GmailExtractOptions>(source_type, options).map(drop),
        "arxiv" => parse_options::<ArxivExtractOptions>(source_type, options).map(drop),
        other => Err(ConfigError::invalid(
            "extract",
            format!("'{}' is not an extractable source", other),
        )),
    }
}

/// Build the extractor that matches the connector's source shape.
pub fn create_extractor(
    connector: &Connector,
    options: &toml::Table,
    ctx: ExtractContext,
) -> Result<Box<dyn Extractor>, ConfigError> {
    let extractor: Box<dyn Extractor> = match connector {
        Connector::Rdbms(c) => Box::new(RdbmsExtractor::new(
            c.clone(),
            parse_options("rdbms", options)?,
            ctx,
        )),
        Connector::Gmail(c) => Box::new(GmailExtractor::new(
            c.clone(),
            parse_options("gmail", options)?,
            ctx,
        )),
        Connector::Arxiv(c) => Box::new(ArxivExtractor::new(
            c.clone(),
            parse_options("arxiv", options)?,
            ctx,
        )),
        Connector::SearchIndex(c) => {
            return Err(ConfigError::invalid(
                "extract",
                format!("{} is a sink and cannot be extracted from", c.flavor().tag()),
            ))
        }
    };
    Ok(extractor)
}
