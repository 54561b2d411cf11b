//! # Ingest Harness
//!
//! A configuration-driven ETL framework that moves records from databases,
//! mailboxes, and paper archives into an OpenSearch or Elasticsearch index.
//!
//! Each job in the config names a source connector, extractor options, a
//! transformer, a resilience policy, and a sink. `ih run <job>` streams
//! batches through the pipeline and reports partial success record by
//! record.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Credentials │──▶│ Connectors │──▶│ Extractors  │──▶│Transformers│
//! │env/file/inl.│   │rdbms/gmail/│   │ batch stream│   │struct/unstr│
//! └─────────────┘   │arxiv/search│   └─────────────┘   └─────┬──────┘
//!                   └────────────┘                           ▼
//!                ┌────────────┐      ┌─────────────┐   ┌────────────┐
//!                │ Resilience │─ ─ ─▶│  Ingestors  │◀──│  Embedder  │
//!                │rate + retry│      │ single/bulk │   │openai/jina │
//!                └────────────┘      └──────┬──────┘   └────────────┘
//!                                           ▼
//!                                    OpenSearch / ES
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Raw records and normalized documents |
//! | [`credentials`] | Credential providers and factory |
//! | [`resilience`] | Rate limiter and retry policy |
//! | [`connector`] | Connector factory |
//! | [`connector_rdbms`] | SQLite source |
//! | [`connector_gmail`] | Gmail source |
//! | [`connector_arxiv`] | arXiv source |
//! | [`connector_search`] | OpenSearch / Elasticsearch sink |
//! | [`extractor`] | Extractor contract and factory |
//! | [`parse`] | Text extraction from HTML, PDF, and OOXML |
//! | [`chunk`] | Paragraph chunker |
//! | [`transform`] | Structured and unstructured transformers |
//! | [`embedding`] | Embedding providers |
//! | [`index`] | Sink index contract and in-memory index |
//! | [`loader`] | Single and bulk ingestors |
//! | [`ingest`] | Pipeline driver |
//! | [`progress`] | Run progress reporting |
//! | [`jobs`] | Job listing and connectivity checks |

pub mod chunk;
pub mod config;
pub mod connector;
pub mod connector_arxiv;
pub mod connector_gmail;
pub mod connector_rdbms;
pub mod connector_search;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod loader;
pub mod models;
pub mod parse;
pub mod progress;
pub mod resilience;
pub mod transform;
