//! Error taxonomy for the ingest pipeline.
//!
//! Errors fall into a small number of classes that decide how the pipeline
//! reacts:
//!
//! | Class | Reaction |
//! |-------|----------|
//! | [`ConfigError`] | Fatal, aborts the job before any I/O |
//! | [`CredentialError`] | Fatal for the connector that needed it |
//! | [`Error::Transient`] | Retried by [`crate::resilience::Resilience`] |
//! | [`Error::Permanent`] | Surfaced immediately |
//! | [`Error::RecordParse`] | Logged and skipped, the batch continues |
//! | [`Error::PartialIngest`] | Per-item failure inside a bulk submission |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Invalid or inconsistent configuration. Raised before any I/O happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown source type '{tag}' (registered: {})", known.join(", "))]
    UnknownSourceType { tag: String, known: Vec<String> },

    #[error("invalid {component} config: {reason}")]
    InvalidConfig { component: String, reason: String },

    #[error("unknown job '{0}'")]
    UnknownJob(String),
}

impl ConfigError {
    pub fn invalid(component: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidConfig {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to resolve a credential.
///
/// `NotFound` and `ProviderUnavailable` are kept apart: only the latter is
/// worth retrying.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential '{identifier}' not found in provider '{provider}'")]
    NotFound {
        provider: String,
        identifier: String,
    },

    #[error("credential provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("unknown credential provider '{0}'")]
    UnknownProvider(String),
}

/// Why a transient failure happened. Only used for reporting and for
/// honouring server-provided delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Network,
    RateLimited,
    ServerError,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::Timeout => "timeout",
            TransientKind::Network => "network",
            TransientKind::RateLimited => "rate limited",
            TransientKind::ServerError => "server error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("transient I/O error ({kind}): {message}")]
    Transient {
        kind: TransientKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("permanent I/O error: {0}")]
    Permanent(String),

    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("record '{id}' could not be parsed: {reason}")]
    RecordParse { id: String, reason: String },

    #[error("{failed} of {total} documents failed to ingest")]
    PartialIngest { failed: usize, total: usize },

    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Error::Transient {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl fmt::Display) -> Self {
        Error::Permanent(message.to_string())
    }

    pub fn parse(id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::RecordParse {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the retry layer may try the failed call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient { .. }
                | Error::Credential(CredentialError::ProviderUnavailable { .. })
        )
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Innermost cause, looking through `RetriesExhausted`.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Human-readable message including the wrapped cause.
    pub fn report(&self) -> String {
        match self {
            Error::RetriesExhausted { attempts, source } => {
                format!("retries exhausted after {} attempts: {}", attempts, source.report())
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::transient(TransientKind::Timeout, e.to_string())
        } else if e.is_connect() || e.is_request() {
            Error::transient(TransientKind::Network, e.to_string())
        } else if let Some(status) = e.status() {
            classify_status(status, e.to_string(), None)
        } else {
            Error::permanent(e)
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Error::transient(TransientKind::Network, e.to_string())
            }
            other => Error::permanent(other),
        }
    }
}

/// Map a non-success HTTP status onto the taxonomy: 429, 408 and 5xx are
/// transient, everything else is permanent.
pub fn classify_status(
    status: reqwest::StatusCode,
    message: String,
    retry_after: Option<Duration>,
) -> Error {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::Transient {
            kind: TransientKind::RateLimited,
            message,
            retry_after,
        }
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT {
        Error::transient(TransientKind::Timeout, message)
    } else if status.is_server_error() {
        Error::transient(TransientKind::ServerError, message)
    } else {
        Error::Permanent(message)
    }
}

/// Pass successful responses through; turn everything else into a
/// classified [`Error`], reading `Retry-After` when present.
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    let mut snippet: String = body.chars().take(300).collect();
    if snippet.is_empty() {
        snippet = status.canonical_reason().unwrap_or("").to_string();
    }
    Err(classify_status(
        status,
        format!("{} returned {}: {}", url, status.as_u16(), snippet),
        retry_after,
    ))
}
