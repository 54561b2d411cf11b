//! Connector factory: maps source-type tags to constructors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectorFactory               │
//! │  "rdbms"         → RdbmsConnector   (source) │
//! │  "gmail"         → GmailConnector   (source) │
//! │  "arxiv"         → ArxivConnector   (source) │
//! │  "opensearch"    → SearchIndexConnector (sink)│
//! │  "elasticsearch" → SearchIndexConnector (sink)│
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!                  run_job() → extract/transform/load
//! ```
//!
//! Tags are matched case-insensitively. An unregistered tag is always a
//! [`ConfigError::UnknownSourceType`]; there is no fallback connector.
//!
//! Constructors never perform I/O. They validate the parameter table
//! (connector params merged with the resolved credential) and fail with
//! [`ConfigError::InvalidConfig`] if anything is missing or malformed.
//! Use [`Connector::check`] to test connectivity.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::ConnectorConfig;
use crate::connector_arxiv::ArxivConnector;
use crate::connector_gmail::GmailConnector;
use crate::connector_rdbms::RdbmsConnector;
use crate::connector_search::{SearchFlavor, SearchIndexConnector};
use crate::credentials::Credential;
use crate::error::{ConfigError, Result};

/// Whether a connector reads records or receives documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorRole {
    Source,
    Sink,
}

/// A live handle to a source or sink system.
///
/// Created per run by [`ConnectorFactory::create`] and released with
/// [`Connector::close`].
#[derive(Clone)]
pub enum Connector {
    Rdbms(RdbmsConnector),
    Gmail(GmailConnector),
    Arxiv(ArxivConnector),
    SearchIndex(SearchIndexConnector),
}

impl Connector {
    /// The tag this connector was built for.
    pub fn source_type(&self) -> &'static str {
        match self {
            Connector::Rdbms(_) => "rdbms",
            Connector::Gmail(_) => "gmail",
            Connector::Arxiv(_) => "arxiv",
            Connector::SearchIndex(c) => c.flavor().tag(),
        }
    }

    pub fn role(&self) -> ConnectorRole {
        match self {
            Connector::SearchIndex(_) => ConnectorRole::Sink,
            _ => ConnectorRole::Source,
        }
    }

    /// One-line description for `ih check`.
    pub fn describe(&self) -> String {
        match self {
            Connector::Rdbms(c) => format!("rdbms {}", c.url()),
            Connector::Gmail(c) => format!("gmail account {}", c.account()),
            Connector::Arxiv(c) => format!("arxiv {}", c.base_url()),
            Connector::SearchIndex(c) => format!("{} {}", c.flavor().tag(), c.base_url()),
        }
    }

    /// Round trip to the remote system.
    pub async fn check(&self) -> Result<()> {
        match self {
            Connector::Rdbms(c) => c.check().await,
            Connector::Gmail(c) => c.check().await,
            Connector::Arxiv(c) => c.check().await,
            Connector::SearchIndex(c) => c.ping().await,
        }
    }

    /// Release the underlying connection(s).
    pub async fn close(self) {
        if let Connector::Rdbms(c) = self {
            c.close().await;
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector({})", self.describe())
    }
}

/// Builds a connector from its merged parameter table.
pub type ConnectorConstructor = fn(Map<String, Value>) -> Result<Connector, ConfigError>;

struct Registration {
    role: ConnectorRole,
    constructor: ConnectorConstructor,
}

/// Tag → constructor table.
pub struct ConnectorFactory {
    registrations: BTreeMap<String, Registration>,
}

impl ConnectorFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self {
            registrations: BTreeMap::new(),
        }
    }

    /// A factory with every built-in connector registered.
    pub fn with_builtins() -> Self {
        let mut f = Self::new();
        f.register("rdbms", ConnectorRole::Source, |p| {
            RdbmsConnector::from_params(p).map(Connector::Rdbms)
        });
        f.register("gmail", ConnectorRole::Source, |p| {
            GmailConnector::from_params(p).map(Connector::Gmail)
        });
        f.register("arxiv", ConnectorRole::Source, |p| {
            ArxivConnector::from_params(p).map(Connector::Arxiv)
        });
        f.register("opensearch", ConnectorRole::Sink, |p| {
            SearchIndexConnector::from_params(SearchFlavor::OpenSearch, p)
                .map(Connector::SearchIndex)
        });
        f.register("elasticsearch", ConnectorRole::Sink, |p| {
            SearchIndexConnector::from_params(SearchFlavor::Elasticsearch, p)
                .map(Connector::SearchIndex)
        });
        f
    }

    pub fn register(&mut self, tag: &str, role: ConnectorRole, constructor: ConnectorConstructor) {
        self.registrations
            .insert(tag.to_ascii_lowercase(), Registration { role, constructor });
    }

    pub fn source_types(&self) -> Vec<&str> {
        self.registrations.keys().map(String::as_str).collect()
    }

    pub fn role_of(&self, tag: &str) -> Option<ConnectorRole> {
        self.registrations
            .get(&tag.to_ascii_lowercase())
            .map(|r| r.role)
    }

    pub(crate) fn unknown(&self, tag: &str) -> ConfigError {
        ConfigError::UnknownSourceType {
            tag: tag.to_string(),
            known: self.registrations.keys().cloned().collect(),
        }
    }

    /// Build the connector for `config.source_type`.
    ///
    /// Credential fields are merged over the connector params; on a key
    /// conflict the credential wins.
    pub fn create(
        &self,
        config: &ConnectorConfig,
        credential: Option<&Credential>,
    ) -> Result<Connector, ConfigError> {
        let tag = config.source_type.to_ascii_lowercase();
        let registration = self
            .registrations
            .get(&tag)
            .ok_or_else(|| self.unknown(&config.source_type))?;
        let mut params = config.params_json()?;
        if let Some(cred) = credential {
            for (k, v) in cred.secret() {
                params.insert(k.clone(), v.clone());
            }
        }
        (registration.constructor)(params)
    }
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Deserialize a connector's typed parameters.
pub(crate) fn parse_params<T: DeserializeOwned>(
    component: &str,
    params: Map<String, Value>,
) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| ConfigError::invalid(component, e))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueOrText<T> {
    Value(T),
    Text(String),
}

/// Accept `9200` as well as `"9200"`; env-backed credentials are always strings.
pub(crate) fn flexible<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    match ValueOrText::<T>::deserialize(d)? {
        ValueOrText::Value(v) => Ok(v),
        ValueOrText::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Accept `["a", "b"]` as well as `"a b"` or `"a,b"`.
pub(crate) fn string_or_list<'de, D>(d: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<String>),
        One(String),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::Many(v) => v,
        OneOrMany::One(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(source_type: &str, params: toml::Table) -> ConnectorConfig {
        ConnectorConfig::new(source_type, params)
    }

    fn valid_params(tag: &str) -> toml::Table {
        let text = match tag {
            "rdbms" => "url = \"sqlite://items.db\"",
            "gmail" => {
                "refresh_token = \"r\"\nclient_id = \"c\"\nclient_secret = \"s\"\n\
                 token_uri = \"https://oauth2.example.com/token\""
            }
            "arxiv" => "base_url = \"http://export.arxiv.org/api/query\"",
            _ => "host = \"localhost\"\nport = 9200",
        };
        toml::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_every_registered_tag_builds_matching_connector() {
        let factory = ConnectorFactory::with_builtins();
        for tag in factory.source_types() {
            let connector = factory
                .create(&config(tag, valid_params(tag)), None)
                .unwrap_or_else(|e| panic!("{} failed: {}", tag, e));
            assert_eq!(connector.source_type(), tag);
            let expected_role = factory.role_of(tag).unwrap();
            assert_eq!(connector.role(), expected_role);
            match (tag, &connector) {
                ("rdbms", Connector::Rdbms(_))
                | ("gmail", Connector::Gmail(_))
                | ("arxiv", Connector::Arxiv(_))
                | ("opensearch", Connector::SearchIndex(_))
                | ("elasticsearch", Connector::SearchIndex(_)) => {}
                (tag, other) => panic!("{} built {:?}", tag, other),
            }
        }
    }

    #[test]
    fn test_tags_are_case_insensitive() {
        let factory = ConnectorFactory::with_builtins();
        let c = factory
            .create(&config("ArXiv", valid_params("arxiv")), None)
            .unwrap();
        assert_eq!(c.source_type(), "arxiv");
    }

    #[test]
    fn test_unknown_tag_is_explicit_error() {
        let factory = ConnectorFactory::with_builtins();
        for tag in ["ftp", "", "jira", "rdbms2"] {
            let err = factory
                .create(&config(tag, toml::Table::new()), None)
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::UnknownSourceType { .. }),
                "{}: {}",
                tag,
                err
            );
        }
    }

    #[test]
    fn test_invalid_shape_fails_at_construction() {
        let factory = ConnectorFactory::with_builtins();
        // arxiv without base_url
        let err = factory
            .create(&config("arxiv", toml::Table::new()), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
        // gmail without any auth material
        let err = factory
            .create(&config("gmail", toml::Table::new()), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
        // opensearch with a port that is not a number
        let params: toml::Table = toml::from_str("host = \"h\"\nport = \"abc\"").unwrap();
        let err = factory.create(&config("opensearch", params), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
    }

    #[test]
    fn test_credential_fields_are_merged() {
        let factory = ConnectorFactory::with_builtins();
        let mut secret = Map::new();
        secret.insert("refresh_token".into(), Value::String("r".into()));
        secret.insert("client_id".into(), Value::String("c".into()));
        secret.insert("client_secret".into(), Value::String("s".into()));
        let cred = Credential::new("vault", "gmail", secret, Map::new());
        let c = factory
            .create(&config("gmail", toml::Table::new()), Some(&cred))
            .unwrap();
        assert_eq!(c.source_type(), "gmail");
    }

    #[test]
    fn test_registered_constructor_is_used() {
        let mut factory = ConnectorFactory::new();
        factory.register("archive", ConnectorRole::Source, |p| {
            ArxivConnector::from_params(p).map(Connector::Arxiv)
        });
        let c = factory
            .create(&config("archive", valid_params("arxiv")), None)
            .unwrap();
        assert!(matches!(c, Connector::Arxiv(_)));
        assert!(factory.role_of("rdbms").is_none());
    }
}
