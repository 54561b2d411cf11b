//! Credential providers and the factory that resolves credentials by name.
//!
//! A job refers to a credential as `{ provider = "<name>", id = "<identifier>" }`.
//! The provider name selects one of the `[credentials.<name>]` entries of the
//! config; the identifier is looked up in that provider's backing store.
//!
//! | Kind | Backing store | "Not found" | "Unavailable" |
//! |------|---------------|-------------|---------------|
//! | `env` | `<PREFIX>_<ID>_<FIELD>` variables | no matching variables | never |
//! | `file` | TOML file, one table per id | no table for id | file unreadable or corrupt |
//! | `inline` | entries in the config | no entry for id | never |
//!
//! Resolution has no side effects beyond a read of the store, and the
//! resolved [`Credential`] is never written anywhere.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::{table_to_json, Config, CredentialProviderConfig, CredentialRef};
use crate::error::{CredentialError, Error, Result};
use crate::resilience::Resilience;

/// Secret material resolved from a provider.
///
/// `Debug` only prints field names so credentials never end up in logs.
#[derive(Clone)]
pub struct Credential {
    pub provider: String,
    pub identifier: String,
    secret: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl Credential {
    pub fn new(
        provider: &str,
        identifier: &str,
        secret: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            identifier: identifier.to_string(),
            secret,
            metadata,
        }
    }

    pub fn secret(&self) -> &Map<String, Value> {
        &self.secret
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.secret.get(field).and_then(Value::as_str)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.secret.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("identifier", &self.identifier)
            .field("fields", &self.field_names())
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Name the provider is registered under.
    fn name(&self) -> &str;

    /// Provider kind (`env`, `file`, `inline`).
    fn kind(&self) -> &'static str;

    async fn fetch(&self, identifier: &str) -> Result<Credential, CredentialError>;
}

fn metadata_for(kind: &str) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("provider_kind".into(), Value::String(kind.to_string()));
    m
}

// ═══════════════════════════════════════════════════════════════════════
// Env
// ═══════════════════════════════════════════════════════════════════════

pub struct EnvProvider {
    name: String,
    prefix: String,
}

impl EnvProvider {
    pub fn new(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
        }
    }

    fn var_prefix(&self, identifier: &str) -> String {
        let ident: String = identifier
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}_", self.prefix.to_ascii_uppercase(), ident)
    }
}

#[async_trait]
impl CredentialProvider for EnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "env"
    }

    async fn fetch(&self, identifier: &str) -> Result<Credential, CredentialError> {
        let prefix = self.var_prefix(identifier);
        let secret: Map<String, Value> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .filter(|field| !field.is_empty())
                    .map(|field| (field.to_ascii_lowercase(), Value::String(v)))
            })
            .collect();
        if secret.is_empty() {
            return Err(CredentialError::NotFound {
                provider: self.name.clone(),
                identifier: identifier.to_string(),
            });
        }
        Ok(Credential::new(&self.name, identifier, secret, metadata_for("env")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// File
// ═══════════════════════════════════════════════════════════════════════

pub struct FileProvider {
    name: String,
    path: PathBuf,
}

impl FileProvider {
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> CredentialError {
        CredentialError::ProviderUnavailable {
            provider: self.name.clone(),
            reason: format!("{}: {}", self.path.display(), reason),
        }
    }
}

#[async_trait]
impl CredentialProvider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, identifier: &str) -> Result<Credential, CredentialError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.unavailable(e))?;
        let store: toml::Table = toml::from_str(&content).map_err(|e| self.unavailable(e))?;
        let entry = match store.get(identifier) {
            Some(toml::Value::Table(t)) => t,
            _ => {
                return Err(CredentialError::NotFound {
                    provider: self.name.clone(),
                    identifier: identifier.to_string(),
                })
            }
        };
        let secret = table_to_json(entry, identifier).map_err(|e| self.unavailable(e))?;
        Ok(Credential::new(&self.name, identifier, secret, metadata_for("file")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Inline
// ═══════════════════════════════════════════════════════════════════════

pub struct InlineProvider {
    name: String,
    entries: BTreeMap<String, Map<String, Value>>,
}

impl InlineProvider {
    pub fn new(name: &str, entries: BTreeMap<String, Map<String, Value>>) -> Self {
        Self {
            name: name.to_string(),
            entries,
        }
    }
}

#[async_trait]
impl CredentialProvider for InlineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "inline"
    }

    async fn fetch(&self, identifier: &str) -> Result<Credential, CredentialError> {
        match self.entries.get(identifier) {
            Some(secret) => Ok(Credential::new(
                &self.name,
                identifier,
                secret.clone(),
                metadata_for("inline"),
            )),
            None => Err(CredentialError::NotFound {
                provider: self.name.clone(),
                identifier: identifier.to_string(),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════

/// Resolves `(provider, identifier)` pairs against registered providers.
#[derive(Default, Clone)]
pub struct CredentialFactory {
    providers: BTreeMap<String, Arc<dyn CredentialProvider>>,
}

impl CredentialFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one provider per `[credentials.<name>]` entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut factory = Self::new();
        for (name, provider) in &config.credentials {
            let provider: Arc<dyn CredentialProvider> = match provider {
                CredentialProviderConfig::Env { prefix } => Arc::new(EnvProvider::new(name, prefix)),
                CredentialProviderConfig::File { path } => {
                    Arc::new(FileProvider::new(name, path.clone()))
                }
                CredentialProviderConfig::Inline { entries } => {
                    let mut converted = BTreeMap::new();
                    for (id, table) in entries {
                        converted.insert(id.clone(), table_to_json(table, name)?);
                    }
                    Arc::new(InlineProvider::new(name, converted))
                }
            };
            factory.register(provider);
        }
        Ok(factory)
    }

    pub fn register(&mut self, provider: Arc<dyn CredentialProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub async fn resolve(
        &self,
        provider: &str,
        identifier: &str,
    ) -> Result<Credential, CredentialError> {
        let p = self
            .providers
            .get(provider)
            .ok_or_else(|| CredentialError::UnknownProvider(provider.to_string()))?;
        debug!(provider, identifier, kind = p.kind(), "resolving credential");
        p.fetch(identifier).await
    }

    /// Resolve through the resilience layer: an unavailable store is
    /// retried, a missing credential is not.
    pub async fn resolve_ref(
        &self,
        cref: &CredentialRef,
        resilience: &Resilience,
    ) -> Result<Credential> {
        resilience
            .call("resolve credential", || async {
                self.resolve(&cref.provider, &cref.id)
                    .await
                    .map_err(Error::from)
            })
            .await
    }
}
