//! `ih jobs`, `ih check`, and `ih credential`: inspect configured jobs
//! without running them.

use anyhow::Result;

use crate::config::{Config, ConnectorConfig, IngestMode, TransformConfig};
use crate::connector::ConnectorFactory;
use crate::credentials::CredentialFactory;
use crate::resilience::Resilience;

/// One row of `ih jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub name: String,
    pub source: String,
    pub transform: &'static str,
    pub sink: String,
    pub index: String,
    pub mode: &'static str,
}

pub fn job_rows(config: &Config) -> Vec<JobRow> {
    config
        .jobs
        .iter()
        .map(|(name, job)| JobRow {
            name: name.clone(),
            source: job.source.source_type.to_ascii_lowercase(),
            transform: match job.transform_config() {
                TransformConfig::Structured(_) => "structured",
                TransformConfig::Unstructured(_) => "unstructured",
            },
            sink: job.sink.connector.source_type.to_ascii_lowercase(),
            index: job.sink.index.clone(),
            mode: match job.sink.mode {
                IngestMode::Single => "single",
                IngestMode::Bulk => "bulk",
            },
        })
        .collect()
}

pub fn list_jobs(config: &Config) -> Result<()> {
    let rows = job_rows(config);
    if rows.is_empty() {
        println!("No jobs configured.");
        return Ok(());
    }
    println!(
        "{:<16} {:<10} {:<13} {:<14} {:<16} MODE",
        "JOB", "SOURCE", "TRANSFORM", "SINK", "INDEX"
    );
    for r in rows {
        println!(
            "{:<16} {:<10} {:<13} {:<14} {:<16} {}",
            r.name, r.source, r.transform, r.sink, r.index, r.mode
        );
    }
    Ok(())
}

/// Result of checking one connector.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub job: String,
    pub role: &'static str,
    pub target: String,
    pub error: Option<String>,
}

/// Resolve credentials, build every connector of the selected jobs (all
/// when `only` is `None`), and run its connectivity check.
pub async fn check_jobs(config: &Config, only: Option<&str>) -> Result<Vec<CheckResult>> {
    if let Some(name) = only {
        config.job(name)?;
    }
    let credentials = CredentialFactory::from_config(config)?;
    let factory = ConnectorFactory::with_builtins();
    let mut results = Vec::new();
    for (name, job) in &config.jobs {
        if only.is_some_and(|o| o != name.as_str()) {
            continue;
        }
        let resilience = job.resilience.build();
        for (role, connector) in [("source", &job.source), ("sink", &job.sink.connector)] {
            let (target, error) = check_one(&factory, &credentials, connector, &resilience).await;
            results.push(CheckResult {
                job: name.clone(),
                role,
                target,
                error,
            });
        }
    }
    Ok(results)
}

async fn check_one(
    factory: &ConnectorFactory,
    credentials: &CredentialFactory,
    config: &ConnectorConfig,
    resilience: &Resilience,
) -> (String, Option<String>) {
    let credential = match &config.credential {
        Some(cref) => match credentials.resolve_ref(cref, resilience).await {
            Ok(c) => Some(c),
            Err(e) => return (config.source_type.clone(), Some(e.report())),
        },
        None => None,
    };
    let connector = match factory.create(config, credential.as_ref()) {
        Ok(c) => c,
        Err(e) => return (config.source_type.clone(), Some(e.to_string())),
    };
    let target = connector.describe();
    let outcome = resilience.call("check", || connector.check()).await;
    connector.close().await;
    (target, outcome.err().map(|e| e.report()))
}

pub fn print_checks(results: &[CheckResult]) -> bool {
    println!("{:<16} {:<8} {:<48} STATUS", "JOB", "ROLE", "TARGET");
    let mut healthy = true;
    for r in results {
        let status = match &r.error {
            None => "OK".to_string(),
            Some(e) => {
                healthy = false;
                format!("FAIL ({})", e)
            }
        };
        println!("{:<16} {:<8} {:<48} {}", r.job, r.role, r.target, status);
    }
    healthy
}

/// Resolve one credential and print its field names, never its values.
pub async fn show_credential(config: &Config, provider: &str, identifier: &str) -> Result<()> {
    let credentials = CredentialFactory::from_config(config)?;
    let credential = credentials.resolve(provider, identifier).await?;
    println!("credential {}/{}", credential.provider, credential.identifier);
    for field in credential.field_names() {
        println!("  {} = ********", field);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
        [credentials.local]
        kind = "inline"
        [credentials.local.entries.search]
        login = "admin"
        password = "secret"

        [jobs.papers.source]
        source_type = "arxiv"
        base_url = "http://127.0.0.1:1/api/query"
        [jobs.papers.extract]
        search_category = "cs.AI"
        [jobs.papers.sink]
        index = "papers"
        mode = "single"
        [jobs.papers.sink.connector]
        source_type = "elasticsearch"
        host = "127.0.0.1"
        port = 1
        credential = { provider = "local", id = "search" }
    "#;

    #[test]
    fn test_job_rows() {
        let config = parse_config(CONFIG).unwrap();
        let rows = job_rows(&config);
        assert_eq!(
            rows,
            vec![JobRow {
                name: "papers".into(),
                source: "arxiv".into(),
                transform: "unstructured",
                sink: "elasticsearch".into(),
                index: "papers".into(),
                mode: "single",
            }]
        );
    }

    #[tokio::test]
    async fn test_check_reports_unreachable_connectors() {
        let mut config = parse_config(CONFIG).unwrap();
        if let Some(job) = config.jobs.get_mut("papers") {
            job.resilience.retry.max_attempts = 1;
        }
        let results = check_jobs(&config, Some("papers")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].role, "source");
        assert_eq!(results[1].role, "sink");
        assert!(results.iter().all(|r| r.error.is_some()));
        assert!(!print_checks(&results));
    }

    #[tokio::test]
    async fn test_check_unknown_job() {
        let config = parse_config(CONFIG).unwrap();
        assert!(check_jobs(&config, Some("mail")).await.is_err());
    }

    #[tokio::test]
    async fn test_show_credential_unknown_identifier() {
        let config = parse_config(CONFIG).unwrap();
        assert!(show_credential(&config, "local", "search").await.is_ok());
        assert!(show_credential(&config, "local", "gmail").await.is_err());
    }
}
