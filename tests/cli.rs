use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ih_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ih");
    path
}

async fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let db_path = root.join("articles.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query(
        "CREATE TABLE articles (id INTEGER PRIMARY KEY, slug TEXT, title TEXT, body TEXT, updated_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();
    let rows = [
        (1, Some("rust-intro"), "Intro to Rust", "Ownership and borrowing.", "2024-01-05"),
        (2, Some("tokio"), "Async with Tokio", "Tasks and runtimes.", "2024-02-10"),
        (3, None, "Orphan", "This row has no slug.", "2024-03-15"),
        (4, Some("serde"), "Serde", "Serialization framework.", "2024-04-20"),
    ];
    for (id, slug, title, body, updated) in rows {
        sqlx::query("INSERT INTO articles VALUES (?, ?, ?, ?, ?)")
            .bind(id)
            .bind(slug)
            .bind(title)
            .bind(body)
            .bind(updated)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[credentials.local]
kind = "inline"

[credentials.local.entries.articles]
url = "sqlite://{db}"

[credentials.local.entries.search]
login = "admin"
password = "admin"

[jobs.articles]
concurrency = 2

[jobs.articles.source]
source_type = "rdbms"
credential = {{ provider = "local", id = "articles" }}

[jobs.articles.extract]
query = "SELECT id, slug, title, body, updated_at FROM articles ORDER BY id"
id_column = "id"
batch_size = 2
timestamp_column = "updated_at"

[jobs.articles.transform]
kind = "structured"
id_column = "slug"
text_columns = ["title", "body"]
separator = "\n\n"

[jobs.articles.transform.column_mapping]
title = "title"
updated_at = "updated"

[jobs.articles.sink]
index = "articles"
[jobs.articles.sink.connector]
source_type = "opensearch"
host = "127.0.0.1"
port = 1
credential = {{ provider = "local", id = "search" }}
"#,
        db = db_path.display()
    );

    let config_path = config_dir.join("ih.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_ih(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(ih_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run ih binary");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[tokio::test]
async fn test_jobs_lists_configured_jobs() {
    let (_tmp, config) = setup_test_env().await;
    let (stdout, stderr, success) = run_ih(&config, &["jobs"]);
    assert!(success, "jobs failed: {}", stderr);
    assert!(stdout.contains("JOB"));
    assert!(stdout.contains("articles"));
    assert!(stdout.contains("rdbms"));
    assert!(stdout.contains("structured"));
    assert!(stdout.contains("bulk"));
}

#[tokio::test]
async fn test_dry_run_reports_partial_success() {
    let (_tmp, config) = setup_test_env().await;
    let (stdout, stderr, success) = run_ih(&config, &["run", "articles", "--dry-run"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("run articles (dry-run)"));
    assert!(stdout.contains("extracted: 4 records"));
    assert!(stdout.contains("transformed: 3 records"));
    assert!(stdout.contains("skipped: 1"));
    assert!(stdout.contains("3: id column 'slug' is missing or null"));
    assert!(stdout.contains("ingested: 3"));
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[tokio::test]
async fn test_dry_run_with_date_window_and_limit() {
    let (_tmp, config) = setup_test_env().await;
    let (stdout, stderr, success) = run_ih(
        &config,
        &[
            "run",
            "articles",
            "--dry-run",
            "--since",
            "2024-02-01",
            "--until",
            "2024-04-30",
            "--limit",
            "1",
        ],
    );
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("extracted: 1 records"));
    assert!(stdout.contains("ingested: 1"));
}

#[tokio::test]
async fn test_since_after_until_is_rejected() {
    let (_tmp, config) = setup_test_env().await;
    let (_, stderr, success) = run_ih(
        &config,
        &["run", "articles", "--since", "2024-05-01", "--until", "2024-01-01"],
    );
    assert!(!success);
    assert!(stderr.contains("is after"));
}

#[tokio::test]
async fn test_unknown_job_fails() {
    let (_tmp, config) = setup_test_env().await;
    let (_, stderr, success) = run_ih(&config, &["run", "missing"]);
    assert!(!success);
    assert!(stderr.contains("unknown job 'missing'"));
}

#[tokio::test]
async fn test_credential_prints_field_names_only() {
    let (_tmp, config) = setup_test_env().await;
    let (stdout, stderr, success) = run_ih(&config, &["credential", "local", "search"]);
    assert!(success, "credential failed: {}", stderr);
    assert!(stdout.contains("login = ********"));
    assert!(!stdout.contains("admin"));

    let (_, stderr, success) = run_ih(&config, &["credential", "local", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[tokio::test]
async fn test_unknown_source_type_fails_at_load() {
    let (_tmp, config) = setup_test_env().await;
    let content = fs::read_to_string(&config).unwrap();
    fs::write(&config, content.replace("\"rdbms\"", "\"ftp\"")).unwrap();
    let (_, stderr, success) = run_ih(&config, &["jobs"]);
    assert!(!success);
    assert!(stderr.contains("unknown source type 'ftp'"));
}

#[tokio::test]
async fn test_check_reports_unreachable_sink() {
    let (_tmp, config) = setup_test_env().await;
    let (stdout, _, success) = run_ih(&config, &["check", "articles"]);
    assert!(!success);
    assert!(stdout.contains("source"));
    assert!(stdout.contains("FAIL"));
}
