//! Run progress reporting.
//!
//! `ih run` reports progress after every extracted batch so users can see
//! how far a long run has got. Progress goes to **stderr**; stdout carries
//! only the final summary and stays parseable.

use std::io::Write;

use clap::ValueEnum;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Waiting for the next batch from the source.
    Extracting { job: String, batch: u64 },
    /// A batch went through transform and ingest. Counts are cumulative.
    Batch {
        job: String,
        batch: u64,
        extracted: u64,
        ingested: u64,
        failed: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress: "run inbox  batch 3  extracted 1,234  ingested 1,200  failed 2".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Extracting { job, batch } => {
                format!("run {}  batch {}  extracting...\n", job, batch)
            }
            RunProgressEvent::Batch {
                job,
                batch,
                extracted,
                ingested,
                failed,
            } => format!(
                "run {}  batch {}  extracted {}  ingested {}  failed {}\n",
                job,
                batch,
                format_number(*extracted),
                format_number(*ingested),
                format_number(*failed)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Extracting { job, batch } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "extracting",
                "batch": batch,
            }),
            RunProgressEvent::Batch {
                job,
                batch,
                extracted,
                ingested,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "batch",
                "batch": batch,
                "extracted": extracted,
                "ingested": ingested,
                "failed": failed,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
