//! Pipeline progress reporting.
//!
//! Reports observable progress during `desk process` and `desk watch` so
//! users see what was picked up, which step each document is on, and where it
//! landed. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

/// A single progress event for the pipeline.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// A stable file entered the pipeline.
    Ready { file: String },
    /// A document moved to a new processing step.
    Stage { file: String, stage: &'static str },
    /// A document reached its canonical destination.
    Delivered {
        file: String,
        destination: String,
        actions: usize,
    },
    /// A document was parked for human review.
    Parked { file: String, reason: String },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Human-friendly progress: "process  2026-02-03-acme-call.md  enriching".
pub struct StderrReporter;

impl PipelineReporter for StderrReporter {
    fn report(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Ready { file } => format!("process {}  ready\n", file),
            PipelineEvent::Stage { file, stage } => format!("process {}  {}\n", file, stage),
            PipelineEvent::Delivered {
                file,
                destination,
                actions,
            } => format!(
                "process {}  delivered -> {} ({} action{})\n",
                file,
                destination,
                actions,
                if *actions == 1 { "" } else { "s" }
            ),
            PipelineEvent::Parked { file, reason } => {
                format!("process {}  needs review: {}\n", file, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonReporter;

impl PipelineReporter for JsonReporter {
    fn report(&self, event: PipelineEvent) {
        let obj = match &event {
            PipelineEvent::Ready { file } => serde_json::json!({
                "event": "ready",
                "file": file
            }),
            PipelineEvent::Stage { file, stage } => serde_json::json!({
                "event": "stage",
                "file": file,
                "stage": stage
            }),
            PipelineEvent::Delivered {
                file,
                destination,
                actions,
            } => serde_json::json!({
                "event": "delivered",
                "file": file,
                "destination": destination,
                "actions": actions
            }),
            PipelineEvent::Parked { file, reason } => serde_json::json!({
                "event": "parked",
                "file": file,
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoReporter;

impl PipelineReporter for NoReporter {
    fn report(&self, _event: PipelineEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportMode {
    Off,
    Human,
    Json,
}

impl ReportMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ReportMode::Human
        } else {
            ReportMode::Off
        }
    }

    pub fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some("off") => ReportMode::Off,
            Some("json") => ReportMode::Json,
            Some("human") => ReportMode::Human,
            _ => Self::default_for_tty(),
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn PipelineReporter> {
        match self {
            ReportMode::Off => std::sync::Arc::new(NoReporter),
            ReportMode::Human => std::sync::Arc::new(StderrReporter),
            ReportMode::Json => std::sync::Arc::new(JsonReporter),
        }
    }
}
