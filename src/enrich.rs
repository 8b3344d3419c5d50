//! Enrichment orchestration: directive construction, subprocess invocation
//! with a hard wall-clock timeout, strict payload validation, and bounded
//! retries with backoff.
//!
//! The enrichment agent is a black box. It receives the path to a directive
//! file as its final argument and must print a single JSON payload to stdout.
//! Missing required fields, malformed output, a non-zero exit status, or a
//! timeout are all enrichment failures — never partial success.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::classifier;
use crate::config::Config;
use crate::db;
use crate::models::Document;
use crate::tracker::{ProcState, RetryStep, Tracker};

/// Machine-readable request written for the enrichment agent. Context is
/// referenced by *path*, not embedded, which bounds directive size.
#[derive(Debug, Serialize)]
pub struct Directive {
    pub document: String,
    pub document_type: String,
    pub entity: Option<String>,
    pub requested_outputs: Vec<String>,
    pub context_files: Vec<String>,
}

/// Validated enrichment payload. All four fields are required; serde rejects
/// a payload missing any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    pub summary: String,
    pub decisions: Vec<String>,
    pub actions: Vec<PayloadAction>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadAction {
    pub title: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

/// Enrichment failure taxonomy. Timeout/crash/spawn are transient and
/// retried with backoff; validation failures are retried once, since
/// repeating an invocation that produced bad output rarely self-corrects.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("enrichment agent exited with {status}: {stderr}")]
    Crashed { status: i32, stderr: String },

    #[error("invalid enrichment payload: {0}")]
    Invalid(String),

    #[error("failed to invoke enrichment agent: {0}")]
    Spawn(#[from] std::io::Error),
}

impl EnrichError {
    pub fn is_validation(&self) -> bool {
        matches!(self, EnrichError::Invalid(_))
    }
}

/// Seam for the enrichment subprocess, so tests can substitute an in-process
/// agent.
#[async_trait]
pub trait EnrichmentAgent: Send + Sync {
    /// Run one enrichment and return the raw stdout payload.
    async fn enrich(&self, directive_path: &Path) -> Result<String, EnrichError>;
}

/// Production agent: spawns the configured command with the directive path
/// appended, enforcing the wall-clock timeout. The child is killed when the
/// invocation future is dropped (timeout or cancellation).
pub struct CommandAgent {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.enrich.command.clone(),
            timeout: Duration::from_secs(config.enrich.timeout_secs),
        }
    }
}

#[async_trait]
impl EnrichmentAgent for CommandAgent {
    async fn enrich(&self, directive_path: &Path) -> Result<String, EnrichError> {
        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(directive_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(EnrichError::Timeout {
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(result) => result?,
        };

        if !output.status.success() {
            return Err(EnrichError::Crashed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Strict schema validation of the agent's stdout.
pub fn validate_payload(raw: &str) -> Result<EnrichmentPayload, EnrichError> {
    let payload: EnrichmentPayload =
        serde_json::from_str(raw).map_err(|e| EnrichError::Invalid(e.to_string()))?;

    for (i, action) in payload.actions.iter().enumerate() {
        if action.title.trim().is_empty() {
            return Err(EnrichError::Invalid(format!(
                "actions[{}].title is empty",
                i
            )));
        }
        if let Some(due) = &action.due_date {
            if chrono::NaiveDate::parse_from_str(due, "%Y-%m-%d").is_err() {
                return Err(EnrichError::Invalid(format!(
                    "actions[{}].due_date '{}' is not YYYY-MM-DD",
                    i, due
                )));
            }
        }
    }

    Ok(payload)
}

/// Outcome of an orchestrated enrichment run for one document.
#[derive(Debug)]
pub enum EnrichOutcome {
    Enriched { payload_path: PathBuf },
    NeedsReview { reason: String },
    Cancelled,
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    pool: &'a SqlitePool,
    tracker: &'a Tracker,
    agent: &'a dyn EnrichmentAgent,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        pool: &'a SqlitePool,
        tracker: &'a Tracker,
        agent: &'a dyn EnrichmentAgent,
    ) -> Self {
        Self {
            config,
            pool,
            tracker,
            agent,
        }
    }

    /// Drive one document from `routed`/`enrich_failed` to `enriched`, or
    /// park it in `needs_review` once its retry budget is exhausted. The
    /// original document is never touched — only the directive and payload
    /// files are written.
    pub async fn run(
        &self,
        doc: &Document,
        record_id: &str,
        cancel: &CancellationToken,
    ) -> Result<EnrichOutcome> {
        let directive_path = self.write_directive(doc)?;
        let mut validation_retried = false;

        loop {
            self.tracker
                .transition(record_id, ProcState::Enriching, None)
                .await?;

            let attempt = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.tracker
                        .transition(record_id, ProcState::EnrichFailed, Some("cancelled"))
                        .await?;
                    tracing::info!(document = %doc.file_name, "enrichment cancelled; will retry on next run");
                    return Ok(EnrichOutcome::Cancelled);
                }

                result = self.agent.enrich(&directive_path) => result,
            };

            let err = match attempt {
                Ok(raw) => match validate_payload(&raw) {
                    Ok(payload) => {
                        let payload_path = self.persist_payload(doc, &payload)?;
                        db::update_payload_path(
                            self.pool,
                            &doc.id,
                            &payload_path.to_string_lossy(),
                        )
                        .await?;
                        self.tracker
                            .transition(record_id, ProcState::Enriched, None)
                            .await?;
                        return Ok(EnrichOutcome::Enriched { payload_path });
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            let reason = err.to_string();
            self.tracker
                .transition(record_id, ProcState::EnrichFailed, Some(&reason))
                .await?;
            let retries = self
                .tracker
                .bump_retry(record_id, RetryStep::Enrich)
                .await?;

            let exhausted = if err.is_validation() {
                // Bad output is not retried blindly: one retry, then review.
                let done = validation_retried;
                validation_retried = true;
                done
            } else {
                retries > self.config.enrich.max_retries
            };

            if exhausted {
                self.tracker
                    .transition(record_id, ProcState::NeedsReview, Some(&reason))
                    .await?;
                tracing::warn!(
                    document = %doc.file_name,
                    reason = %reason,
                    "enrichment retries exhausted; document parked for review"
                );
                return Ok(EnrichOutcome::NeedsReview { reason });
            }

            tracing::warn!(document = %doc.file_name, error = %reason, retries, "enrichment failed; retrying");

            if !err.is_validation() {
                let backoff = self.config.enrich.backoff_secs << (retries.min(4) - 1).min(4);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(EnrichOutcome::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                }
            }
        }
    }

    /// Write the directive file for a document. Idempotent: re-running an
    /// interrupted enrichment rewrites the same path.
    fn write_directive(&self, doc: &Document) -> Result<PathBuf> {
        let mut context_files = vec![doc.staging_path.clone()];
        let sidecar = classifier::sidecar_path(Path::new(&doc.staging_path));
        if sidecar.exists() {
            context_files.push(sidecar.to_string_lossy().to_string());
        }

        let directive = Directive {
            document: doc.staging_path.clone(),
            document_type: doc.doc_type.as_str().to_string(),
            entity: doc.entity.clone(),
            requested_outputs: vec![
                "summary".to_string(),
                "decisions".to_string(),
                "actions".to_string(),
                "tags".to_string(),
            ],
            context_files,
        };

        let dir = self.config.directives_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", doc.id));
        std::fs::write(&path, serde_json::to_string_pretty(&directive)?)?;
        Ok(path)
    }

    /// Persist the validated payload so a crash between `enriched` and
    /// `delivered` can complete delivery without re-invoking the agent.
    fn persist_payload(&self, doc: &Document, payload: &EnrichmentPayload) -> Result<PathBuf> {
        let dir = self.config.payloads_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", doc.id));
        std::fs::write(&path, serde_json::to_string_pretty(payload)?)?;
        Ok(path)
    }
}

/// Load a previously persisted payload (delivery after restart).
pub fn load_payload(path: &Path) -> Result<EnrichmentPayload, EnrichError> {
    let raw = std::fs::read_to_string(path).map_err(EnrichError::Spawn)?;
    validate_payload(&raw)
}
