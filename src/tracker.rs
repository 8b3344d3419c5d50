//! Processing state tracker: the persisted per-document state machine.
//!
//! Every pipeline component consults and updates this tracker rather than
//! inferring state from filesystem presence. On restart, any record not in a
//! terminal state is resumed from its current state rather than restarted
//! from scratch.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// Pipeline states. `Delivered` and `PermanentlyFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Discovered,
    Classifying,
    Classified,
    Routing,
    Routed,
    Enriching,
    Enriched,
    Delivering,
    Delivered,
    EnrichFailed,
    NeedsReview,
    PermanentlyFailed,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Discovered => "discovered",
            ProcState::Classifying => "classifying",
            ProcState::Classified => "classified",
            ProcState::Routing => "routing",
            ProcState::Routed => "routed",
            ProcState::Enriching => "enriching",
            ProcState::Enriched => "enriched",
            ProcState::Delivering => "delivering",
            ProcState::Delivered => "delivered",
            ProcState::EnrichFailed => "enrich_failed",
            ProcState::NeedsReview => "needs_review",
            ProcState::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn parse(s: &str) -> Option<ProcState> {
        match s {
            "discovered" => Some(ProcState::Discovered),
            "classifying" => Some(ProcState::Classifying),
            "classified" => Some(ProcState::Classified),
            "routing" => Some(ProcState::Routing),
            "routed" => Some(ProcState::Routed),
            "enriching" => Some(ProcState::Enriching),
            "enriched" => Some(ProcState::Enriched),
            "delivering" => Some(ProcState::Delivering),
            "delivered" => Some(ProcState::Delivered),
            "enrich_failed" => Some(ProcState::EnrichFailed),
            "needs_review" => Some(ProcState::NeedsReview),
            "permanently_failed" => Some(ProcState::PermanentlyFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcState::Delivered | ProcState::PermanentlyFailed)
    }

    /// Forward-only transition table, with the explicit retry and failure
    /// loops. `NeedsReview` and `PermanentlyFailed` are reachable from any
    /// non-terminal state (a step that exhausted its retry budget).
    pub fn can_transition(&self, to: ProcState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, ProcState::NeedsReview | ProcState::PermanentlyFailed) {
            return true;
        }
        matches!(
            (self, to),
            (ProcState::Discovered, ProcState::Classifying)
                | (ProcState::Classifying, ProcState::Classified)
                | (ProcState::Classified, ProcState::Routing)
                | (ProcState::Routing, ProcState::Routed)
                | (ProcState::Routed, ProcState::Enriching)
                | (ProcState::Enriching, ProcState::Enriched)
                | (ProcState::Enriching, ProcState::EnrichFailed)
                | (ProcState::EnrichFailed, ProcState::Enriching)
                | (ProcState::Enriched, ProcState::Delivering)
                | (ProcState::Delivering, ProcState::Delivered)
                // User-initiated retry re-enters the pipeline at `classified`
                // with the stored classification intact.
                | (ProcState::NeedsReview, ProcState::Classified)
        )
    }
}

/// A retryable step, for per-step retry accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Classify,
    Enrich,
    Deliver,
}

impl RetryStep {
    fn column(&self) -> &'static str {
        match self {
            RetryStep::Classify => "classify_retries",
            RetryStep::Enrich => "enrich_retries",
            RetryStep::Deliver => "deliver_retries",
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid transition {from} -> {to} for record {record_id}")]
    InvalidTransition {
        record_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("processing record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Persisted state machine instance for one document.
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    pub id: String,
    pub document_id: String,
    pub content_hash: String,
    pub state: ProcState,
    pub classify_retries: u32,
    pub enrich_retries: u32,
    pub deliver_retries: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn record_from_row(row: &SqliteRow) -> ProcessingRecord {
    let state: String = row.get("state");
    ProcessingRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        content_hash: row.get("content_hash"),
        // Unknown stored state is a corrupted row; park it for review rather
        // than guessing a step.
        state: ProcState::parse(&state).unwrap_or(ProcState::NeedsReview),
        classify_retries: row.get::<i64, _>("classify_retries") as u32,
        enrich_retries: row.get::<i64, _>("enrich_retries") as u32,
        deliver_retries: row.get::<i64, _>("deliver_retries") as u32,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Tracker over the `processing_records` and `processing_transitions` tables.
#[derive(Clone)]
pub struct Tracker {
    pool: SqlitePool,
}

impl Tracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, record_id: &str) -> Result<ProcessingRecord, TrackerError> {
        let row = sqlx::query("SELECT * FROM processing_records WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(record_from_row)
            .ok_or_else(|| TrackerError::NotFound(record_id.to_string()))
    }

    pub async fn get_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<ProcessingRecord>, TrackerError> {
        let row = sqlx::query("SELECT * FROM processing_records WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    pub async fn get_by_document(
        &self,
        document_id: &str,
    ) -> Result<Option<ProcessingRecord>, TrackerError> {
        let row = sqlx::query("SELECT * FROM processing_records WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    /// Create a record in `discovered` for a newly stable document.
    pub async fn create_discovered(
        &self,
        record_id: &str,
        document_id: &str,
        content_hash: &str,
    ) -> Result<ProcessingRecord, TrackerError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO processing_records
                (id, document_id, content_hash, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record_id)
        .bind(document_id)
        .bind(content_hash)
        .bind(ProcState::Discovered.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get(record_id).await
    }

    /// Transition a record, enforcing the state machine. Appends the
    /// transition to the audit log in the same transaction.
    pub async fn transition(
        &self,
        record_id: &str,
        to: ProcState,
        note: Option<&str>,
    ) -> Result<ProcessingRecord, TrackerError> {
        let record = self.get(record_id).await?;
        if !record.state.can_transition(to) {
            return Err(TrackerError::InvalidTransition {
                record_id: record_id.to_string(),
                from: record.state.as_str(),
                to: to.as_str(),
            });
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE processing_records SET state = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to.as_str())
        .bind(note)
        .bind(now)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO processing_transitions (record_id, from_state, to_state, at, note) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(record.state.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(note)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            record = record_id,
            from = record.state.as_str(),
            to = to.as_str(),
            "state transition"
        );
        self.get(record_id).await
    }

    /// Increment a step's retry counter and return the new count.
    pub async fn bump_retry(
        &self,
        record_id: &str,
        step: RetryStep,
    ) -> Result<u32, TrackerError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "UPDATE processing_records SET {col} = {col} + 1, updated_at = ? WHERE id = ?",
            col = step.column()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        let record = self.get(record_id).await?;
        Ok(match step {
            RetryStep::Classify => record.classify_retries,
            RetryStep::Enrich => record.enrich_retries,
            RetryStep::Deliver => record.deliver_retries,
        })
    }

    /// Reset a step's retry counter (used by the user-initiated retry).
    pub async fn reset_retries(
        &self,
        record_id: &str,
        step: RetryStep,
    ) -> Result<(), TrackerError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "UPDATE processing_records SET {col} = 0, updated_at = ? WHERE id = ?",
            col = step.column()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All records not in a terminal state, oldest first. Drives resume on
    /// startup.
    pub async fn non_terminal(&self) -> Result<Vec<ProcessingRecord>, TrackerError> {
        let rows = sqlx::query(
            "SELECT * FROM processing_records WHERE state NOT IN ('delivered', 'permanently_failed') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn count_by_state(&self) -> Result<Vec<(String, i64)>, TrackerError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM processing_records GROUP BY state ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("state"), r.get::<i64, _>("n")))
            .collect())
    }
}
