//! Core data models used throughout Deskflow.
//!
//! These types represent the documents, classifications, and actions that flow
//! through the intake, enrichment, and filing pipeline.

/// Closed set of document types the pipeline understands.
///
/// The router and the enrichment orchestrator match exhaustively on this enum,
/// so adding a variant is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Transcript,
    Note,
    Report,
    Unknown,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Transcript => "transcript",
            DocType::Note => "note",
            DocType::Report => "report",
            DocType::Unknown => "unknown",
        }
    }

    /// Parse a stored type string. Unrecognized values collapse to `Unknown`
    /// so a hand-edited database row cannot wedge the pipeline.
    pub fn parse(s: &str) -> DocType {
        match s {
            "transcript" => DocType::Transcript,
            "note" => DocType::Note,
            "report" => DocType::Report,
            _ => DocType::Unknown,
        }
    }
}

/// Kind of entity a document can be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Account,
    Project,
    Person,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Project => "project",
            EntityKind::Person => "person",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "account" => Some(EntityKind::Account),
            "project" => Some(EntityKind::Project),
            "person" => Some(EntityKind::Person),
            _ => None,
        }
    }
}

/// Reference to a known entity (account, project, person) resolved during
/// classification. Carries the canonical name as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub name: String,
    pub kind: EntityKind,
}

/// Result of classifying a staged document.
#[derive(Debug, Clone)]
pub struct Classification {
    pub doc_type: DocType,
    pub confidence: f64,
    pub entity: Option<EntityRef>,
}

/// Normalized document record stored in SQLite.
///
/// The file itself lives on the filesystem (staging, then the canonical
/// destination); this row tracks identity and pipeline-assigned attributes.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub staging_path: String,
    pub content_hash: String,
    pub doc_type: DocType,
    pub confidence: f64,
    pub entity: Option<String>,
    pub entity_kind: Option<String>,
    /// Canonical destination, relative to the workspace root. Assigned once
    /// routed; the file is only moved there at delivery.
    pub destination: Option<String>,
    /// Path to the validated enrichment payload file, once enriched.
    pub payload_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived: bool,
}

impl Document {
    pub fn entity_ref(&self) -> Option<EntityRef> {
        let name = self.entity.clone()?;
        let kind = EntityKind::parse(self.entity_kind.as_deref()?)?;
        Some(EntityRef { name, kind })
    }
}

/// Status of an extracted commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Completed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Completed => "completed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> ActionStatus {
        match s {
            "completed" => ActionStatus::Completed,
            "cancelled" => ActionStatus::Cancelled,
            _ => ActionStatus::Pending,
        }
    }
}

/// Which store last modified an action. Reconciliation uses this to attribute
/// edits and to report conflict losers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOrigin {
    Database,
    Document,
}

impl SyncOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOrigin::Database => "database",
            SyncOrigin::Document => "document",
        }
    }

    pub fn parse(s: &str) -> SyncOrigin {
        match s {
            "document" => SyncOrigin::Document,
            _ => SyncOrigin::Database,
        }
    }
}

/// A commitment extracted from a document, stored in the working database.
///
/// Holds a non-owning back-reference to its source document (`document_id`
/// lookup); documents never hold references to actions.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub document_id: String,
    /// Stable anchor inside the source document, e.g. `action-1`.
    pub anchor: String,
    pub title: String,
    pub status: ActionStatus,
    pub priority: String,
    pub due_date: Option<String>,
    pub owner: Option<String>,
    /// `<canonical relative path>#<anchor>`, e.g.
    /// `Accounts/Acme/meetings/2026-02-03-acme-call.md#action-1`.
    pub source_ref: String,
    pub origin: SyncOrigin,
    /// Status as of the last reconciliation — the merge base for three-way
    /// resolution between the database row and the rendered checklist.
    pub synced_status: ActionStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_type_round_trip() {
        for t in [
            DocType::Transcript,
            DocType::Note,
            DocType::Report,
            DocType::Unknown,
        ] {
            assert_eq!(DocType::parse(t.as_str()), t);
        }
        assert_eq!(DocType::parse("garbage"), DocType::Unknown);
    }

    #[test]
    fn action_status_defaults_to_pending() {
        assert_eq!(ActionStatus::parse("pending"), ActionStatus::Pending);
        assert_eq!(ActionStatus::parse("completed"), ActionStatus::Completed);
        assert_eq!(ActionStatus::parse(""), ActionStatus::Pending);
    }
}
