//! Action synchronization: the dual-store consistency mechanism.
//!
//! Actions live in two representations — authoritative rows in the working
//! database and a human-editable checklist block rendered into the delivered
//! document. First delivery writes both atomically (the rename into the
//! canonical destination is the commit point). Reconciliation merges
//! subsequent edits from either side without data loss: the later
//! last-modified timestamp wins and the losing value is logged, never
//! silently dropped.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::enrich::{self, EnrichmentPayload};
use crate::models::{Action, ActionStatus, Document, SyncOrigin};

const BLOCK_BEGIN: &str = "<!-- deskflow:actions -->";
const BLOCK_END: &str = "<!-- /deskflow:actions -->";

/// Deterministic action identifier. Delivery is idempotent because re-running
/// it derives the same ids and the insert is a no-op on conflict.
pub fn action_id(document_id: &str, anchor: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(anchor.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// One parsed checklist line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistItem {
    pub id: Option<String>,
    pub title: String,
    pub status: ActionStatus,
}

/// Render the checklist block for a set of actions.
pub fn render_checklist(actions: &[Action]) -> String {
    let mut out = String::new();
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    for action in actions {
        let mark = match action.status {
            ActionStatus::Pending => ' ',
            ActionStatus::Completed | ActionStatus::Cancelled => 'x',
        };
        out.push_str(&format!("- [{}] {} (id: {})", mark, action.title, action.id));
        if let Some(owner) = &action.owner {
            out.push_str(&format!(" (owner: {})", owner));
        }
        if let Some(due) = &action.due_date {
            out.push_str(&format!(" (due: {})", due));
        }
        if action.status == ActionStatus::Cancelled {
            out.push_str(" (cancelled)");
        }
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out
}

/// Parse the checklist block out of a delivered document.
///
/// Returns `None` when the block is missing or structurally corrupted — the
/// caller must treat that as "no information from the document side", never
/// as a set of deletions.
pub fn parse_checklist(content: &str) -> Option<Vec<ChecklistItem>> {
    let begin = content.find(BLOCK_BEGIN)?;
    let after_begin = begin + BLOCK_BEGIN.len();
    let end = content[after_begin..].find(BLOCK_END)? + after_begin;

    let mut items = Vec::new();
    for line in content[after_begin..end].lines() {
        let trimmed = line.trim();
        let rest = match trimmed
            .strip_prefix("- [ ]")
            .map(|r| (r, false))
            .or_else(|| trimmed.strip_prefix("- [x]").map(|r| (r, true)))
            .or_else(|| trimmed.strip_prefix("- [X]").map(|r| (r, true)))
        {
            Some(parsed) => parsed,
            None => continue,
        };
        let (rest, checked) = rest;

        let mut title = rest.trim().to_string();
        let id = take_tag(&mut title, "id");
        let _owner = take_tag(&mut title, "owner");
        let _due = take_tag(&mut title, "due");
        let cancelled = take_flag(&mut title, "(cancelled)");

        let status = if cancelled {
            ActionStatus::Cancelled
        } else if checked {
            ActionStatus::Completed
        } else {
            ActionStatus::Pending
        };

        items.push(ChecklistItem {
            id,
            title: title.trim().to_string(),
            status,
        });
    }
    Some(items)
}

/// Remove a `(key: value)` tag from the line, returning the value.
fn take_tag(line: &mut String, key: &str) -> Option<String> {
    let open = format!("({}: ", key);
    let start = line.find(&open)?;
    let close = line[start..].find(')')? + start;
    let value = line[start + open.len()..close].trim().to_string();
    line.replace_range(start..=close, "");
    Some(value)
}

fn take_flag(line: &mut String, flag: &str) -> bool {
    match line.find(flag) {
        Some(start) => {
            line.replace_range(start..start + flag.len(), "");
            true
        }
        None => false,
    }
}

/// Build action rows from an enrichment payload for a routed document.
pub fn actions_from_payload(doc: &Document, destination: &str, payload: &EnrichmentPayload) -> Vec<Action> {
    let now = chrono::Utc::now().timestamp();
    payload
        .actions
        .iter()
        .enumerate()
        .map(|(i, pa)| {
            let anchor = format!("action-{}", i + 1);
            Action {
                id: action_id(&doc.id, &anchor),
                document_id: doc.id.clone(),
                anchor: anchor.clone(),
                title: pa.title.trim().to_string(),
                status: ActionStatus::Pending,
                priority: "normal".to_string(),
                due_date: pa.due_date.clone(),
                owner: pa.owner.clone(),
                source_ref: format!("{}#{}", destination, anchor),
                origin: SyncOrigin::Database,
                synced_status: ActionStatus::Pending,
                created_at: now,
                updated_at: now,
                archived: false,
            }
        })
        .collect()
}

/// Fetch all live actions for a document, anchor order.
pub async fn actions_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<Action>> {
    let rows = sqlx::query(
        "SELECT * FROM actions WHERE document_id = ? AND archived = 0 ORDER BY LENGTH(anchor), anchor",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(db::action_from_row).collect())
}

async fn insert_actions(pool: &SqlitePool, actions: &[Action]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for action in actions {
        // DO NOTHING on conflict: a re-run after a crash must not clobber
        // edits made since the rows were first written.
        sqlx::query(
            r#"
            INSERT INTO actions (id, document_id, anchor, title, status, priority, due_date,
                                 owner, source_ref, origin, synced_status,
                                 created_at, updated_at, archived)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&action.id)
        .bind(&action.document_id)
        .bind(&action.anchor)
        .bind(&action.title)
        .bind(action.status.as_str())
        .bind(&action.priority)
        .bind(&action.due_date)
        .bind(&action.owner)
        .bind(&action.source_ref)
        .bind(action.origin.as_str())
        .bind(action.synced_status.as_str())
        .bind(action.created_at)
        .bind(action.updated_at)
        .bind(action.archived as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Summary of one delivery.
#[derive(Debug)]
pub struct Delivery {
    pub destination: String,
    pub actions: usize,
}

/// Deliver an enriched document: write action rows, render the annotation
/// into the staged file, then move it to the canonical destination. The move
/// is the commit point — a crash before it leaves no partially-delivered
/// action visible in the filing structure, and a re-run completes cleanly.
pub async fn deliver(config: &Config, pool: &SqlitePool, doc: &Document) -> Result<Delivery> {
    let destination = doc
        .destination
        .clone()
        .with_context(|| format!("document {} has no destination", doc.id))?;
    let payload_path = doc
        .payload_path
        .clone()
        .with_context(|| format!("document {} has no enrichment payload", doc.id))?;
    let payload = enrich::load_payload(Path::new(&payload_path))
        .with_context(|| format!("failed to load payload {}", payload_path))?;

    let actions = actions_from_payload(doc, &destination, &payload);
    insert_actions(pool, &actions).await?;

    let staging = Path::new(&doc.staging_path);
    let dest_abs = config.workspace.root.join(&destination);

    if !staging.exists() {
        if dest_abs.exists() {
            // Crash after the move, before the final state transition.
            tracing::info!(destination = %destination, "delivery already committed; finalizing");
            return Ok(Delivery {
                destination,
                actions: actions.len(),
            });
        }
        bail!(
            "document missing from both staging ({}) and destination ({})",
            staging.display(),
            dest_abs.display()
        );
    }

    // Annotate in staging, then rename. Re-annotation is skipped if a crash
    // already wrote the block.
    let content = std::fs::read_to_string(staging)?;
    if !content.contains(BLOCK_BEGIN) {
        let stored = actions_for_document(pool, &doc.id).await?;
        let annotated = format!("{}{}", content, render_annotation(&payload, &stored));
        std::fs::write(staging, annotated)?;
    }

    if dest_abs.exists() {
        bail!(
            "destination already exists, refusing to overwrite: {}",
            dest_abs.display()
        );
    }

    std::fs::rename(staging, &dest_abs).with_context(|| {
        format!(
            "failed to move {} -> {}",
            staging.display(),
            dest_abs.display()
        )
    })?;

    // Carry the sidecar along so the holding area ends up empty.
    let sidecar = crate::classifier::sidecar_path(staging);
    if sidecar.exists() {
        let sidecar_dest = crate::classifier::sidecar_path(&dest_abs);
        let _ = std::fs::rename(&sidecar, &sidecar_dest);
    }

    Ok(Delivery {
        destination,
        actions: actions.len(),
    })
}

/// Enrichment annotation appended to the document at delivery.
fn render_annotation(payload: &EnrichmentPayload, actions: &[Action]) -> String {
    let mut out = String::from("\n\n---\n\n## Summary\n\n");
    out.push_str(payload.summary.trim());
    out.push('\n');

    if !payload.decisions.is_empty() {
        out.push_str("\n## Decisions\n\n");
        for decision in &payload.decisions {
            out.push_str(&format!("- {}\n", decision));
        }
    }

    out.push_str("\n## Actions\n\n");
    out.push_str(&render_checklist(actions));
    out.push('\n');

    if !payload.tags.is_empty() {
        let tags: Vec<String> = payload.tags.iter().map(|t| format!("#{}", t)).collect();
        out.push_str(&format!("\nTags: {}\n", tags.join(" ")));
    }
    out
}

/// Counters for one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub documents: usize,
    pub db_to_document: usize,
    pub document_to_db: usize,
    pub conflicts: usize,
    pub created: usize,
    pub skipped_no_block: usize,
}

/// Reconcile every delivered document's checklist with the working database.
pub async fn reconcile(config: &Config, pool: &SqlitePool) -> Result<ReconcileReport> {
    let rows = sqlx::query(
        r#"
        SELECT d.* FROM documents d
        JOIN processing_records r ON r.document_id = d.id
        WHERE r.state = 'delivered' AND d.destination IS NOT NULL
        ORDER BY d.created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut report = ReconcileReport::default();
    for row in &rows {
        let doc = db::document_from_row(row);
        reconcile_document(config, pool, &doc, &mut report).await?;
    }
    Ok(report)
}

async fn reconcile_document(
    config: &Config,
    pool: &SqlitePool,
    doc: &Document,
    report: &mut ReconcileReport,
) -> Result<()> {
    let destination = match &doc.destination {
        Some(d) => d.clone(),
        None => return Ok(()),
    };
    let path = config.workspace.root.join(&destination);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(document = %destination, error = %e, "delivered file unreadable; skipping");
            return Ok(());
        }
    };
    report.documents += 1;

    let items = match parse_checklist(&content) {
        Some(items) => items,
        None => {
            // Deleted or corrupted block: no information from this side.
            tracing::warn!(
                document = %destination,
                "checklist block missing or corrupted; keeping database rows untouched"
            );
            report.skipped_no_block += 1;
            return Ok(());
        }
    };

    let doc_mtime = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut actions = actions_for_document(pool, &doc.id).await?;
    let now = chrono::Utc::now().timestamp();
    let mut rewrite = false;

    let mut tx = pool.begin().await?;
    for action in actions.iter_mut() {
        let item = items.iter().find(|i| i.id.as_deref() == Some(&action.id));

        let db_changed = action.status != action.synced_status;
        let (doc_changed, doc_status) = match item {
            Some(item) => (item.status != action.synced_status, item.status),
            // A vanished line is "no information", not a deletion; the
            // rewrite below restores it.
            None => {
                rewrite = true;
                (false, action.synced_status)
            }
        };

        let winner = match (db_changed, doc_changed) {
            (false, false) => continue,
            (true, false) => {
                rewrite = true;
                SyncOrigin::Database
            }
            (false, true) => SyncOrigin::Document,
            (true, true) => {
                // Both sides moved since the merge base: later timestamp
                // wins; an exact tie goes to the database, the
                // authoritative index. Both competing values are logged.
                let winner = if doc_mtime > action.updated_at {
                    SyncOrigin::Document
                } else {
                    SyncOrigin::Database
                };
                let (win_val, lose_val) = match winner {
                    SyncOrigin::Document => (doc_status, action.status),
                    SyncOrigin::Database => (action.status, doc_status),
                };
                tracing::warn!(
                    action = %action.id,
                    title = %action.title,
                    winner = winner.as_str(),
                    winning_status = win_val.as_str(),
                    losing_status = lose_val.as_str(),
                    "reconciliation conflict; later edit wins"
                );
                report.conflicts += 1;
                if winner == SyncOrigin::Database {
                    rewrite = true;
                }
                winner
            }
        };

        let final_status = match winner {
            SyncOrigin::Document => doc_status,
            SyncOrigin::Database => action.status,
        };

        sqlx::query(
            "UPDATE actions SET status = ?, synced_status = ?, origin = ?, updated_at = ? WHERE id = ?",
        )
        .bind(final_status.as_str())
        .bind(final_status.as_str())
        .bind(winner.as_str())
        .bind(now)
        .bind(&action.id)
        .execute(&mut *tx)
        .await?;

        match winner {
            SyncOrigin::Document => report.document_to_db += 1,
            SyncOrigin::Database => report.db_to_document += 1,
        }
        action.status = final_status;
        action.synced_status = final_status;
    }

    // Checklist lines the user added by hand become new action rows.
    let mut next_anchor = actions.len() + 1;
    for item in &items {
        let known = item
            .id
            .as_deref()
            .map(|id| actions.iter().any(|a| a.id == id))
            .unwrap_or(false);
        if known || item.title.is_empty() {
            continue;
        }
        let anchor = format!("action-{}", next_anchor);
        next_anchor += 1;
        let action = Action {
            id: action_id(&doc.id, &anchor),
            document_id: doc.id.clone(),
            anchor: anchor.clone(),
            title: item.title.clone(),
            status: item.status,
            priority: "normal".to_string(),
            due_date: None,
            owner: None,
            source_ref: format!("{}#{}", destination, anchor),
            origin: SyncOrigin::Document,
            synced_status: item.status,
            created_at: now,
            updated_at: now,
            archived: false,
        };
        sqlx::query(
            r#"
            INSERT INTO actions (id, document_id, anchor, title, status, priority, due_date,
                                 owner, source_ref, origin, synced_status,
                                 created_at, updated_at, archived)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&action.id)
        .bind(&action.document_id)
        .bind(&action.anchor)
        .bind(&action.title)
        .bind(action.status.as_str())
        .bind(&action.priority)
        .bind(&action.due_date)
        .bind(&action.owner)
        .bind(&action.source_ref)
        .bind(action.origin.as_str())
        .bind(action.synced_status.as_str())
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&mut *tx)
        .await?;
        report.created += 1;
        rewrite = true;
    }
    tx.commit().await?;

    if rewrite {
        let current = actions_for_document(pool, &doc.id).await?;
        let block = render_checklist(&current);
        let updated = replace_block(&content, &block)
            .with_context(|| format!("checklist block vanished mid-reconcile in {}", destination))?;
        std::fs::write(&path, updated)?;
    }

    Ok(())
}

/// `desk reconcile`: run one reconciliation pass and print a summary.
pub async fn run_reconcile(config: &Config, pool: &SqlitePool) -> Result<()> {
    let report = reconcile(config, pool).await?;

    println!("reconcile");
    println!("  documents examined: {}", report.documents);
    println!("  database -> document: {}", report.db_to_document);
    println!("  document -> database: {}", report.document_to_db);
    println!("  conflicts resolved: {}", report.conflicts);
    println!("  actions created from checklists: {}", report.created);
    if report.skipped_no_block > 0 {
        println!(
            "  skipped (no checklist block): {}",
            report.skipped_no_block
        );
    }
    println!("ok");
    Ok(())
}

/// Replace the checklist block in a document, preserving everything else.
fn replace_block(content: &str, block: &str) -> Option<String> {
    let begin = content.find(BLOCK_BEGIN)?;
    let end = content[begin..].find(BLOCK_END)? + begin + BLOCK_END.len();
    let mut out = String::with_capacity(content.len() + block.len());
    out.push_str(&content[..begin]);
    out.push_str(block);
    out.push_str(&content[end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, title: &str, status: ActionStatus) -> Action {
        Action {
            id: id.to_string(),
            document_id: "doc".to_string(),
            anchor: "action-1".to_string(),
            title: title.to_string(),
            status,
            priority: "normal".to_string(),
            due_date: Some("2026-02-10".to_string()),
            owner: Some("sarah".to_string()),
            source_ref: "Accounts/Acme/meetings/x.md#action-1".to_string(),
            origin: SyncOrigin::Database,
            synced_status: status,
            created_at: 0,
            updated_at: 0,
            archived: false,
        }
    }

    #[test]
    fn checklist_round_trip() {
        let actions = vec![
            action("aaa111", "Send follow-up deck", ActionStatus::Pending),
            action("bbb222", "Review contract", ActionStatus::Completed),
            action("ccc333", "Old idea", ActionStatus::Cancelled),
        ];
        let block = render_checklist(&actions);
        let items = parse_checklist(&block).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id.as_deref(), Some("aaa111"));
        assert_eq!(items[0].title, "Send follow-up deck");
        assert_eq!(items[0].status, ActionStatus::Pending);
        assert_eq!(items[1].status, ActionStatus::Completed);
        assert_eq!(items[2].status, ActionStatus::Cancelled);
    }

    #[test]
    fn missing_block_is_no_information() {
        assert!(parse_checklist("# Doc\n\nno block here\n").is_none());
        // Begin without end is corrupted, not an empty set.
        let corrupted = format!("# Doc\n{}\n- [ ] a (id: x)\n", BLOCK_BEGIN);
        assert!(parse_checklist(&corrupted).is_none());
    }

    #[test]
    fn hand_written_lines_parse_without_ids() {
        let content = format!(
            "{}\n- [ ] Call the vendor back\n- [x] Ship it (id: abc123)\n{}",
            BLOCK_BEGIN, BLOCK_END
        );
        let items = parse_checklist(&content).unwrap();
        assert_eq!(items[0].id, None);
        assert_eq!(items[0].title, "Call the vendor back");
        assert_eq!(items[1].id.as_deref(), Some("abc123"));
    }

    #[test]
    fn action_ids_are_deterministic() {
        assert_eq!(action_id("doc-1", "action-1"), action_id("doc-1", "action-1"));
        assert_ne!(action_id("doc-1", "action-1"), action_id("doc-1", "action-2"));
        assert_eq!(action_id("doc-1", "action-1").len(), 12);
    }

    #[test]
    fn replace_block_preserves_surrounding_text() {
        let content = format!("intro\n{}\n- [ ] a (id: x)\n{}\noutro\n", BLOCK_BEGIN, BLOCK_END);
        let updated = replace_block(&content, &format!("{}\n{}", BLOCK_BEGIN, BLOCK_END)).unwrap();
        assert!(updated.starts_with("intro\n"));
        assert!(updated.ends_with("\noutro\n"));
        assert!(!updated.contains("- [ ] a"));
    }
}
