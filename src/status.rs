//! Pipeline status overview.
//!
//! Gives a quick summary of what the pipeline has seen: record counts per
//! state, documents waiting for review with their failure reasons, and action
//! totals. Used by `desk status` to confirm intake and delivery are working.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::tracker::Tracker;

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let tracker = Tracker::new(pool.clone());

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;
    let total_actions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actions WHERE archived = 0")
        .fetch_one(&pool)
        .await?;
    let pending_actions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM actions WHERE archived = 0 AND status = 'pending'")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(config.db_path())
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Deskflow — Pipeline Status");
    println!("==========================");
    println!();
    println!("  Workspace:   {}", config.workspace.root.display());
    println!("  Database:    {} ({})", config.db_path().display(), format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Actions:     {} ({} pending)", total_actions, pending_actions);

    let by_state = tracker.count_by_state().await?;
    if !by_state.is_empty() {
        println!();
        println!("  By state:");
        println!("  {:<20} {:>6}", "STATE", "COUNT");
        println!("  {}", "-".repeat(28));
        for (state, count) in &by_state {
            println!("  {:<20} {:>6}", state, count);
        }
    }

    // Documents stuck in review stay visible with their failure reason —
    // nothing is ever silently discarded.
    let review_rows = sqlx::query(
        r#"
        SELECT d.file_name, d.staging_path, r.last_error
        FROM processing_records r
        JOIN documents d ON d.id = r.document_id
        WHERE r.state = 'needs_review'
        ORDER BY r.updated_at
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !review_rows.is_empty() {
        println!();
        println!("  Needs review:");
        for row in &review_rows {
            let file: String = row.get("file_name");
            let staging: String = row.get("staging_path");
            let reason: Option<String> = row.get("last_error");
            println!(
                "    {} ({})\n      {}",
                file,
                staging,
                reason.as_deref().unwrap_or("no reason recorded")
            );
        }
        println!();
        println!("  Requeue with: desk retry <file-or-id>");
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
