//! Action commands: the database-side editing surface for commitments.
//!
//! Edits made here are picked up by the next reconciliation pass and written
//! back into the delivered documents' checklists.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::{Action, ActionStatus};

/// `desk actions list [--status s] [--source ref]`.
pub async fn run_list(
    config: &Config,
    status: Option<String>,
    source: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;

    let mut sql = String::from("SELECT * FROM actions WHERE archived = 0");
    if status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if source.is_some() {
        sql.push_str(" AND source_ref LIKE ?");
    }
    sql.push_str(" ORDER BY created_at");

    let mut query = sqlx::query(&sql);
    if let Some(status) = &status {
        query = query.bind(status.clone());
    }
    if let Some(source) = &source {
        query = query.bind(format!("{}%", source));
    }

    let rows = query.fetch_all(&pool).await?;
    let actions: Vec<Action> = rows.iter().map(db::action_from_row).collect();

    if actions.is_empty() {
        println!("no actions");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<14} {:<10} {:<44} {:<12} {}",
        "ID", "STATUS", "TITLE", "DUE", "SOURCE"
    );
    for action in &actions {
        println!(
            "{:<14} {:<10} {:<44} {:<12} {}",
            action.id,
            action.status.as_str(),
            truncate(&action.title, 42),
            action.due_date.as_deref().unwrap_or("-"),
            action.source_ref,
        );
    }
    println!();
    println!("{} action(s)", actions.len());

    pool.close().await;
    Ok(())
}

/// `desk actions complete <id>`.
pub async fn run_complete(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let action = set_status(&pool, id, ActionStatus::Completed).await?;
    println!("completed: {} ({})", action.title, action.id);
    pool.close().await;
    Ok(())
}

/// `desk actions reopen <id>`.
pub async fn run_reopen(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let action = set_status(&pool, id, ActionStatus::Pending).await?;
    println!("reopened: {} ({})", action.title, action.id);
    pool.close().await;
    Ok(())
}

/// `desk actions cancel <id>`.
pub async fn run_cancel(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let action = set_status(&pool, id, ActionStatus::Cancelled).await?;
    println!("cancelled: {} ({})", action.title, action.id);
    pool.close().await;
    Ok(())
}

/// Update an action's status by id prefix. The `synced_status` merge base is
/// left alone so the next reconciliation treats this as a database-side edit.
async fn set_status(pool: &SqlitePool, id: &str, status: ActionStatus) -> Result<Action> {
    let action = find_by_prefix(pool, id).await?;
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE actions SET status = ?, origin = 'database', updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(&action.id)
        .execute(pool)
        .await?;
    Ok(action)
}

async fn find_by_prefix(pool: &SqlitePool, id: &str) -> Result<Action> {
    let rows = sqlx::query("SELECT * FROM actions WHERE id LIKE ? AND archived = 0")
        .bind(format!("{}%", id))
        .fetch_all(pool)
        .await?;
    match rows.len() {
        0 => bail!("no action matches '{}'", id),
        1 => Ok(db::action_from_row(&rows[0])),
        n => bail!("'{}' is ambiguous ({} matches); use a longer prefix", id, n),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 1).collect();
        format!("{}…", head)
    }
}
