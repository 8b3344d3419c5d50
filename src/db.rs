//! Working database: connection, schema migrations, and shared document
//! queries.
//!
//! The filing structure (markdown under the workspace root) is the durable,
//! human-readable layer; SQLite is the fast queryable index of actions and
//! processing state. Both are only ever mutated by the pipeline's own
//! components.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use crate::config::Config;
use crate::models::{Action, ActionStatus, DocType, Document, SyncOrigin};

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create all tables. Idempotent — safe to run on every `desk init`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            staging_path TEXT NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            doc_type TEXT NOT NULL DEFAULT 'unknown',
            confidence REAL NOT NULL DEFAULT 0,
            entity TEXT,
            entity_kind TEXT,
            destination TEXT,
            payload_path TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            anchor TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            due_date TEXT,
            owner TEXT,
            source_ref TEXT NOT NULL,
            origin TEXT NOT NULL DEFAULT 'database',
            synced_status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, anchor),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_records (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL UNIQUE,
            state TEXT NOT NULL,
            classify_retries INTEGER NOT NULL DEFAULT 0,
            enrich_retries INTEGER NOT NULL DEFAULT 0,
            deliver_retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            at INTEGER NOT NULL,
            note TEXT,
            FOREIGN KEY (record_id) REFERENCES processing_records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_document_id ON actions(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_state ON processing_records(state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_destination ON documents(destination)")
        .execute(pool)
        .await?;

    Ok(())
}

/// `desk init`: create the workspace skeleton and the database schema.
pub async fn run_init(config: &Config) -> Result<()> {
    let root = &config.workspace.root;
    for dir in [
        config.holding_dir(),
        root.join("Projects"),
        root.join("Areas"),
        root.join("Resources"),
        root.join("Archive"),
        root.join("Accounts"),
        config.directives_dir(),
        config.payloads_dir(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    let pool = connect(config).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

pub fn document_from_row(row: &SqliteRow) -> Document {
    let doc_type: String = row.get("doc_type");
    Document {
        id: row.get("id"),
        file_name: row.get("file_name"),
        staging_path: row.get("staging_path"),
        content_hash: row.get("content_hash"),
        doc_type: DocType::parse(&doc_type),
        confidence: row.get("confidence"),
        entity: row.get("entity"),
        entity_kind: row.get("entity_kind"),
        destination: row.get("destination"),
        payload_path: row.get("payload_path"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        archived: row.get::<i64, _>("archived") != 0,
    }
}

pub fn action_from_row(row: &SqliteRow) -> Action {
    let status: String = row.get("status");
    let origin: String = row.get("origin");
    let synced: String = row.get("synced_status");
    Action {
        id: row.get("id"),
        document_id: row.get("document_id"),
        anchor: row.get("anchor"),
        title: row.get("title"),
        status: ActionStatus::parse(&status),
        priority: row.get("priority"),
        due_date: row.get("due_date"),
        owner: row.get("owner"),
        source_ref: row.get("source_ref"),
        origin: SyncOrigin::parse(&origin),
        synced_status: ActionStatus::parse(&synced),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        archived: row.get::<i64, _>("archived") != 0,
    }
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(document_from_row))
}

pub async fn get_document_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE content_hash = ?")
        .bind(hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(document_from_row))
}

pub async fn insert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, file_name, staging_path, content_hash, doc_type, confidence,
                               entity, entity_kind, destination, payload_path,
                               created_at, updated_at, archived)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.file_name)
    .bind(&doc.staging_path)
    .bind(&doc.content_hash)
    .bind(doc.doc_type.as_str())
    .bind(doc.confidence)
    .bind(&doc.entity)
    .bind(&doc.entity_kind)
    .bind(&doc.destination)
    .bind(&doc.payload_path)
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .bind(doc.archived as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_classification(
    pool: &SqlitePool,
    id: &str,
    doc_type: DocType,
    confidence: f64,
    entity: Option<&str>,
    entity_kind: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE documents SET doc_type = ?, confidence = ?, entity = ?, entity_kind = ?, updated_at = ? WHERE id = ?",
    )
    .bind(doc_type.as_str())
    .bind(confidence)
    .bind(entity)
    .bind(entity_kind)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_destination(pool: &SqlitePool, id: &str, destination: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET destination = ?, updated_at = ? WHERE id = ?")
        .bind(destination)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_payload_path(pool: &SqlitePool, id: &str, payload_path: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET payload_path = ?, updated_at = ? WHERE id = ?")
        .bind(payload_path)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Destinations already claimed by another document. Routing consults this in
/// addition to the filesystem so two staged documents cannot take the same
/// canonical path. The document being routed is excluded so a re-route (user
/// retry) keeps its own claim.
pub async fn destination_claimed(
    pool: &SqlitePool,
    destination: &str,
    exclude_document_id: &str,
) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE destination = ? AND id != ?")
            .bind(destination)
            .bind(exclude_document_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}
