//! Holding-area watcher.
//!
//! Polls the holding directory and emits a "document ready" signal once a
//! file has been stable (no size or mtime change) for the configured quiet
//! period, so the pipeline never acts on a partially-written file. Duplicate
//! signals for a path whose document is already in flight are coalesced, and
//! content the tracker has already seen through to a terminal state is
//! skipped — a file the user re-saves after delivery is not reprocessed.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::models::{DocType, Document};
use crate::tracker::Tracker;

/// A document that passed the stability check and has a processing record.
#[derive(Debug, Clone)]
pub struct ReadyDoc {
    pub record_id: String,
    pub document_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    mtime_secs: i64,
}

struct PendingFile {
    stamp: FileStamp,
    unchanged_since: Instant,
}

pub struct Watcher {
    config: Config,
    pool: SqlitePool,
    tracker: Tracker,
    include: GlobSet,
    exclude: GlobSet,
    pending: HashMap<PathBuf, PendingFile>,
    /// Paths already promoted (or skipped) this run, keyed by content hash,
    /// so an unchanged file is not rehashed every poll.
    seen: HashMap<PathBuf, String>,
}

impl Watcher {
    pub fn new(config: Config, pool: SqlitePool) -> Result<Self> {
        let include = build_globset(&config.watcher.include_globs)?;

        // Sidecar metadata and dotfiles are never documents.
        let mut excludes = vec!["**/*.meta.json".to_string(), "**/.*".to_string()];
        excludes.extend(config.watcher.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        let tracker = Tracker::new(pool.clone());
        Ok(Self {
            config,
            pool,
            tracker,
            include,
            exclude,
            pending: HashMap::new(),
            seen: HashMap::new(),
        })
    }

    /// Event loop: poll, promote stable files, hand them to the pipeline.
    /// Returns an error only for blocking conditions (holding area
    /// unreadable, database unreachable) — intake halts rather than silently
    /// dropping events.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<ReadyDoc>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.watcher.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("watcher stopped");
                    return Ok(());
                }

                _ = interval.tick() => {}
            }

            for doc in self.scan().await? {
                if tx.send(doc).await.is_err() {
                    // Pipeline gone; nothing left to feed.
                    return Ok(());
                }
            }
        }
    }

    /// One poll pass: refresh stability bookkeeping and promote files that
    /// have been quiet long enough.
    pub async fn scan(&mut self) -> Result<Vec<ReadyDoc>> {
        let files = self.list_holding()?;
        let quiet = Duration::from_millis(self.config.watcher.quiet_period_ms);
        let now = Instant::now();

        // Forget files that vanished, so a later re-drop is re-evaluated.
        self.pending.retain(|path, _| files.contains_key(path));
        self.seen.retain(|path, _| files.contains_key(path));

        let mut stable = Vec::new();
        for (path, stamp) in files {
            match self.pending.get_mut(&path) {
                Some(entry) if entry.stamp == stamp => {
                    if now.duration_since(entry.unchanged_since) >= quiet {
                        stable.push(path);
                    }
                }
                Some(entry) => {
                    entry.stamp = stamp;
                    entry.unchanged_since = now;
                }
                None => {
                    self.pending.insert(
                        path,
                        PendingFile {
                            stamp,
                            unchanged_since: now,
                        },
                    );
                }
            }
        }

        let mut ready = Vec::new();
        for path in stable {
            if let Some(doc) = self.promote(&path).await? {
                ready.push(doc);
            }
        }
        Ok(ready)
    }

    /// One-shot discovery for `desk process`: the holding area is at rest,
    /// so the quiet period is waived.
    pub async fn discover_now(&mut self) -> Result<Vec<ReadyDoc>> {
        let files = self.list_holding()?;
        let mut ready = Vec::new();
        for path in files.into_keys() {
            if let Some(doc) = self.promote(&path).await? {
                ready.push(doc);
            }
        }
        Ok(ready)
    }

    fn list_holding(&self) -> Result<HashMap<PathBuf, FileStamp>> {
        let holding = self.config.holding_dir();
        if !holding.is_dir() {
            bail!(
                "holding area unreadable: {} (run `desk init`?)",
                holding.display()
            );
        }

        let mut files = HashMap::new();
        for entry in WalkDir::new(&holding) {
            let entry = entry.with_context(|| {
                format!("failed to scan holding area {}", holding.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&holding).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            // A file can vanish between listing and stat; treat it as gone.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime_secs = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            files.insert(
                path.to_path_buf(),
                FileStamp {
                    size: metadata.len(),
                    mtime_secs,
                },
            );
        }
        Ok(files)
    }

    /// Turn a stable file into a tracked document, applying the dedup and
    /// coalescing rules.
    async fn promote(&mut self, path: &Path) -> Result<Option<ReadyDoc>> {
        let hash = match hash_file(path) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "file unreadable during promote; skipping");
                return Ok(None);
            }
        };

        if self.seen.get(path) == Some(&hash) {
            return Ok(None);
        }
        self.seen.insert(path.to_path_buf(), hash.clone());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Same content already tracked?
        if let Some(record) = self.tracker.get_by_hash(&hash).await? {
            if record.state.is_terminal() {
                tracing::info!(
                    file = %file_name,
                    state = record.state.as_str(),
                    "skipping already-processed content"
                );
                return Ok(None);
            }
            // Active record: coalesce. A rename within the holding area
            // keeps the document's identity; just repoint the staging path.
            if let Some(doc) = db::get_document(&self.pool, &record.document_id).await? {
                if doc.staging_path != path.to_string_lossy() {
                    update_staging_path(&self.pool, &doc.id, path, &file_name).await?;
                    tracing::debug!(file = %file_name, "staging path updated after rename");
                }
            }
            tracing::debug!(file = %file_name, "coalesced duplicate ready signal");
            return Ok(None);
        }

        // Same path already in flight with different content (user re-saved
        // mid-processing): coalesce rather than double-track.
        if path_in_flight(&self.pool, path).await? {
            tracing::debug!(file = %file_name, "path already in flight; coalescing");
            return Ok(None);
        }

        let now = chrono::Utc::now().timestamp();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.clone(),
            staging_path: path.to_string_lossy().to_string(),
            content_hash: hash.clone(),
            doc_type: DocType::Unknown,
            confidence: 0.0,
            entity: None,
            entity_kind: None,
            destination: None,
            payload_path: None,
            created_at: now,
            updated_at: now,
            archived: false,
        };
        db::insert_document(&self.pool, &doc).await?;

        let record_id = Uuid::new_v4().to_string();
        let record = self
            .tracker
            .create_discovered(&record_id, &doc.id, &hash)
            .await?;

        tracing::info!(file = %file_name, "document ready");
        Ok(Some(ReadyDoc {
            record_id: record.id,
            document_id: doc.id,
            file_name,
        }))
    }
}

async fn update_staging_path(
    pool: &SqlitePool,
    document_id: &str,
    path: &Path,
    file_name: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE documents SET staging_path = ?, file_name = ?, updated_at = ? WHERE id = ?",
    )
    .bind(path.to_string_lossy().to_string())
    .bind(file_name)
    .bind(now)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn path_in_flight(pool: &SqlitePool, path: &Path) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM documents d
        JOIN processing_records r ON r.document_id = d.id
        WHERE d.staging_path = ? AND r.state NOT IN ('delivered', 'permanently_failed')
        "#,
    )
    .bind(path.to_string_lossy().to_string())
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
