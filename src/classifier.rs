//! Document classification: ordered rule evaluation over filename patterns,
//! content heuristics, and sidecar metadata, with a bounded research fallback
//! for unrecognized external sources.

use anyhow::Result;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::models::{Classification, DocType, EntityRef};

/// Optional metadata exported next to a document by the calendar/email
/// integration (`<file>.meta.json`). Treated as an opaque data source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SidecarMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
}

/// Sidecar path for a staged document: `x.md` -> `x.md.meta.json`.
pub fn sidecar_path(doc_path: &Path) -> PathBuf {
    let mut name = doc_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".meta.json");
    doc_path.with_file_name(name)
}

pub fn load_sidecar(doc_path: &Path) -> Option<SidecarMeta> {
    let content = std::fs::read_to_string(sidecar_path(doc_path)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Outcome of classification. `NeedsReview` carries the best classification
/// reached so far plus the reason the document should be parked.
#[derive(Debug, Clone)]
pub enum ClassifyOutcome {
    Ready(Classification),
    NeedsReview {
        classification: Classification,
        reason: String,
    },
}

pub struct Classifier<'a> {
    config: &'a Config,
    pool: &'a SqlitePool,
}

impl<'a> Classifier<'a> {
    pub fn new(config: &'a Config, pool: &'a SqlitePool) -> Self {
        Self { config, pool }
    }

    /// Classify a staged document. Never blocks longer than the configured
    /// research timeout beyond the (fast, local) rule evaluation.
    pub async fn classify(&self, staging_path: &Path) -> Result<ClassifyOutcome> {
        let file_name = staging_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let body = std::fs::read_to_string(staging_path).unwrap_or_default();
        let meta = load_sidecar(staging_path);

        // Ordered rules: filename pattern first (highest confidence), then
        // content heuristics.
        let (doc_type, mut confidence) = filename_rule(&file_name)
            .or_else(|| content_rule(&body))
            .unwrap_or((DocType::Unknown, 0.0));

        // Metadata cross-reference against known entities.
        let entity = self.match_entity(&file_name, &body, meta.as_ref());
        if entity.is_some() && doc_type != DocType::Unknown {
            confidence = confidence.max(0.8);
        }

        if confidence >= self.config.classify.min_confidence {
            return Ok(ClassifyOutcome::Ready(Classification {
                doc_type,
                confidence,
                entity,
            }));
        }

        // Research fallback, bounded. A timeout proceeds with unknown + low
        // confidence rather than stalling the pipeline.
        let timeout = Duration::from_secs(self.config.classify.research_timeout_secs);
        match tokio::time::timeout(timeout, self.research(&file_name, meta.as_ref())).await {
            Ok(Ok(Some(found))) => Ok(ClassifyOutcome::Ready(Classification {
                doc_type,
                confidence: self.config.classify.min_confidence,
                entity: Some(found),
            })),
            Ok(Ok(None)) => Ok(ClassifyOutcome::NeedsReview {
                classification: Classification {
                    doc_type: DocType::Unknown,
                    confidence,
                    entity,
                },
                reason: format!(
                    "unclassified: no rule reached confidence {:.2} and research found no entity",
                    self.config.classify.min_confidence
                ),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(file = %file_name, "research fallback timed out; proceeding as unknown");
                Ok(ClassifyOutcome::Ready(Classification {
                    doc_type: DocType::Unknown,
                    confidence: 0.2,
                    entity,
                }))
            }
        }
    }

    /// Cross-reference sidecar metadata and names against configured
    /// entities. Domain matches outrank name/alias matches.
    fn match_entity(
        &self,
        file_name: &str,
        body: &str,
        meta: Option<&SidecarMeta>,
    ) -> Option<EntityRef> {
        if let Some(meta) = meta {
            let addresses = meta
                .attendees
                .iter()
                .chain(meta.sender.as_ref())
                .map(|a| a.to_lowercase());
            for address in addresses {
                let domain = match address.rsplit_once('@') {
                    Some((_, d)) => d.to_string(),
                    None => continue,
                };
                for entity in &self.config.entities {
                    if entity.domains.iter().any(|d| d.to_lowercase() == domain) {
                        return Some(EntityRef {
                            name: entity.name.clone(),
                            kind: entity.kind(),
                        });
                    }
                }
            }
        }

        // Name or alias appearing in the filename or the head of the body.
        let haystack = format!(
            "{} {}",
            file_name.to_lowercase(),
            body.chars().take(4000).collect::<String>().to_lowercase()
        );
        for entity in &self.config.entities {
            let names = std::iter::once(&entity.name).chain(entity.aliases.iter());
            for name in names {
                let needle = name.to_lowercase();
                if needle.len() >= 3 && haystack.contains(&needle) {
                    return Some(EntityRef {
                        name: entity.name.clone(),
                        kind: entity.kind(),
                    });
                }
            }
        }
        None
    }

    /// Research fallback: entity inference from available context — domain
    /// lookup against entity names, then a prior-document search in the
    /// working database.
    async fn research(
        &self,
        file_name: &str,
        meta: Option<&SidecarMeta>,
    ) -> Result<Option<EntityRef>> {
        // Domain lookup: the organization token of an attendee domain often
        // matches an entity name even when no domain is configured.
        if let Some(meta) = meta {
            let addresses = meta
                .attendees
                .iter()
                .chain(meta.sender.as_ref())
                .map(|a| a.to_lowercase());
            for address in addresses {
                let org = address
                    .rsplit_once('@')
                    .and_then(|(_, d)| d.split('.').next())
                    .unwrap_or_default();
                if org.len() < 3 {
                    continue;
                }
                for entity in &self.config.entities {
                    let names = std::iter::once(&entity.name).chain(entity.aliases.iter());
                    if names.into_iter().any(|n| n.to_lowercase() == org) {
                        return Ok(Some(EntityRef {
                            name: entity.name.clone(),
                            kind: entity.kind(),
                        }));
                    }
                }
            }
        }

        // Prior-document search: a previously attributed document whose
        // filename shares a distinctive token with this one.
        for token in slug_tokens(file_name) {
            let pattern = format!("%{}%", token);
            let row = sqlx::query(
                r#"
                SELECT entity, entity_kind FROM documents
                WHERE entity IS NOT NULL AND LOWER(file_name) LIKE ?
                ORDER BY created_at DESC LIMIT 1
                "#,
            )
            .bind(&pattern)
            .fetch_optional(self.pool)
            .await?;

            if let Some(row) = row {
                let name: String = row.get("entity");
                let kind: Option<String> = row.get("entity_kind");
                let kind = kind
                    .as_deref()
                    .and_then(crate::models::EntityKind::parse)
                    .unwrap_or(crate::models::EntityKind::Account);
                return Ok(Some(EntityRef { name, kind }));
            }
        }

        Ok(None)
    }
}

/// Filename pattern rules, strongest signals first.
fn filename_rule(file_name: &str) -> Option<(DocType, f64)> {
    let lower = file_name.to_lowercase();
    let stem = lower.rsplit_once('.').map(|(s, _)| s).unwrap_or(&lower);

    if stem.contains("transcript") {
        return Some((DocType::Transcript, 0.9));
    }
    if has_date_prefix(stem)
        && ["call", "meeting", "sync", "standup", "1on1"]
            .iter()
            .any(|m| stem.contains(m))
    {
        return Some((DocType::Transcript, 0.85));
    }
    if stem.contains("report") {
        return Some((DocType::Report, 0.8));
    }
    if stem.contains("note") {
        return Some((DocType::Note, 0.8));
    }
    None
}

/// True for names like `2026-02-03-acme-call`.
fn has_date_prefix(stem: &str) -> bool {
    stem.get(..10)
        .map(|p| chrono::NaiveDate::parse_from_str(p, "%Y-%m-%d").is_ok())
        .unwrap_or(false)
}

/// Content heuristics: keyword density and structural markers. Weaker than a
/// filename match, so the confidence tops out below it.
fn content_rule(body: &str) -> Option<(DocType, f64)> {
    if body.trim().is_empty() {
        return None;
    }
    let lower = body.to_lowercase();

    let mut transcript = 0usize;
    let mut note = 0usize;
    let mut report = 0usize;

    for line in body.lines().take(400) {
        let trimmed = line.trim_start();
        // Timestamped or speaker-attributed lines.
        if trimmed.starts_with('[') && trimmed.contains(':') {
            transcript += 1;
        } else if let Some((head, _)) = trimmed.split_once(':') {
            if !head.is_empty() && head.len() <= 32 && head.split_whitespace().count() <= 3 {
                transcript += 1;
            }
        }
        if trimmed.starts_with("- ") || trimmed.starts_with("* ") {
            note += 1;
        }
        if trimmed.starts_with('|') {
            report += 1;
        }
    }

    for marker in ["attendees", "transcript", "recording"] {
        if lower.contains(marker) {
            transcript += 4;
        }
    }
    for marker in ["executive summary", "findings", "recommendation", "quarterly"] {
        if lower.contains(marker) {
            report += 4;
        }
    }

    let (doc_type, score) = [
        (DocType::Transcript, transcript),
        (DocType::Report, report),
        (DocType::Note, note),
    ]
    .into_iter()
    .max_by_key(|(_, s)| *s)?;

    if score < 3 {
        return None;
    }
    let confidence = (0.5 + 0.03 * score as f64).min(0.75);
    Some((doc_type, confidence))
}

/// Distinctive tokens from a filename slug: drops the date prefix, numbers,
/// and short connective words.
fn slug_tokens(file_name: &str) -> Vec<String> {
    let lower = file_name.to_lowercase();
    let stem = lower.rsplit_once('.').map(|(s, _)| s).unwrap_or(&lower);
    stem.split(['-', '_', ' ', '.'])
        .filter(|t| t.len() >= 4 && !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !matches!(*t, "call" | "meeting" | "notes" | "note" | "report" | "with"))
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn test_config(root: &Path) -> Config {
        Config::for_tests(root)
    }

    async fn test_pool() -> SqlitePool {
        // Single connection: a pooled in-memory SQLite would give each
        // connection its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        // Only the documents table is consulted by research.
        sqlx::query(
            "CREATE TABLE documents (id TEXT PRIMARY KEY, file_name TEXT, entity TEXT, entity_kind TEXT, created_at INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[test]
    fn filename_rules() {
        assert_eq!(
            filename_rule("2026-02-03-acme-call.md"),
            Some((DocType::Transcript, 0.85))
        );
        assert_eq!(
            filename_rule("weekly-call-transcript.md"),
            Some((DocType::Transcript, 0.9))
        );
        assert_eq!(filename_rule("q2-report.md"), Some((DocType::Report, 0.8)));
        assert_eq!(filename_rule("random-file.md"), None);
    }

    #[test]
    fn content_rule_detects_transcripts() {
        let body = "Attendees: Sarah, Jim\n\nSarah: let's review the rollout\nJim: agreed\nSarah: I'll send the deck\n";
        let (t, conf) = content_rule(body).unwrap();
        assert_eq!(t, DocType::Transcript);
        assert!(conf >= 0.5);
    }

    #[tokio::test]
    async fn acme_scenario_classifies_transcript_with_entity() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let pool = test_pool().await;

        let doc = tmp.path().join("2026-02-03-acme-call.md");
        std::fs::write(&doc, "Sarah: kickoff recap\nJim: sounds good\n").unwrap();
        std::fs::write(
            sidecar_path(&doc),
            r#"{"attendees": ["sarah@acme.com", "me@example.com"]}"#,
        )
        .unwrap();

        let classifier = Classifier::new(&config, &pool);
        match classifier.classify(&doc).await.unwrap() {
            ClassifyOutcome::Ready(c) => {
                assert_eq!(c.doc_type, DocType::Transcript);
                assert!(c.confidence >= 0.8);
                let entity = c.entity.unwrap();
                assert_eq!(entity.name, "Acme");
                assert_eq!(entity.kind, EntityKind::Account);
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unmatched_document_is_parked_for_review() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let pool = test_pool().await;

        let doc = tmp.path().join("zzz.md");
        std::fs::write(&doc, "nothing recognizable").unwrap();

        let classifier = Classifier::new(&config, &pool);
        match classifier.classify(&doc).await.unwrap() {
            ClassifyOutcome::NeedsReview { classification, .. } => {
                assert_eq!(classification.doc_type, DocType::Unknown);
            }
            other => panic!("expected NeedsReview, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn research_inherits_entity_from_prior_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO documents (id, file_name, entity, entity_kind, created_at) VALUES ('d1', 'globex-kickoff-call.md', 'Globex', 'account', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let doc = tmp.path().join("globex-followup.md");
        std::fs::write(&doc, "short").unwrap();

        let classifier = Classifier::new(&config, &pool);
        match classifier.classify(&doc).await.unwrap() {
            ClassifyOutcome::Ready(c) => {
                assert_eq!(c.entity.unwrap().name, "Globex");
            }
            other => panic!("expected Ready via research, got {:?}", other),
        }
    }
}
