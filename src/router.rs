//! Destination routing under the PARA filing taxonomy.
//!
//! Resolution priority: explicit entity reference, then document type
//! default, then the generic inbox-review location. Routing only decides the
//! canonical path and creates intermediate directories — the file stays in
//! staging until delivery, so a failed enrichment leaves it recoverable.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;
use crate::models::{DocType, Document, EntityKind, EntityRef};

/// Subdirectory a document type files under within its base location.
fn subdir_for_type(doc_type: DocType) -> &'static str {
    match doc_type {
        DocType::Transcript => "meetings",
        DocType::Note => "notes",
        DocType::Report => "reports",
        DocType::Unknown => "inbox",
    }
}

/// Base directory for a routed document, relative to the workspace root.
fn base_dir(doc_type: DocType, entity: Option<&EntityRef>) -> PathBuf {
    match entity {
        Some(e) => {
            let top = match e.kind {
                EntityKind::Account => "Accounts",
                EntityKind::Project => "Projects",
                // People file under Areas: a person is an ongoing area of
                // responsibility, not a project with an end date.
                EntityKind::Person => "Areas",
            };
            Path::new(top).join(&e.name).join(subdir_for_type(doc_type))
        }
        None => match doc_type {
            DocType::Transcript => Path::new("Resources").join("meetings"),
            DocType::Note => Path::new("Resources").join("notes"),
            DocType::Report => Path::new("Resources").join("reports"),
            DocType::Unknown => Path::new("Resources").join("inbox-review"),
        },
    }
}

/// Resolve the canonical destination for a classified document, apply the
/// collision policy, create intermediate directories, and record the claim.
///
/// Returns the destination path relative to the workspace root.
pub async fn route(pool: &SqlitePool, config: &Config, doc: &Document) -> Result<String> {
    let entity = doc.entity_ref();
    let base = base_dir(doc.doc_type, entity.as_ref());
    let destination = disambiguate(pool, config, &base, &doc.file_name, &doc.id).await?;

    let abs = config.workspace.root.join(&destination);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create destination: {}", parent.display()))?;
    }

    db::update_destination(pool, &doc.id, &destination).await?;
    Ok(destination)
}

/// Collision policy: if the destination already exists (on disk, or claimed
/// by another document's record), append a monotonically increasing numeric
/// suffix scoped to that destination directory. Never overwrite.
async fn disambiguate(
    pool: &SqlitePool,
    config: &Config,
    base: &Path,
    file_name: &str,
    document_id: &str,
) -> Result<String> {
    let (stem, ext) = split_name(file_name);

    let mut n = 1u32;
    loop {
        let candidate_name = if n == 1 {
            file_name.to_string()
        } else {
            match ext {
                Some(ext) => format!("{}-{}.{}", stem, n, ext),
                None => format!("{}-{}", stem, n),
            }
        };
        let candidate = base.join(&candidate_name);
        let rel = candidate.to_string_lossy().to_string();

        let on_disk = config.workspace.root.join(&candidate).exists();
        let claimed = db::destination_claimed(pool, &rel, document_id).await?;
        if !on_disk && !claimed {
            return Ok(rel);
        }
        n += 1;
    }
}

fn split_name(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_routes_take_priority() {
        let acme = EntityRef {
            name: "Acme".to_string(),
            kind: EntityKind::Account,
        };
        assert_eq!(
            base_dir(DocType::Transcript, Some(&acme)),
            Path::new("Accounts/Acme/meetings")
        );

        let platform = EntityRef {
            name: "Platform Rewrite".to_string(),
            kind: EntityKind::Project,
        };
        assert_eq!(
            base_dir(DocType::Note, Some(&platform)),
            Path::new("Projects/Platform Rewrite/notes")
        );
    }

    #[test]
    fn type_defaults_and_review_fallback() {
        assert_eq!(
            base_dir(DocType::Report, None),
            Path::new("Resources/reports")
        );
        assert_eq!(
            base_dir(DocType::Unknown, None),
            Path::new("Resources/inbox-review")
        );
    }

    #[test]
    fn suffix_insertion_preserves_extension() {
        assert_eq!(split_name("a-call.md"), ("a-call", Some("md")));
        assert_eq!(split_name("README"), ("README", None));
        // Dotfiles keep their whole name as the stem.
        assert_eq!(split_name(".env"), (".env", None));
    }
}
