use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::EntityKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root of the filing structure (contains Inbox/, Projects/, Areas/, ...).
    pub root: PathBuf,
    /// Holding area directory name under the root.
    #[serde(default = "default_holding")]
    pub holding: String,
}

fn default_holding() -> String {
    "Inbox".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    /// Database path. Defaults to `.deskflow/deskflow.db` under the workspace
    /// root when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// How often the holding area is scanned.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A file must be unchanged (size + mtime) for this long before it is
    /// considered fully written and ready for processing.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            quiet_period_ms: default_quiet_period_ms(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_quiet_period_ms() -> u64 {
    2000
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifyConfig {
    /// Minimum confidence a rule must reach before classification is accepted
    /// without the research fallback.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Hard bound on the research fallback. On timeout the document proceeds
    /// as `unknown` with low confidence instead of stalling the pipeline.
    #[serde(default = "default_research_timeout_secs")]
    pub research_timeout_secs: u64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            research_timeout_secs: default_research_timeout_secs(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.6
}
fn default_research_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    /// Enrichment agent command line. The directive file path is appended as
    /// the final argument; the payload is expected on stdout.
    pub command: Vec<String>,
    /// Hard wall-clock timeout per subprocess invocation.
    #[serde(default = "default_enrich_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry budget for transient failures (timeout, crash).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries; doubles per attempt.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Maximum number of concurrently processed documents (and therefore
    /// concurrently running enrichment subprocesses).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_enrich_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_secs() -> u64 {
    2
}
fn default_concurrency() -> usize {
    2
}

/// A known entity declared in configuration: an account, project, or person
/// the classifier can attribute documents to.
#[derive(Debug, Deserialize, Clone)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default = "default_entity_kind")]
    pub kind: String,
    /// Email domains owned by this entity (e.g. `acme.com`).
    #[serde(default)]
    pub domains: Vec<String>,
    /// Alternate names matched against filenames and content.
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_entity_kind() -> String {
    "account".to_string()
}

impl EntityConfig {
    pub fn kind(&self) -> EntityKind {
        // Validated at load time; default keeps the method infallible.
        EntityKind::parse(&self.kind).unwrap_or(EntityKind::Account)
    }
}

impl Config {
    /// Absolute path to the holding area.
    pub fn holding_dir(&self) -> PathBuf {
        self.workspace.root.join(&self.workspace.holding)
    }

    /// Internal state directory (database, directives, payloads).
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.root.join(".deskflow")
    }

    pub fn directives_dir(&self) -> PathBuf {
        self.state_dir().join("directives")
    }

    pub fn payloads_dir(&self) -> PathBuf {
        self.state_dir().join("payloads")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db
            .path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("deskflow.db"))
    }
}

#[cfg(test)]
impl Config {
    /// Workspace rooted at a temp directory, tuned for fast tests: a known
    /// "Acme" account, near-zero quiet period, and a trivially true agent.
    pub(crate) fn for_tests(root: &Path) -> Config {
        Config {
            workspace: WorkspaceConfig {
                root: root.to_path_buf(),
                holding: "Inbox".to_string(),
            },
            db: DbConfig::default(),
            watcher: WatcherConfig {
                poll_interval_ms: 20,
                quiet_period_ms: 10,
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
            },
            classify: ClassifyConfig::default(),
            enrich: EnrichConfig {
                command: vec!["true".to_string()],
                timeout_secs: 5,
                max_retries: 1,
                backoff_secs: 1,
                concurrency: 1,
            },
            entities: vec![EntityConfig {
                name: "Acme".to_string(),
                kind: "account".to_string(),
                domains: vec!["acme.com".to_string()],
                aliases: vec![],
            }],
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate classification
    if !(0.0..=1.0).contains(&config.classify.min_confidence) {
        anyhow::bail!("classify.min_confidence must be in [0.0, 1.0]");
    }

    // Validate watcher
    if config.watcher.poll_interval_ms == 0 {
        anyhow::bail!("watcher.poll_interval_ms must be > 0");
    }

    // Validate enrichment
    if config.enrich.command.is_empty() {
        anyhow::bail!("enrich.command must name the enrichment agent executable");
    }
    if config.enrich.timeout_secs == 0 {
        anyhow::bail!("enrich.timeout_secs must be > 0");
    }
    if config.enrich.concurrency == 0 {
        anyhow::bail!("enrich.concurrency must be >= 1");
    }

    // Validate entities
    for entity in &config.entities {
        if entity.name.trim().is_empty() {
            anyhow::bail!("entities entry with empty name");
        }
        if EntityKind::parse(&entity.kind).is_none() {
            anyhow::bail!(
                "Unknown entity kind '{}' for '{}'. Must be account, project, or person.",
                entity.kind,
                entity.name
            );
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("deskflow.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[workspace]
root = "/tmp/desk"

[enrich]
command = ["enrich-agent"]
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.workspace.holding, "Inbox");
        assert_eq!(cfg.classify.min_confidence, 0.6);
        assert_eq!(cfg.enrich.timeout_secs, 120);
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/desk/.deskflow/deskflow.db"));
    }

    #[test]
    fn rejects_unknown_entity_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[workspace]
root = "/tmp/desk"

[enrich]
command = ["enrich-agent"]

[[entities]]
name = "Acme"
kind = "vendor"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_empty_enrich_command() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[workspace]
root = "/tmp/desk"

[enrich]
command = []
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
