//! Crash-recovery, conflict-resolution, and cancellation behavior, driven
//! through the library so individual pipeline steps can be interrupted at
//! precise points.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use deskflow::classifier::{Classifier, ClassifyOutcome};
use deskflow::config::{
    ClassifyConfig, Config, DbConfig, EnrichConfig, EntityConfig, WatcherConfig, WorkspaceConfig,
};
use deskflow::db;
use deskflow::enrich::{EnrichError, EnrichOutcome, EnrichmentAgent, Orchestrator};
use deskflow::models::ActionStatus;
use deskflow::pipeline::Pipeline;
use deskflow::report::NoReporter;
use deskflow::router;
use deskflow::sync;
use deskflow::tracker::{ProcState, Tracker};
use deskflow::watcher::{ReadyDoc, Watcher};

const PAYLOAD: &str = r#"{"summary": "Kickoff recap.", "decisions": ["Ship in Q2"], "actions": [{"title": "Send follow-up deck", "owner": "sarah", "due_date": "2026-02-10"}], "tags": ["acme"]}"#;

/// In-process agent that returns a fixed payload and counts invocations.
struct CountingAgent(AtomicUsize);

#[async_trait]
impl EnrichmentAgent for CountingAgent {
    async fn enrich(&self, _directive: &Path) -> Result<String, EnrichError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(PAYLOAD.to_string())
    }
}

/// Agent that never finishes within a test's patience.
struct SlowAgent;

#[async_trait]
impl EnrichmentAgent for SlowAgent {
    async fn enrich(&self, _directive: &Path) -> Result<String, EnrichError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(PAYLOAD.to_string())
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        workspace: WorkspaceConfig {
            root: root.to_path_buf(),
            holding: "Inbox".to_string(),
        },
        db: DbConfig::default(),
        watcher: WatcherConfig::default(),
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

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    db::run_init(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    (tmp, config, pool)
}

fn drop_acme_call(config: &Config) -> std::path::PathBuf {
    let doc = config.holding_dir().join("2026-02-03-acme-call.md");
    std::fs::write(&doc, "Sarah: recap\nJim: sounds good\n").unwrap();
    std::fs::write(
        deskflow::classifier::sidecar_path(&doc),
        r#"{"attendees": ["sarah@acme.com"]}"#,
    )
    .unwrap();
    doc
}

async fn discover_one(config: &Config, pool: &SqlitePool) -> ReadyDoc {
    let mut watcher = Watcher::new(config.clone(), pool.clone()).unwrap();
    let mut ready = watcher.discover_now().await.unwrap();
    assert_eq!(ready.len(), 1);
    ready.remove(0)
}

/// Walk a document to `enriched` by hand, the way the pipeline would, so a
/// crash can be simulated between `enriched` and `delivered`.
async fn drive_to_enriched(
    config: &Config,
    pool: &SqlitePool,
    tracker: &Tracker,
    job: &ReadyDoc,
    agent: &dyn EnrichmentAgent,
) {
    tracker
        .transition(&job.record_id, ProcState::Classifying, None)
        .await
        .unwrap();
    let doc = db::get_document(pool, &job.document_id).await.unwrap().unwrap();
    let classifier = Classifier::new(config, pool);
    let classification = match classifier
        .classify(Path::new(&doc.staging_path))
        .await
        .unwrap()
    {
        ClassifyOutcome::Ready(c) => c,
        other => panic!("expected Ready, got {:?}", other),
    };
    db::update_classification(
        pool,
        &doc.id,
        classification.doc_type,
        classification.confidence,
        classification.entity.as_ref().map(|e| e.name.as_str()),
        classification.entity.as_ref().map(|e| e.kind.as_str()),
    )
    .await
    .unwrap();
    tracker
        .transition(&job.record_id, ProcState::Classified, None)
        .await
        .unwrap();

    tracker
        .transition(&job.record_id, ProcState::Routing, None)
        .await
        .unwrap();
    let doc = db::get_document(pool, &job.document_id).await.unwrap().unwrap();
    router::route(pool, config, &doc).await.unwrap();
    tracker
        .transition(&job.record_id, ProcState::Routed, None)
        .await
        .unwrap();

    let doc = db::get_document(pool, &job.document_id).await.unwrap().unwrap();
    let orchestrator = Orchestrator::new(config, pool, tracker, agent);
    let cancel = CancellationToken::new();
    match orchestrator.run(&doc, &job.record_id, &cancel).await.unwrap() {
        EnrichOutcome::Enriched { .. } => {}
        other => panic!("expected Enriched, got {:?}", other),
    }
}

#[tokio::test]
async fn delivery_resumes_after_crash_without_reenrichment() {
    let (_tmp, config, pool) = setup().await;
    let staged = drop_acme_call(&config);

    let job = discover_one(&config, &pool).await;
    let tracker = Tracker::new(pool.clone());

    let agent = CountingAgent(AtomicUsize::new(0));
    drive_to_enriched(&config, &pool, &tracker, &job, &agent).await;
    assert_eq!(agent.0.load(Ordering::SeqCst), 1);

    // "Crash" here: the process dies with the record in `enriched` and the
    // document still in staging.
    let record = tracker.get(&job.record_id).await.unwrap();
    assert_eq!(record.state, ProcState::Enriched);
    assert!(staged.exists());

    // Restart with an agent that counts any (unwanted) re-invocation.
    let poison = Arc::new(CountingAgent(AtomicUsize::new(0)));
    let pipeline = Pipeline::new(
        config.clone(),
        pool.clone(),
        poison.clone(),
        Arc::new(NoReporter),
    );
    let cancel = CancellationToken::new();
    pipeline.process_record(&job, &cancel).await.unwrap();

    assert_eq!(
        poison.0.load(Ordering::SeqCst),
        0,
        "enrichment must not be re-invoked after restart"
    );
    let record = tracker.get(&job.record_id).await.unwrap();
    assert_eq!(record.state, ProcState::Delivered);

    let doc = db::get_document(&pool, &job.document_id).await.unwrap().unwrap();
    let destination = doc.destination.unwrap();
    assert_eq!(destination, "Accounts/Acme/meetings/2026-02-03-acme-call.md");
    assert!(config.workspace.root.join(&destination).is_file());
    assert!(!staged.exists());

    let actions = sync::actions_for_document(&pool, &job.document_id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].source_ref, format!("{}#action-1", destination));
}

#[tokio::test]
async fn later_edit_wins_and_loser_is_logged_not_lost() {
    let (_tmp, config, pool) = setup().await;
    drop_acme_call(&config);

    let job = discover_one(&config, &pool).await;
    let agent = Arc::new(CountingAgent(AtomicUsize::new(0)));
    let pipeline = Pipeline::new(config.clone(), pool.clone(), agent, Arc::new(NoReporter));
    pipeline
        .process_record(&job, &CancellationToken::new())
        .await
        .unwrap();

    let actions = sync::actions_for_document(&pool, &job.document_id)
        .await
        .unwrap();
    let action_id = actions[0].id.clone();
    let delivered = config
        .workspace
        .root
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");

    // Database edit at T1 (older): completed.
    let old = chrono::Utc::now().timestamp() - 1000;
    sqlx::query("UPDATE actions SET status = 'completed', updated_at = ? WHERE id = ?")
        .bind(old)
        .bind(&action_id)
        .execute(&pool)
        .await
        .unwrap();

    // Document edit at T2 (now, the file's mtime): cancelled.
    let content = std::fs::read_to_string(&delivered).unwrap();
    let edited = content
        .replace("- [ ] Send follow-up deck", "- [x] Send follow-up deck")
        .replace("(due: 2026-02-10)", "(due: 2026-02-10) (cancelled)");
    std::fs::write(&delivered, edited).unwrap();

    let report = sync::reconcile(&config, &pool).await.unwrap();
    assert_eq!(report.conflicts, 1);

    // T2 > T1: the document side wins in both stores.
    let actions = sync::actions_for_document(&pool, &job.document_id)
        .await
        .unwrap();
    assert_eq!(actions[0].status, ActionStatus::Cancelled);

    // Second round, database side newer than the file.
    let future = chrono::Utc::now().timestamp() + 1000;
    sqlx::query("UPDATE actions SET status = 'completed', updated_at = ? WHERE id = ?")
        .bind(future)
        .bind(&action_id)
        .execute(&pool)
        .await
        .unwrap();
    let content = std::fs::read_to_string(&delivered).unwrap();
    let edited = content
        .replace("- [x] Send follow-up deck", "- [ ] Send follow-up deck")
        .replace(" (cancelled)", "");
    std::fs::write(&delivered, edited).unwrap();

    let report = sync::reconcile(&config, &pool).await.unwrap();
    assert_eq!(report.conflicts, 1);

    let actions = sync::actions_for_document(&pool, &job.document_id)
        .await
        .unwrap();
    assert_eq!(actions[0].status, ActionStatus::Completed);
    let content = std::fs::read_to_string(&delivered).unwrap();
    assert!(content.contains("- [x] Send follow-up deck"));
}

#[tokio::test]
async fn cancel_mid_enrichment_is_retryable_not_data_loss() {
    let (_tmp, config, pool) = setup().await;
    let staged = drop_acme_call(&config);

    let job = discover_one(&config, &pool).await;
    let pipeline = Pipeline::new(
        config.clone(),
        pool.clone(),
        Arc::new(SlowAgent),
        Arc::new(NoReporter),
    );

    let cancel = CancellationToken::new();
    let handle = {
        let pipeline = pipeline.clone();
        let job = job.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.process_record(&job, &cancel).await })
    };

    // Let it get into the enrichment subprocess, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let tracker = Tracker::new(pool.clone());
    let record = tracker.get(&job.record_id).await.unwrap();
    assert_eq!(record.state, ProcState::EnrichFailed);
    assert!(staged.exists(), "staging must be untouched after cancel");

    // The record resumes cleanly with a working agent.
    let pipeline = Pipeline::new(
        config.clone(),
        pool.clone(),
        Arc::new(CountingAgent(AtomicUsize::new(0))),
        Arc::new(NoReporter),
    );
    pipeline
        .process_record(&job, &CancellationToken::new())
        .await
        .unwrap();
    let record = tracker.get(&job.record_id).await.unwrap();
    assert_eq!(record.state, ProcState::Delivered);
}
