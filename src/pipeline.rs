//! Pipeline orchestration: a bounded worker pool that drives each document
//! through the state machine, resuming non-terminal records on startup.
//!
//! The watcher's event loop does no blocking work — every ready document is
//! handed to the pool, so a burst of dropped files cannot spawn unbounded
//! enrichment subprocesses. Mutual exclusion per document is enforced by the
//! processing record plus an in-flight set shared by the workers.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::classifier::{Classifier, ClassifyOutcome};
use crate::config::Config;
use crate::db;
use crate::enrich::{CommandAgent, EnrichOutcome, EnrichmentAgent, Orchestrator};
use crate::models::Document;
use crate::report::{PipelineEvent, PipelineReporter, ReportMode};
use crate::router;
use crate::sync;
use crate::tracker::{ProcState, ProcessingRecord, RetryStep, Tracker};
use crate::watcher::{ReadyDoc, Watcher};

/// Shared receiver for multiple workers pulling from one channel.
pub struct SharedReceiver<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    pool: SqlitePool,
    tracker: Tracker,
    agent: Arc<dyn EnrichmentAgent>,
    reporter: Arc<dyn PipelineReporter>,
    inflight: Arc<Mutex<HashSet<String>>>,
    /// Routing is check-then-claim on the destination path; serializing it
    /// keeps two workers from claiming the same destination.
    route_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        agent: Arc<dyn EnrichmentAgent>,
        reporter: Arc<dyn PipelineReporter>,
    ) -> Self {
        let tracker = Tracker::new(pool.clone());
        Self {
            config: Arc::new(config),
            pool,
            tracker,
            agent,
            reporter,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            route_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Re-enqueue every record that was mid-flight when the previous run
    /// stopped. Parked (`needs_review`) records wait for a user `desk retry`.
    pub async fn resume_pending(&self, tx: &mpsc::Sender<ReadyDoc>) -> Result<usize> {
        let records = self.tracker.non_terminal().await?;
        let mut resumed = 0;
        for record in records {
            if record.state == ProcState::NeedsReview {
                continue;
            }
            let Some(doc) = db::get_document(&self.pool, &record.document_id).await? else {
                tracing::warn!(record = %record.id, "record without document row; skipping resume");
                continue;
            };
            tracing::info!(
                file = %doc.file_name,
                state = record.state.as_str(),
                "resuming from previous run"
            );
            tx.send(ReadyDoc {
                record_id: record.id,
                document_id: doc.id,
                file_name: doc.file_name,
            })
            .await
            .ok();
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Spawn the bounded worker pool.
    pub fn spawn_workers(
        &self,
        count: usize,
        rx: SharedReceiver<ReadyDoc>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|i| {
                let pipeline = self.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker = i, "pipeline worker started");
                    loop {
                        let job = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            job = rx.recv() => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };

                        // A document already being worked on is not re-entered.
                        {
                            let mut set = pipeline.inflight.lock().unwrap();
                            if !set.insert(job.record_id.clone()) {
                                tracing::debug!(file = %job.file_name, "already in flight; coalesced");
                                continue;
                            }
                        }

                        pipeline.reporter.report(PipelineEvent::Ready {
                            file: job.file_name.clone(),
                        });
                        let result = pipeline.process_record(&job, &cancel).await;
                        pipeline.inflight.lock().unwrap().remove(&job.record_id);

                        if let Err(e) = result {
                            tracing::error!(file = %job.file_name, error = %e, "processing failed");
                            // Surface the failure: park the record with its
                            // reason rather than dropping it on the floor.
                            let reason = format!("{:#}", e);
                            let _ = pipeline
                                .tracker
                                .transition(&job.record_id, ProcState::NeedsReview, Some(&reason))
                                .await;
                            pipeline.reporter.report(PipelineEvent::Parked {
                                file: job.file_name.clone(),
                                reason,
                            });
                        }
                    }
                    tracing::debug!(worker = i, "pipeline worker stopped");
                })
            })
            .collect()
    }

    /// Drive one record from its current state to a resting state
    /// (delivered, parked, or cancelled). Each step consults the tracker, so
    /// a crash at any point resumes exactly where it left off.
    pub async fn process_record(&self, job: &ReadyDoc, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let record = self.tracker.get(&job.record_id).await?;
            let doc = db::get_document(&self.pool, &record.document_id)
                .await?
                .with_context(|| format!("document row missing for record {}", record.id))?;

            match record.state {
                ProcState::Discovered => {
                    self.tracker
                        .transition(&record.id, ProcState::Classifying, None)
                        .await?;
                    self.step_classify(&record, &doc).await?;
                }
                // Interrupted mid-step on a previous run: redo the step.
                ProcState::Classifying => self.step_classify(&record, &doc).await?,
                ProcState::Classified => {
                    self.tracker
                        .transition(&record.id, ProcState::Routing, None)
                        .await?;
                    self.step_route(&record, &doc).await?;
                }
                ProcState::Routing => self.step_route(&record, &doc).await?,
                ProcState::Routed | ProcState::EnrichFailed => {
                    self.reporter.report(PipelineEvent::Stage {
                        file: doc.file_name.clone(),
                        stage: "enriching",
                    });
                    let orchestrator =
                        Orchestrator::new(&self.config, &self.pool, &self.tracker, &*self.agent);
                    match orchestrator.run(&doc, &record.id, cancel).await? {
                        EnrichOutcome::Enriched { .. } => {}
                        EnrichOutcome::NeedsReview { reason } => {
                            self.reporter.report(PipelineEvent::Parked {
                                file: doc.file_name.clone(),
                                reason,
                            });
                            return Ok(());
                        }
                        EnrichOutcome::Cancelled => return Ok(()),
                    }
                }
                ProcState::Enriching => {
                    // The previous run died inside an enrichment subprocess.
                    self.tracker
                        .transition(
                            &record.id,
                            ProcState::EnrichFailed,
                            Some("interrupted by restart"),
                        )
                        .await?;
                }
                ProcState::Enriched => {
                    self.tracker
                        .transition(&record.id, ProcState::Delivering, None)
                        .await?;
                    self.step_deliver(&record, &doc).await?;
                }
                ProcState::Delivering => self.step_deliver(&record, &doc).await?,
                ProcState::NeedsReview
                | ProcState::Delivered
                | ProcState::PermanentlyFailed => return Ok(()),
            }
        }
    }

    async fn step_classify(&self, record: &ProcessingRecord, doc: &Document) -> Result<()> {
        self.reporter.report(PipelineEvent::Stage {
            file: doc.file_name.clone(),
            stage: "classifying",
        });
        let classifier = Classifier::new(&self.config, &self.pool);
        match classifier
            .classify(std::path::Path::new(&doc.staging_path))
            .await?
        {
            ClassifyOutcome::Ready(c) => {
                db::update_classification(
                    &self.pool,
                    &doc.id,
                    c.doc_type,
                    c.confidence,
                    c.entity.as_ref().map(|e| e.name.as_str()),
                    c.entity.as_ref().map(|e| e.kind.as_str()),
                )
                .await?;
                self.tracker
                    .transition(&record.id, ProcState::Classified, None)
                    .await?;
            }
            ClassifyOutcome::NeedsReview {
                classification,
                reason,
            } => {
                // Keep the best classification reached, for the review view.
                db::update_classification(
                    &self.pool,
                    &doc.id,
                    classification.doc_type,
                    classification.confidence,
                    classification.entity.as_ref().map(|e| e.name.as_str()),
                    classification.entity.as_ref().map(|e| e.kind.as_str()),
                )
                .await?;
                self.tracker
                    .transition(&record.id, ProcState::NeedsReview, Some(&reason))
                    .await?;
                self.reporter.report(PipelineEvent::Parked {
                    file: doc.file_name.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn step_route(&self, record: &ProcessingRecord, doc: &Document) -> Result<()> {
        self.reporter.report(PipelineEvent::Stage {
            file: doc.file_name.clone(),
            stage: "routing",
        });
        let destination = {
            let _guard = self.route_lock.lock().await;
            router::route(&self.pool, &self.config, doc).await?
        };
        tracing::info!(file = %doc.file_name, destination = %destination, "routed");
        self.tracker
            .transition(&record.id, ProcState::Routed, None)
            .await?;
        Ok(())
    }

    async fn step_deliver(&self, record: &ProcessingRecord, doc: &Document) -> Result<()> {
        self.reporter.report(PipelineEvent::Stage {
            file: doc.file_name.clone(),
            stage: "delivering",
        });
        let delivery = sync::deliver(&self.config, &self.pool, doc).await?;

        // The move has committed; mark the document record archived and the
        // state terminal.
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE documents SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(&doc.id)
            .execute(&self.pool)
            .await?;
        self.tracker
            .transition(&record.id, ProcState::Delivered, None)
            .await?;

        self.reporter.report(PipelineEvent::Delivered {
            file: doc.file_name.clone(),
            destination: delivery.destination,
            actions: delivery.actions,
        });
        Ok(())
    }
}

/// `desk watch`: run the watcher and worker pool until interrupted or a
/// blocking condition halts intake.
pub async fn run_watch(config: &Config, mode: ReportMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let agent: Arc<dyn EnrichmentAgent> = Arc::new(CommandAgent::from_config(config));
    let pipeline = Pipeline::new(config.clone(), pool.clone(), agent, mode.reporter());

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<ReadyDoc>(256);

    // Workers first: resume can outgrow the channel buffer.
    let workers = pipeline.spawn_workers(
        config.enrich.concurrency,
        SharedReceiver::new(rx),
        cancel.clone(),
    );

    let resumed = pipeline.resume_pending(&tx).await?;
    if resumed > 0 {
        tracing::info!(count = resumed, "resumed in-flight documents");
    }

    let watcher = Watcher::new(config.clone(), pool.clone())?;
    let mut watcher_task = tokio::spawn(watcher.run(tx, cancel.clone()));

    let watcher_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; cancelling in-flight work");
            None
        }
        result = &mut watcher_task => Some(result),
    };

    cancel.cancel();
    if watcher_result.is_none() {
        let _ = watcher_task.await;
    }
    for worker in workers {
        let _ = worker.await;
    }
    pool.close().await;

    if let Some(result) = watcher_result {
        // A watcher that returns on its own did so because intake is blocked.
        result.context("watcher task panicked")??;
    }
    Ok(())
}

/// `desk process`: one-shot run over everything currently in the holding
/// area plus any resumable records, then exit.
pub async fn run_process(config: &Config, mode: ReportMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let agent: Arc<dyn EnrichmentAgent> = Arc::new(CommandAgent::from_config(config));
    let pipeline = Pipeline::new(config.clone(), pool.clone(), agent, mode.reporter());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = mpsc::channel::<ReadyDoc>(256);
    let workers = pipeline.spawn_workers(
        config.enrich.concurrency,
        SharedReceiver::new(rx),
        cancel.clone(),
    );

    let resumed = pipeline.resume_pending(&tx).await?;

    let mut watcher = Watcher::new(config.clone(), pool.clone())?;
    let discovered = watcher.discover_now().await?;
    let found = discovered.len();
    for doc in discovered {
        tx.send(doc).await.ok();
    }
    drop(tx);

    for worker in workers {
        worker.await?;
    }

    let delivered: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing_records WHERE state = 'delivered'",
    )
    .fetch_one(&pool)
    .await?;
    let parked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processing_records WHERE state = 'needs_review'")
            .fetch_one(&pool)
            .await?;

    println!("process");
    println!("  discovered: {}", found);
    println!("  resumed: {}", resumed);
    println!("  delivered (total): {}", delivered);
    println!("  needs review (total): {}", parked);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `desk retry <document>`: requeue a parked document. Matches by document id
/// prefix or by file name; re-enters the pipeline at `classified` with a
/// fresh enrichment retry budget.
pub async fn run_retry(config: &Config, needle: &str, mode: ReportMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let tracker = Tracker::new(pool.clone());

    let row = sqlx::query(
        r#"
        SELECT d.* FROM documents d
        JOIN processing_records r ON r.document_id = d.id
        WHERE r.state = 'needs_review' AND (d.id LIKE ? OR d.file_name = ?)
        "#,
    )
    .bind(format!("{}%", needle))
    .bind(needle)
    .fetch_optional(&pool)
    .await?;
    let doc = match row {
        Some(row) => db::document_from_row(&row),
        None => anyhow::bail!("no document needing review matches '{}'", needle),
    };

    let record = tracker
        .get_by_document(&doc.id)
        .await?
        .with_context(|| format!("no processing record for document {}", doc.id))?;

    tracker
        .reset_retries(&record.id, RetryStep::Enrich)
        .await?;
    tracker
        .transition(&record.id, ProcState::Classified, Some("user retry"))
        .await?;

    let agent: Arc<dyn EnrichmentAgent> = Arc::new(CommandAgent::from_config(config));
    let pipeline = Pipeline::new(config.clone(), pool.clone(), agent, mode.reporter());
    let cancel = CancellationToken::new();
    let job = ReadyDoc {
        record_id: record.id.clone(),
        document_id: doc.id.clone(),
        file_name: doc.file_name.clone(),
    };
    if let Err(e) = pipeline.process_record(&job, &cancel).await {
        let reason = format!("{:#}", e);
        let _ = tracker
            .transition(&record.id, ProcState::NeedsReview, Some(&reason))
            .await;
        anyhow::bail!("retry failed: {}", reason);
    }

    let final_state = tracker.get(&record.id).await?.state;
    println!("retry {}", doc.file_name);
    println!("  state: {}", final_state.as_str());
    println!("ok");

    pool.close().await;
    Ok(())
}
