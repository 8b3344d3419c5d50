//! # Deskflow
//!
//! A local-first document intake, enrichment, and filing pipeline.
//!
//! Deskflow watches a holding area for loosely-structured documents (meeting
//! transcripts, notes, reports), classifies them, enriches them through an
//! external agent subprocess, and files them into a durable PARA structure —
//! while keeping a fast SQLite index of extracted commitments ("actions")
//! reconciled with the checklist rendered into each delivered document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────────┐   ┌────────┐   ┌────────────┐   ┌──────────────┐
//! │ Watcher │──▶│ Classifier │──▶│ Router │──▶│ Enrichment │──▶│ Synchronizer │
//! │ Inbox/  │   │ type+entity│   │  PARA  │   │ subprocess │   │ DB+checklist │
//! └─────────┘   └────────────┘   └────────┘   └────────────┘   └──────┬───────┘
//!                                                                     │
//!                      processing_records (state machine) ◀───────────┘
//!                      every step is idempotent and resumable
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! desk init                     # create workspace + database
//! desk watch                    # process files as they land in Inbox/
//! desk process                  # one-shot run over the holding area
//! desk status                   # what is the pipeline doing?
//! desk reconcile                # merge checklist edits with the database
//! desk actions list --status pending
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`watcher`] | Holding-area stability watcher |
//! | [`classifier`] | Type/entity classification with research fallback |
//! | [`router`] | PARA destination routing |
//! | [`enrich`] | Enrichment directive, subprocess, payload validation |
//! | [`sync`] | Action delivery and checklist reconciliation |
//! | [`tracker`] | Persisted per-document state machine |
//! | [`pipeline`] | Worker pool and command entry points |
//! | [`db`] | Database connection and migrations |

pub mod actions;
pub mod classifier;
pub mod config;
pub mod db;
pub mod enrich;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod router;
pub mod status;
pub mod sync;
pub mod tracker;
pub mod watcher;
