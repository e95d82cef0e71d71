//! # Task Harness
//!
//! Incremental task ingestion and semantic indexing.
//!
//! Task Harness pulls projects and tasks from a task manager, detects which
//! tasks changed since the last run by content fingerprint, enriches the
//! changed ones (embedding plus optional analysis), keeps exactly one live
//! vector per task in the index, and persists the results in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌────────────┐
//! │ TaskSource  │──▶│ IngestionCoordinator │──▶│   SQLite   │
//! │ Todoist/File│   │ fingerprint → enrich │   │ tasks+vecs │
//! └─────────────┘   │ → upsert → store     │   └─────┬──────┘
//!                   └──────────────────────┘         │
//!                      ┌─────────────────────────────┤
//!                      ▼                             ▼
//!                 ┌──────────┐                 ┌──────────┐
//!                 │   CLI    │                 │   HTTP   │
//!                 │ (taskh)  │                 │  (axum)  │
//!                 └──────────┘                 └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! taskh init                  # create database
//! taskh sync                  # one ingestion run
//! taskh sync --dry-run        # what would change
//! taskh search "groceries"
//! taskh serve                 # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`source`] | Task sources (Todoist API, JSON export) |
//! | [`enrichment`] | Enrichment gateways (OpenAI, Ollama, hash) |
//! | [`vector_index`] | Delete-then-insert vector replacement |
//! | [`processor`] | Per-task change detection |
//! | [`ingest`] | Run orchestration and summaries |
//! | [`lock`] | Single-flight lock and phase tracking |
//! | [`retry`] | Backoff and call deadlines |
//! | [`repository`] | SQLite task repository |
//! | [`search`] | Semantic search |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod enrichment;
pub mod ingest;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod processor;
pub mod progress;
pub mod repository;
pub mod retry;
pub mod search;
pub mod server;
pub mod source;
pub mod status;
pub mod vector_index;
