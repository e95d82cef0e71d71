//! # Task Harness Core
//!
//! Runtime-free logic for Task Harness: the task data model, the content
//! fingerprint used for change detection, the sync error taxonomy, the
//! vector index and task repository traits, and in-memory implementations
//! of both stores.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The app crate
//! supplies SQLite-backed stores and network clients on top of it.

pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod store;

pub use error::{SyncError, SyncResult};
pub use fingerprint::Fingerprint;
