//! Schema creation. Every statement is idempotent, so `taskh init` can run
//! against an existing database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parent_id TEXT,
            item_order INTEGER NOT NULL DEFAULT 0,
            is_shared INTEGER NOT NULL DEFAULT 0,
            is_favorite INTEGER NOT NULL DEFAULT 0,
            is_inbox_project INTEGER NOT NULL DEFAULT 0,
            is_team_inbox INTEGER NOT NULL DEFAULT 0,
            view_style TEXT NOT NULL DEFAULT 'list',
            url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical task rows, one per source task id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            content TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0,
            due_json TEXT,
            is_completed INTEGER NOT NULL DEFAULT 0,
            labels_json TEXT NOT NULL DEFAULT '[]',
            parent_id TEXT,
            section_id TEXT,
            assignee_id TEXT,
            item_order INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            url TEXT,
            created_at TEXT,
            synced_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enriched_tasks (
            task_id TEXT PRIMARY KEY,
            task_json TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            analysis_json TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            index_document_id TEXT,
            embedding_model TEXT,
            last_updated TEXT,
            processed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_vectors (
            doc_id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL UNIQUE,
            project_id TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            due_date TEXT,
            is_completed INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_enriched_tasks_processed_at ON enriched_tasks(processed_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_vectors_project_id ON task_vectors(project_id)")
        .execute(pool)
        .await?;

    Ok(())
}
