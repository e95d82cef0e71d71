//! Repository and index overview for `taskh status`.
//!
//! Gives confidence that syncs are landing: row counts, how many tasks
//! carry a live vector, and when the last enrichment happened.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::repository::SqliteTaskRepository;
use crate::vector_index::{SqliteVectorIndex, VectorIndexAdapter};

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = SqliteTaskRepository::new(pool.clone()).stats().await?;
    let index = VectorIndexAdapter::new(
        Arc::new(SqliteVectorIndex::new(pool)),
        Duration::from_secs(config.ingest.call_timeout_secs),
    );
    let vectors = index.document_count().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Task Harness — Status");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Source:      {}", config.source.provider);
    println!("  Enrichment:  {}", config.enrichment.provider);
    println!();
    println!("  Projects:    {}", stats.projects);
    println!("  Tasks:       {}", stats.tasks);
    println!(
        "  Enriched:    {} / {} ({}%)",
        stats.enriched,
        stats.tasks,
        percent(stats.enriched, stats.tasks)
    );
    println!("  Vectors:     {}", vectors);
    println!(
        "  Last run:    {}",
        stats.last_processed_at.as_deref().unwrap_or("never")
    );
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_percent_of_empty_is_zero() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(3, 4), 75);
    }
}
