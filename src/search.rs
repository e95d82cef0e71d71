//! Semantic search over indexed tasks.
//!
//! The query is embedded with the configured enrichment gateway, so it
//! lives in the same vector space as the indexed tasks, then ranked by
//! cosine similarity inside the vector index.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use task_harness_core::models::Priority;
use task_harness_core::store::{SearchFilters, SearchHit};
use task_harness_core::SyncResult;

use crate::config::Config;
use crate::db;
use crate::enrichment::{create_gateway, EnrichmentGateway};
use crate::retry::with_timeout;
use crate::vector_index::{SqliteVectorIndex, VectorIndexAdapter};

/// Options for `taskh search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub project_id: Option<String>,
    pub min_priority: Option<u8>,
    pub include_completed: bool,
}

impl SearchOptions {
    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            project_id: self.project_id.clone(),
            min_priority: self.min_priority.map(|p| Priority::from_source(i64::from(p))),
            include_completed: self.include_completed,
        }
    }
}

/// Embed `query` and return the top `limit` hits.
pub async fn search_tasks(
    gateway: &dyn EnrichmentGateway,
    index: &VectorIndexAdapter,
    call_timeout: Duration,
    query: &str,
    limit: usize,
    filters: &SearchFilters,
) -> SyncResult<Vec<SearchHit>> {
    let embedding = with_timeout("embed query", call_timeout, gateway.embed_query(query)).await?;
    index.search(&embedding.vector, limit, filters).await
}

pub async fn run_search(config: &Config, query: &str, options: &SearchOptions) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let pool = db::connect(config).await?;
    let call_timeout = Duration::from_secs(config.ingest.call_timeout_secs);
    let gateway: Arc<dyn EnrichmentGateway> = Arc::from(create_gateway(&config.enrichment)?);
    let index = VectorIndexAdapter::new(Arc::new(SqliteVectorIndex::new(pool)), call_timeout);

    let hits = search_tasks(
        gateway.as_ref(),
        &index,
        call_timeout,
        query,
        options.limit,
        &options.filters(),
    )
    .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.score,
            hit.text.lines().next().unwrap_or_default()
        );
        println!("    task: {}  project: {}", hit.task_id, hit.project_id);
        println!("    priority: {}", hit.priority.level());
        if let Some(due) = &hit.due_date {
            println!("    due: {}", due);
        }
        if hit.is_completed {
            println!("    completed");
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::HashGateway;
    use task_harness_core::models::Task;
    use task_harness_core::store::memory::InMemoryVectorIndex;

    async fn indexed(tasks: &[Task]) -> (HashGateway, VectorIndexAdapter) {
        let gateway = HashGateway::new(256);
        let index = VectorIndexAdapter::new(
            Arc::new(InMemoryVectorIndex::new()),
            Duration::from_secs(5),
        );
        for task in tasks {
            let enrichment = gateway.enrich(task).await.unwrap();
            index
                .upsert(task, &enrichment.embedding, task.fingerprint())
                .await
                .unwrap();
        }
        (gateway, index)
    }

    #[tokio::test]
    async fn test_search_ranks_matching_task_first() {
        let tasks = vec![
            Task::new("t1", "p1", "Buy milk"),
            Task::new("t2", "p1", "Renew passport at the embassy"),
        ];
        let (gateway, index) = indexed(&tasks).await;

        let hits = search_tasks(
            &gateway,
            &index,
            Duration::from_secs(5),
            "Buy milk",
            5,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
        assert_eq!(hits[0].task_id, "t1");
    }

    #[tokio::test]
    async fn test_completed_tasks_hidden_by_default() {
        let mut done = Task::new("t1", "p1", "Buy milk");
        done.is_completed = true;
        let (gateway, index) = indexed(&[done]).await;

        let hidden = search_tasks(
            &gateway,
            &index,
            Duration::from_secs(5),
            "milk",
            5,
            &SearchOptions::default().filters(),
        )
        .await
        .unwrap();
        assert!(hidden.is_empty());

        let options = SearchOptions {
            include_completed: true,
            ..Default::default()
        };
        let shown = search_tasks(
            &gateway,
            &index,
            Duration::from_secs(5),
            "milk",
            5,
            &options.filters(),
        )
        .await
        .unwrap();
        assert_eq!(shown.len(), 1);
    }
}
