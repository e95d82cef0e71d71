//! Enrichment gateways: the single boundary for embedding and analysis calls.
//!
//! An [`EnrichmentGateway`] turns one task into an [`Enrichment`]: an
//! embedding of `"Task: {content}\nDescription: {description}"` plus an
//! optional [`AnalysisResult`]. Gateways make exactly one logical request
//! per call and never retry; retry and backoff belong to the coordinator.
//!
//! | Config value | Gateway | Analysis |
//! |--------------|---------|----------|
//! | `"openai"` | [`OpenAiGateway`] | when `analysis_model` is set |
//! | `"ollama"` | [`OllamaGateway`] | never |
//! | `"hash"` | [`HashGateway`] | never |
//!
//! # Error mapping
//!
//! - HTTP 429, 5xx, connection errors, timeouts → [`SyncError::EnrichmentUnavailable`]
//! - Other HTTP 4xx, blank tasks, embeddings whose length differs from
//!   `enrichment.dims` → [`SyncError::EnrichmentRejected`]

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use task_harness_core::embedding::{hash_embed, Embedding};
use task_harness_core::models::{AnalysisResult, Task};
use task_harness_core::{SyncError, SyncResult};

use crate::config::EnrichmentConfig;

const QUERY_ID: &str = "<query>";

const ANALYSIS_PROMPT: &str = "You are an assistant that analyzes individual tasks. \
Respond with a JSON object with these keys: \
\"category\" (the task category or type), \
\"complexity\" (one of low, medium, high), \
\"themes\" (array of key themes or topics), \
\"dependencies\" (array of prerequisites), \
\"next_actions\" (array of suggested next actions or subtasks).";

/// Output of one enrichment call.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub embedding: Embedding,
    pub analysis: Option<AnalysisResult>,
}

#[async_trait]
pub trait EnrichmentGateway: Send + Sync {
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Embed and analyse one task.
    async fn enrich(&self, task: &Task) -> SyncResult<Enrichment>;

    /// Embed free text, used for search queries.
    async fn embed_query(&self, text: &str) -> SyncResult<Embedding>;
}

/// Reject a task with nothing to embed before spending a network call.
fn ensure_enrichable(task: &Task) -> SyncResult<()> {
    if task.is_blank() {
        return Err(SyncError::EnrichmentRejected {
            task_id: task.id.clone(),
            reason: "task has no content or description".to_string(),
        });
    }
    Ok(())
}

/// Every vector in the index must have the configured dimension.
fn check_dims(task_id: &str, vector: Vec<f32>, expected: usize) -> SyncResult<Vec<f32>> {
    if vector.len() != expected {
        return Err(SyncError::EnrichmentRejected {
            task_id: task_id.to_string(),
            reason: format!(
                "embedding has {} dimensions, expected {expected}",
                vector.len()
            ),
        });
    }
    Ok(vector)
}

fn classify_status(task_id: &str, service: &str, status: StatusCode, body: &str) -> SyncError {
    let reason = format!("{service} API error {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::EnrichmentUnavailable {
            task_id: task_id.to_string(),
            reason,
        }
    } else {
        SyncError::EnrichmentRejected {
            task_id: task_id.to_string(),
            reason,
        }
    }
}

fn unavailable(task_id: &str, reason: impl std::fmt::Display) -> SyncError {
    SyncError::EnrichmentUnavailable {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    }
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// POST a JSON body and return the decoded JSON response, mapping every
/// failure into the enrichment taxonomy.
async fn post_json(
    request: reqwest::RequestBuilder,
    task_id: &str,
    service: &str,
) -> SyncResult<serde_json::Value> {
    let response = request
        .send()
        .await
        .map_err(|e| unavailable(task_id, format!("{service} connection error: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(task_id, service, status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| unavailable(task_id, format!("{service} response unreadable: {e}")))
}

// ============ OpenAI ============

/// Gateway backed by the OpenAI embeddings and chat completions APIs.
///
/// Requires `OPENAI_API_KEY`. `enrichment.url` overrides the API base for
/// OpenAI-compatible servers.
pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    analysis_model: Option<String>,
}

impl OpenAiGateway {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("enrichment.dims required for OpenAI provider"))?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dims,
            analysis_model: config.analysis_model.clone(),
        })
    }

    async fn embed(&self, task_id: &str, text: &str) -> SyncResult<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, task_id, "OpenAI").await?;
        let vector = parse_openai_embedding(&json)
            .ok_or_else(|| unavailable(task_id, "invalid OpenAI response: missing embedding"))?;
        let vector = check_dims(task_id, vector, self.dims)?;
        Ok(Embedding::new(vector, self.model.clone()))
    }

    async fn analyze(&self, task: &Task, model: &str) -> SyncResult<Option<AnalysisResult>> {
        let body = serde_json::json!({
            "model": model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": ANALYSIS_PROMPT },
                { "role": "user", "content": task.embedding_text() },
            ],
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, &task.id, "OpenAI").await?;

        let analysis = parse_analysis(&json);
        if analysis.is_none() {
            tracing::warn!(task_id = %task.id, "analysis response could not be parsed; continuing without it");
        }
        Ok(analysis)
    }
}

#[async_trait]
impl EnrichmentGateway for OpenAiGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn enrich(&self, task: &Task) -> SyncResult<Enrichment> {
        ensure_enrichable(task)?;
        let embedding = self.embed(&task.id, &task.embedding_text()).await?;
        let analysis = match &self.analysis_model {
            Some(model) => self.analyze(task, model).await?,
            None => None,
        };
        Ok(Enrichment {
            embedding,
            analysis,
        })
    }

    async fn embed_query(&self, text: &str) -> SyncResult<Embedding> {
        self.embed(QUERY_ID, text).await
    }
}

fn parse_openai_embedding(json: &serde_json::Value) -> Option<Vec<f32>> {
    let embedding = json
        .get("data")?
        .as_array()?
        .first()?
        .get("embedding")?
        .as_array()?;
    Some(
        embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect(),
    )
}

/// Extract the analysis object from a chat completion response.
fn parse_analysis(json: &serde_json::Value) -> Option<AnalysisResult> {
    let content = json
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()?;
    serde_json::from_str(content).ok()
}

// ============ Ollama ============

/// Gateway backed by a local Ollama instance's `POST /api/embed`.
pub struct OllamaGateway {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaGateway {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("enrichment.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }

    async fn embed(&self, task_id: &str, text: &str) -> SyncResult<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = post_json(request, task_id, "Ollama").await?;
        let vector = parse_ollama_embedding(&json).ok_or_else(|| {
            unavailable(task_id, "invalid Ollama response: missing embeddings array")
        })?;
        let vector = check_dims(task_id, vector, self.dims)?;
        Ok(Embedding::new(vector, self.model.clone()))
    }
}

#[async_trait]
impl EnrichmentGateway for OllamaGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn enrich(&self, task: &Task) -> SyncResult<Enrichment> {
        ensure_enrichable(task)?;
        Ok(Enrichment {
            embedding: self.embed(&task.id, &task.embedding_text()).await?,
            analysis: None,
        })
    }

    async fn embed_query(&self, text: &str) -> SyncResult<Embedding> {
        self.embed(QUERY_ID, text).await
    }
}

fn parse_ollama_embedding(json: &serde_json::Value) -> Option<Vec<f32>> {
    let first = json.get("embeddings")?.as_array()?.first()?.as_array()?;
    Some(first.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ Hash ============

/// Offline gateway producing deterministic feature-hashed embeddings.
pub struct HashGateway {
    model: String,
    dims: usize,
}

impl HashGateway {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-fnv1a-{dims}"),
            dims,
        }
    }
}

#[async_trait]
impl EnrichmentGateway for HashGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn enrich(&self, task: &Task) -> SyncResult<Enrichment> {
        ensure_enrichable(task)?;
        Ok(Enrichment {
            embedding: Embedding::new(
                hash_embed(&task.embedding_text(), self.dims),
                self.model.clone(),
            ),
            analysis: None,
        })
    }

    async fn embed_query(&self, text: &str) -> SyncResult<Embedding> {
        Ok(Embedding::new(hash_embed(text, self.dims), self.model.clone()))
    }
}

/// Instantiate the gateway named by `enrichment.provider`.
pub fn create_gateway(config: &EnrichmentConfig) -> Result<Box<dyn EnrichmentGateway>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiGateway::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGateway::new(config)?)),
        "hash" => Ok(Box::new(HashGateway::new(config.dims_or_default()))),
        other => bail!("Unknown enrichment provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = classify_status("t1", "OpenAI", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, SyncError::EnrichmentUnavailable { .. }));
        assert!(err.is_retryable());

        let err = classify_status("t1", "OpenAI", StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, SyncError::EnrichmentUnavailable { .. }));

        let err = classify_status("t1", "OpenAI", StatusCode::BAD_REQUEST, "too long");
        assert!(matches!(err, SyncError::EnrichmentRejected { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        assert_eq!(check_dims("t1", vec![0.1, 0.2], 2).unwrap(), vec![0.1, 0.2]);

        let err = check_dims("t1", vec![0.1, 0.2, 0.3], 2).unwrap_err();
        assert!(matches!(err, SyncError::EnrichmentRejected { ref task_id, .. } if task_id == "t1"));
        assert!(err.to_string().contains("expected 2"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_openai_embedding() {
        let json = serde_json::json!({ "data": [{ "index": 0, "embedding": [0.5, -1.0] }] });
        assert_eq!(parse_openai_embedding(&json), Some(vec![0.5, -1.0]));
        assert_eq!(parse_openai_embedding(&serde_json::json!({})), None);
    }

    #[test]
    fn test_parse_ollama_embedding() {
        let json = serde_json::json!({ "embeddings": [[1.0, 2.0, 3.0]] });
        assert_eq!(parse_ollama_embedding(&json), Some(vec![1.0, 2.0, 3.0]));
        assert_eq!(parse_ollama_embedding(&serde_json::json!({ "embeddings": [] })), None);
    }

    #[test]
    fn test_parse_analysis() {
        let content = r#"{"category":"errand","complexity":"low","themes":["shopping"]}"#;
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        });
        let analysis = parse_analysis(&json).unwrap();
        assert_eq!(analysis.category, "errand");
        assert_eq!(analysis.themes, vec!["shopping"]);
        assert!(analysis.next_actions.is_empty());

        let garbled = serde_json::json!({
            "choices": [{ "message": { "content": "not json at all" } }]
        });
        assert_eq!(parse_analysis(&garbled), None);
    }

    #[tokio::test]
    async fn test_hash_gateway_rejects_blank_task() {
        let gateway = HashGateway::new(16);
        let err = gateway.enrich(&Task::new("t1", "p1", "  ")).await.unwrap_err();
        assert!(matches!(err, SyncError::EnrichmentRejected { ref task_id, .. } if task_id == "t1"));
    }

    #[tokio::test]
    async fn test_hash_gateway_embeds_task_text() {
        let gateway = HashGateway::new(32);
        let task = Task::new("t1", "p1", "Buy milk");
        let enrichment = gateway.enrich(&task).await.unwrap();
        assert_eq!(enrichment.embedding.dims(), 32);
        assert_eq!(enrichment.embedding.model, "hash-fnv1a-32");
        assert_eq!(
            enrichment.embedding.vector,
            hash_embed(&task.embedding_text(), 32)
        );
        assert!(enrichment.analysis.is_none());
    }

    #[test]
    fn test_create_gateway_hash_default_dims() {
        let gateway = create_gateway(&EnrichmentConfig::default()).unwrap();
        assert_eq!(gateway.dims(), 256);
    }
}
