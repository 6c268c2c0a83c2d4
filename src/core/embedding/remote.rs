//! Remote embedding backend (Ollama wire).
//!
//! Wire contract: POST `<base_url>/api/embeddings` with
//! `{"model": ..., "prompt": ...}`, one text per request, returning
//! `{"embedding": [...]}`. The dimension of a model is introspected once by
//! probing with a sentinel string and cached.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::{EmbeddingBackend, EmbeddingError, ModelInfo, Result};

/// Probe text used for dimension introspection.
const DIMENSION_PROBE: &str = "dimension probe";

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

pub struct RemoteEmbedBackend {
    base_url: String,
    client: Client,
    dimensions: Mutex<HashMap<String, usize>>,
}

impl RemoteEmbedBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into(),
            client,
            dimensions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn embed_one(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "prompt": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api(format!(
                "embedding request failed with {}: {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = resp.json().await?;
        parsed.embedding.filter(|e| !e.is_empty()).ok_or_else(|| {
            EmbeddingError::InvalidResponse("response missing embedding field".to_string())
        })
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbedBackend {
    async fn encode(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        // The wire has no batch form; requests go out one at a time.
        let mut embeddings = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let embedding = self.embed_one(text, model).await?;
            embeddings.push(embedding);

            if (i + 1) % 10 == 0 || i + 1 == texts.len() {
                tracing::debug!(model, done = i + 1, total = texts.len(), "remote encoding");
            }
        }

        if let Some(first) = embeddings.first() {
            self.dimensions
                .lock()
                .await
                .entry(model.to_string())
                .or_insert(first.len());
        }
        Ok(embeddings)
    }

    async fn dimension(&self, model: &str) -> Result<usize> {
        if let Some(dim) = self.dimensions.lock().await.get(model) {
            return Ok(*dim);
        }

        let probe = self.embed_one(DIMENSION_PROBE, model).await?;
        let dim = probe.len();
        self.dimensions.lock().await.insert(model.to_string(), dim);
        Ok(dim)
    }

    async fn unload(&self, _model: Option<&str>) {
        // The remote host owns its model memory.
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(EmbeddingError::Api(format!(
                "model listing failed with {}",
                resp.status()
            )));
        }

        let tags: TagsResponse = resp.json().await?;
        let dimensions = self.dimensions.lock().await;
        Ok(tags
            .models
            .into_iter()
            .filter(|m| m.name.to_lowercase().contains("embed"))
            .map(|m| ModelInfo {
                dimension: dimensions.get(&m.name).copied(),
                name: m.name,
                provider: "remote".to_string(),
            })
            .collect())
    }
}
