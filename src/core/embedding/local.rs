//! Local transformer embedding backend (candle).
//!
//! Loads BERT-style safetensors models from `<model_dir>/<model>/`
//! (config.json + tokenizer.json + model.safetensors) onto CUDA when
//! available, caches them by name, and encodes in batches with
//! attention-mask mean pooling. Output vectors are L2-normalized, which the
//! distance-to-similarity conversion in retrieval depends on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

use super::{EmbeddingBackend, EmbeddingError, ModelInfo, Result};

/// Fallback token cap when config.json does not carry one.
const DEFAULT_MAX_TOKENS: usize = 512;

/// The subset of an HF config.json this backend reads directly. The full
/// config is handed to candle separately.
#[derive(Debug, Deserialize)]
struct HfConfig {
    hidden_size: usize,
    #[serde(default)]
    max_position_embeddings: Option<usize>,
}

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    dimension: usize,
    max_tokens: usize,
    device: Device,
}

impl LoadedModel {
    fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config_text = std::fs::read_to_string(dir.join("config.json"))?;
        let hf: HfConfig = serde_json::from_str(&config_text)
            .map_err(|e| EmbeddingError::Model(format!("bad config.json: {}", e)))?;
        let config: Config = serde_json::from_str(&config_text)
            .map_err(|e| EmbeddingError::Model(format!("unsupported model config: {}", e)))?;

        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| EmbeddingError::Model(format!("failed to load tokenizer: {}", e)))?;

        let weights = dir.join("model.safetensors");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DTYPE, device) }
            .map_err(|e| EmbeddingError::Model(format!("failed to map weights: {}", e)))?;
        let model = BertModel::load(vb, &config)
            .map_err(|e| EmbeddingError::Model(format!("failed to build model: {}", e)))?;

        Ok(Self {
            model,
            tokenizer,
            dimension: hf.hidden_size,
            max_tokens: hf.max_position_embeddings.unwrap_or(DEFAULT_MAX_TOKENS),
            device: device.clone(),
        })
    }

    /// Encode one batch: tokenize with manual padding, forward, mean-pool
    /// under the attention mask, L2-normalize.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut token_rows: Vec<Vec<u32>> = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| EmbeddingError::Model(format!("tokenization failed: {}", e)))?;
            let mut ids = encoding.get_ids().to_vec();
            ids.truncate(self.max_tokens);
            token_rows.push(ids);
        }

        let batch = token_rows.len();
        let max_len = token_rows.iter().map(Vec::len).max().unwrap_or(1).max(1);

        let mut ids_flat = Vec::with_capacity(batch * max_len);
        let mut mask_flat = Vec::with_capacity(batch * max_len);
        for row in &token_rows {
            ids_flat.extend_from_slice(row);
            ids_flat.extend(std::iter::repeat(0u32).take(max_len - row.len()));
            mask_flat.extend(std::iter::repeat(1u32).take(row.len()));
            mask_flat.extend(std::iter::repeat(0u32).take(max_len - row.len()));
        }

        let to_model = |e: candle_core::Error| EmbeddingError::Model(e.to_string());

        let input_ids =
            Tensor::from_vec(ids_flat, (batch, max_len), &self.device).map_err(to_model)?;
        let attention_mask =
            Tensor::from_vec(mask_flat, (batch, max_len), &self.device).map_err(to_model)?;
        let token_type_ids = input_ids.zeros_like().map_err(to_model)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(to_model)?;

        // Mean pooling over real tokens only.
        let mask = attention_mask
            .to_dtype(DTYPE)
            .map_err(to_model)?
            .unsqueeze(2)
            .map_err(to_model)?;
        let summed = hidden
            .broadcast_mul(&mask)
            .map_err(to_model)?
            .sum(1)
            .map_err(to_model)?;
        let counts = mask.sum(1).map_err(to_model)?;
        let mean = summed.broadcast_div(&counts).map_err(to_model)?;

        let norm = mean
            .sqr()
            .map_err(to_model)?
            .sum_keepdim(1)
            .map_err(to_model)?
            .sqrt()
            .map_err(to_model)?;
        let normalized = mean.broadcast_div(&norm).map_err(to_model)?;

        normalized.to_vec2::<f32>().map_err(to_model)
    }
}

pub struct LocalTransformerBackend {
    model_dir: PathBuf,
    batch_size: usize,
    device: Device,
    cache: Mutex<HashMap<String, Arc<LoadedModel>>>,
}

impl LocalTransformerBackend {
    pub fn new(model_dir: PathBuf, batch_size: usize) -> Self {
        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        Self {
            model_dir,
            batch_size: batch_size.max(1),
            device,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn model(&self, name: &str) -> Result<Arc<LoadedModel>> {
        let mut cache = self.cache.lock().await;
        if let Some(model) = cache.get(name) {
            return Ok(model.clone());
        }

        let dir = self.model_dir.join(name);
        if !dir.join("config.json").exists() {
            return Err(EmbeddingError::Model(format!(
                "no local model at {}",
                dir.display()
            )));
        }

        let device = self.device.clone();
        let loaded = tokio::task::spawn_blocking(move || LoadedModel::load(&dir, &device))
            .await
            .map_err(|e| EmbeddingError::Model(format!("model load task failed: {}", e)))??;

        let loaded = Arc::new(loaded);
        cache.insert(name.to_string(), loaded.clone());
        tracing::info!(model = name, dimension = loaded.dimension, "local embedding model loaded");
        Ok(loaded)
    }

    fn read_dimension(&self, name: &str) -> Result<usize> {
        let config_text = std::fs::read_to_string(self.model_dir.join(name).join("config.json"))?;
        let hf: HfConfig = serde_json::from_str(&config_text)
            .map_err(|e| EmbeddingError::Model(format!("bad config.json: {}", e)))?;
        Ok(hf.hidden_size)
    }
}

#[async_trait]
impl EmbeddingBackend for LocalTransformerBackend {
    async fn encode(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let loaded = self.model(model).await?;

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let loaded = loaded.clone();
            let batch = batch.to_vec();
            let encoded = tokio::task::spawn_blocking(move || loaded.encode_batch(&batch))
                .await
                .map_err(|e| EmbeddingError::Model(format!("encode task failed: {}", e)))??;
            vectors.extend(encoded);
        }
        Ok(vectors)
    }

    async fn dimension(&self, model: &str) -> Result<usize> {
        if let Some(loaded) = self.cache.lock().await.get(model) {
            return Ok(loaded.dimension);
        }
        self.read_dimension(model)
    }

    async fn unload(&self, model: Option<&str>) {
        let mut cache = self.cache.lock().await;
        match model {
            Some(name) => {
                if cache.remove(name).is_some() {
                    tracing::info!(model = name, "local embedding model unloaded");
                }
            }
            None => {
                if !cache.is_empty() {
                    tracing::info!(count = cache.len(), "all local embedding models unloaded");
                    cache.clear();
                }
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        let entries = match std::fs::read_dir(&self.model_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(models),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.join("config.json").exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            models.push(ModelInfo {
                name: name.to_string(),
                provider: "local".to_string(),
                dimension: self.read_dimension(name).ok(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }
}
