//! Local chat backend (candle, quantized GGUF weights).
//!
//! Owns a single accelerator context with one active model slot: switching
//! models unloads the previous one, and loading an already-loaded model is
//! a no-op. Generation holds the slot lock, serializing concurrent
//! requests onto the one device. The generation loop awaits on the output
//! channel between tokens, which both paces the producer and yields to the
//! runtime; the end-to-end deadline produces the canned timeout payload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;
use tokio::sync::{mpsc, Mutex};

use super::super::{
    generation_timeout_secs, timeout_message, ChatBackend, ChatMessage, LlmError, LlmModelInfo,
    MessageRole, Result,
};

/// Sampling seed; generation is reproducible given model and prompt.
const SAMPLE_SEED: u64 = 299792458;

struct LoadedLlm {
    name: String,
    model: ModelWeights,
    tokenizer: Tokenizer,
    eos_token: Option<u32>,
}

pub struct LocalLlmBackend {
    models_dir: PathBuf,
    quantization: String,
    device: Device,
    /// The single active model slot.
    slot: Arc<Mutex<Option<LoadedLlm>>>,
}

impl LocalLlmBackend {
    pub fn new(models_dir: PathBuf, quantization: impl Into<String>) -> Self {
        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        Self {
            models_dir,
            quantization: quantization.into(),
            device,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve the GGUF file for a model: `model-<quant>.gguf` first, then
    /// plain `model.gguf`.
    fn weights_path(&self, model: &str) -> Result<PathBuf> {
        let dir = self.models_dir.join(model);
        let quantized = dir.join(format!("model-{}.gguf", self.quantization));
        if quantized.exists() {
            return Ok(quantized);
        }
        let plain = dir.join("model.gguf");
        if plain.exists() {
            return Ok(plain);
        }
        Err(LlmError::Model(format!(
            "no GGUF weights for {} under {}",
            model,
            dir.display()
        )))
    }

    fn load_model(&self, model: &str) -> Result<LoadedLlm> {
        let weights_path = self.weights_path(model)?;
        let tokenizer_path = self.models_dir.join(model).join("tokenizer.json");

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| LlmError::Model(format!("failed to load tokenizer: {}", e)))?;

        let mut file = std::fs::File::open(&weights_path)?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| LlmError::Model(format!("failed to read GGUF: {}", e)))?;
        let weights = ModelWeights::from_gguf(content, &mut file, &self.device)
            .map_err(|e| LlmError::Model(format!("failed to load weights: {}", e)))?;

        let eos_token = ["</s>", "<|im_end|>", "<|endoftext|>", "<|eot_id|>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));

        tracing::info!(model, path = %weights_path.display(), "local LLM loaded");
        Ok(LoadedLlm {
            name: model.to_string(),
            model: weights,
            tokenizer,
            eos_token,
        })
    }

    /// Ensure the slot holds `model`. Loading an already-loaded model is a
    /// no-op; a different model replaces (and thereby unloads) the previous
    /// occupant before the new weights are mapped.
    async fn ensure_loaded(&self, model: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|m| m.name.as_str()) == Some(model) {
            return Ok(());
        }

        if let Some(previous) = slot.take() {
            tracing::info!(model = %previous.name, "unloading previous local LLM");
            drop(previous);
        }

        *slot = Some(self.load_model(model)?);
        Ok(())
    }

    /// Render messages into a chat-template prompt.
    fn build_prompt(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for message in messages {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", role, message.content));
        }
        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }

    /// Run the token loop, sending incremental text through `tx`. Returns
    /// early when the consumer hangs up or the deadline fires.
    async fn generate(
        slot: Arc<Mutex<Option<LoadedLlm>>>,
        device: Device,
        prompt: String,
        temperature: f32,
        max_tokens: u32,
        deadline: Duration,
        tx: mpsc::Sender<Result<String>>,
    ) {
        let started = Instant::now();
        let mut guard = slot.lock().await;
        let Some(loaded) = guard.as_mut() else {
            let _ = tx
                .send(Err(LlmError::Model("no model loaded in slot".into())))
                .await;
            return;
        };

        let to_model = |e: candle_core::Error| LlmError::Model(e.to_string());

        let encoding = match loaded.tokenizer.encode(prompt.as_str(), true) {
            Ok(encoding) => encoding,
            Err(e) => {
                let _ = tx
                    .send(Err(LlmError::Model(format!("tokenization failed: {}", e))))
                    .await;
                return;
            }
        };
        let prompt_tokens = encoding.get_ids().to_vec();

        let temperature = if temperature <= 0.0 {
            None
        } else {
            Some(temperature as f64)
        };
        let mut sampler = LogitsProcessor::new(SAMPLE_SEED, temperature, None);

        // Prompt pass.
        let first = Tensor::new(prompt_tokens.as_slice(), &device)
            .and_then(|t| t.unsqueeze(0))
            .and_then(|t| loaded.model.forward(&t, 0))
            .and_then(|t| t.squeeze(0))
            .map_err(to_model)
            .and_then(|logits| sampler.sample(&logits).map_err(to_model));

        let mut next = match first {
            Ok(token) => token,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut generated: Vec<u32> = Vec::new();
        let mut emitted_chars = 0usize;

        for index in 0..max_tokens as usize {
            if started.elapsed() > deadline {
                tracing::warn!("local generation deadline hit");
                let _ = tx.send(Ok(timeout_message())).await;
                return;
            }
            if Some(next) == loaded.eos_token {
                break;
            }
            generated.push(next);

            // Decode the whole sequence and emit only the stable suffix;
            // this keeps multi-byte tokens intact.
            match loaded.tokenizer.decode(&generated, true) {
                Ok(text) => {
                    let fragment: String = text.chars().skip(emitted_chars).collect();
                    if !fragment.is_empty() {
                        emitted_chars = text.chars().count();
                        if tx.send(Ok(fragment)).await.is_err() {
                            // Consumer hung up; abandon generation.
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(LlmError::Model(format!("decode failed: {}", e))))
                        .await;
                    return;
                }
            }

            let step = Tensor::from_vec(vec![next], 1, &device)
                .and_then(|t| t.unsqueeze(0))
                .and_then(|t| loaded.model.forward(&t, prompt_tokens.len() + index))
                .and_then(|t| t.squeeze(0))
                .map_err(to_model)
                .and_then(|logits| sampler.sample(&logits).map_err(to_model));

            next = match step {
                Ok(token) => token,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
        }
    }
}

#[async_trait]
impl ChatBackend for LocalLlmBackend {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let mut rx = self.chat_stream(model, messages, temperature, max_tokens).await?;
        let mut answer = String::new();
        while let Some(fragment) = rx.recv().await {
            answer.push_str(&fragment?);
        }
        if answer.is_empty() {
            return Err(LlmError::InvalidResponse("empty completion".into()));
        }
        Ok(answer)
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        self.ensure_loaded(model).await?;

        let prompt = Self::build_prompt(messages);
        let deadline = Duration::from_secs(generation_timeout_secs(max_tokens));
        let max_tokens = max_tokens.unwrap_or(512);

        let (tx, rx) = mpsc::channel(100);
        let slot = self.slot.clone();
        let device = self.device.clone();
        tokio::spawn(Self::generate(
            slot,
            device,
            prompt,
            temperature,
            max_tokens,
            deadline,
            tx,
        ));

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<LlmModelInfo>> {
        let mut models = Vec::new();
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(models),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(weights) = self.weights_path(name) else {
                continue;
            };
            let size_bytes = std::fs::metadata(&weights).ok().map(|m| m.len());
            models.push(LlmModelInfo {
                name: name.to_string(),
                provider: "local".to_string(),
                size_bytes,
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn unload(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            tracing::info!(model = %previous.name, "local LLM unloaded");
        }
    }
}

/// Check whether a model directory contains loadable weights without
/// touching the slot.
pub fn has_local_model(models_dir: &Path, model: &str) -> bool {
    let dir = models_dir.join(model);
    dir.join("model.gguf").exists()
        || std::fs::read_dir(&dir)
            .map(|entries| {
                entries.flatten().any(|e| {
                    e.path()
                        .extension()
                        .map(|ext| ext == "gguf")
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
}
