//! LLM Providers
//!
//! Chat (batch + streaming) behind the [`ChatBackend`] trait, dispatched by
//! [`LlmProviderKind`] exactly like the embedding side. Two concrete
//! backends: a remote Ollama-wire client and an in-process quantized model
//! runner with a single accelerator slot.

pub mod providers;

pub use providers::{LlmProviderKind, LocalLlmBackend, RemoteLlmBackend};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// User-visible payload emitted when a generation deadline fires. Providers
/// return this as the answer text instead of hanging or erroring.
pub fn timeout_message() -> String {
    "Generation timed out — please shorten the prompt or reduce max_tokens.".to_string()
}

/// End-to-end generation deadline in seconds, scaled from the token budget
/// with a floor.
pub fn generation_timeout_secs(max_tokens: Option<u32>) -> u64 {
    let budget = max_tokens.unwrap_or(512) as u64;
    (budget / 10).max(60)
}

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Descriptor of an available generation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelInfo {
    pub name: String,
    pub provider: String,
    pub size_bytes: Option<u64>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A concrete chat provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Full-text completion. A generation deadline produces the canned
    /// timeout payload as the result, never a hang.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String>;

    /// Streaming completion. Fragments arrive in model order; the consumer
    /// concatenates suffix extensions. Dropping the receiver abandons the
    /// generation.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    async fn list_models(&self) -> Result<Vec<LlmModelInfo>>;

    /// Release accelerator memory held by this backend.
    async fn unload(&self);
}

// ============================================================================
// Dispatch
// ============================================================================

/// Kind-to-backend dispatch table for chat providers.
#[derive(Default, Clone)]
pub struct LlmService {
    backends: HashMap<LlmProviderKind, Arc<dyn ChatBackend>>,
}

impl LlmService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, kind: LlmProviderKind, backend: Arc<dyn ChatBackend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    fn backend(&self, kind: LlmProviderKind) -> Result<&Arc<dyn ChatBackend>> {
        self.backends
            .get(&kind)
            .ok_or_else(|| LlmError::NotConfigured(kind.as_str().to_string()))
    }

    pub async fn chat(
        &self,
        kind: LlmProviderKind,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        self.backend(kind)?
            .chat(model, messages, temperature, max_tokens)
            .await
    }

    pub async fn chat_stream(
        &self,
        kind: LlmProviderKind,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        self.backend(kind)?
            .chat_stream(model, messages, temperature, max_tokens)
            .await
    }

    pub async fn list_models(&self, kind: Option<LlmProviderKind>) -> Result<Vec<LlmModelInfo>> {
        match kind {
            Some(kind) => self.backend(kind)?.list_models().await,
            None => {
                let mut all = Vec::new();
                for backend in self.backends.values() {
                    match backend.list_models().await {
                        Ok(models) => all.extend(models),
                        Err(e) => tracing::warn!("model listing failed for a backend: {}", e),
                    }
                }
                Ok(all)
            }
        }
    }

    /// Release a backend's accelerator memory; unconfigured kinds are
    /// ignored.
    pub async fn unload(&self, kind: LlmProviderKind) {
        if let Some(backend) = self.backends.get(&kind) {
            backend.unload().await;
        }
    }
}
