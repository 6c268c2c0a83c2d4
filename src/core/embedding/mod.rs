//! Embedding Providers
//!
//! Text-to-vector encoding behind the [`EmbeddingBackend`] trait, with two
//! concrete backends: an in-process transformer (candle) and a remote
//! Ollama-wire client. Call sites never branch on provider strings; the
//! tag is parsed once into an [`EmbeddingProviderKind`] and dispatched
//! through the [`EmbeddingService`] table.

pub mod local;
pub mod remote;

pub use local::LocalTransformerBackend;
pub use remote::RemoteEmbedBackend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// Provider Kinds
// ============================================================================

/// Tagged embedding provider kind. Provider strings stored on KBs are
/// parsed into this once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Local,
    Remote,
}

impl EmbeddingProviderKind {
    /// Parse a stored provider tag. Unknown tags are a validation error.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.to_lowercase().as_str() {
            "local" | "transformers" => Ok(Self::Local),
            "remote" | "ollama" => Ok(Self::Remote),
            other => Err(EmbeddingError::UnknownProvider(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Descriptor of an available embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub dimension: Option<usize>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A concrete embedding provider.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Encode texts into vectors, one per input, all of equal dimension.
    async fn encode(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>>;

    /// Vector dimension of a model.
    async fn dimension(&self, model: &str) -> Result<usize>;

    /// Release cached model memory. `None` releases everything; releasing
    /// an unloaded model is a no-op.
    async fn unload(&self, model: Option<&str>);

    /// Models this backend can serve.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

// ============================================================================
// Dispatch
// ============================================================================

/// Kind-to-backend dispatch table. Built once at startup; tests inject
/// stub backends through [`EmbeddingService::with_backend`].
#[derive(Default, Clone)]
pub struct EmbeddingService {
    backends: HashMap<EmbeddingProviderKind, Arc<dyn EmbeddingBackend>>,
}

impl EmbeddingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(
        mut self,
        kind: EmbeddingProviderKind,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    fn backend(&self, kind: EmbeddingProviderKind) -> Result<&Arc<dyn EmbeddingBackend>> {
        self.backends
            .get(&kind)
            .ok_or_else(|| EmbeddingError::NotConfigured(kind.as_str().to_string()))
    }

    pub async fn encode(
        &self,
        kind: EmbeddingProviderKind,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.backend(kind)?.encode(texts, model).await
    }

    /// Encode a single text (query-time path).
    pub async fn encode_one(
        &self,
        kind: EmbeddingProviderKind,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>> {
        let mut vectors = self
            .encode(kind, model, std::slice::from_ref(&text.to_string()))
            .await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty encode result".to_string()))
    }

    pub async fn dimension(&self, kind: EmbeddingProviderKind, model: &str) -> Result<usize> {
        self.backend(kind)?.dimension(model).await
    }

    /// Release accelerator memory held by a backend. Unconfigured backends
    /// are ignored — the unload hook must never fail a chat turn.
    pub async fn unload(&self, kind: EmbeddingProviderKind, model: Option<&str>) {
        if let Some(backend) = self.backends.get(&kind) {
            backend.unload(model).await;
        }
    }

    /// Models across all configured backends, or one backend when `kind`
    /// is given.
    pub async fn list_models(&self, kind: Option<EmbeddingProviderKind>) -> Result<Vec<ModelInfo>> {
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
}
