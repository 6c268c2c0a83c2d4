//! Concrete chat providers.
//!
//! Adding a provider means a new [`LlmProviderKind`] variant, an entry in
//! the service dispatch table at startup, and the implementation module.

mod local;
mod remote;

pub use local::LocalLlmBackend;
pub use remote::RemoteLlmBackend;

use serde::{Deserialize, Serialize};

use super::{LlmError, Result};

/// Tagged chat provider kind. Assistant rows store the tag; it is parsed
/// once at the boundary and dispatched through the service table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Local,
    Remote,
}

impl LlmProviderKind {
    /// Parse a stored provider tag. Unknown tags are a validation error.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.to_lowercase().as_str() {
            "local" | "transformers" => Ok(Self::Local),
            "remote" | "ollama" => Ok(Self::Remote),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    /// Local providers share the process's accelerator with the local
    /// embedding backend; the orchestrator frees embedding memory before
    /// invoking one.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}
