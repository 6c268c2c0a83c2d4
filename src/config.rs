use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Every section has serde defaults so a missing or partial config file is
/// always usable. Values are resolved in three layers: built-in defaults,
/// then an optional TOML file, then `RAGWEAVE_`-prefixed environment
/// variables with `__` separating sections (e.g. `RAGWEAVE_DATABASE__PATH`,
/// `RAGWEAVE_EMBEDDING__REMOTE__BASE_URL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub files: FilesConfig,
    pub text: TextConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub graph: GraphConfig,
    pub retrieval: RetrievalConfig,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

/// Relational catalog configuration (embedded SQLite).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file. Created on first use.
    pub path: PathBuf,
}

/// Vector + graph store configuration (embedded SurrealDB on RocksDB).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory where RocksDB keeps its data files.
    pub dir: PathBuf,
    pub namespace: String,
    pub database: String,
}

/// Upload storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Root under which `kb_<id>/files/<hash>_<name>` trees are created.
    pub upload_root: PathBuf,
    /// Per-file size cap in megabytes.
    pub max_file_size_mb: u64,
}

/// Text splitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    /// Maximum chunk size in characters for the recursive splitter.
    pub chunk_size: usize,
    /// Characters of tail carry between neighboring chunks.
    pub chunk_overlap: usize,
    pub semantic: SemanticSplitConfig,
}

/// Semantic (LLM-assisted) splitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticSplitConfig {
    pub enabled: bool,
    pub max_chunk_size: usize,
    /// Chunks below this are merged with their successor where possible.
    pub min_chunk_size: usize,
    /// Provider tag for the merge-decision LLM.
    pub provider: String,
    /// Model consulted for merge decisions.
    pub model: String,
    /// Inputs shorter than this get the LLM-consulted path; longer inputs
    /// use rule-only merging.
    pub short_text_threshold: usize,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Default provider tag for new KBs: "local" or "remote"/"ollama".
    pub default_provider: String,
    pub default_model: String,
    /// Directory holding local transformer models (one subdir per model).
    pub model_dir: PathBuf,
    /// Batch size for local encoding.
    pub batch_size: usize,
    pub remote: RemoteEndpointConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Default provider tag: "local" or "remote"/"ollama".
    pub default_provider: String,
    pub default_model: String,
    /// Directory holding local GGUF models.
    pub models_dir: PathBuf,
    /// Quantization of local weights: "q4", "q8", or "f16".
    pub quantization: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub remote: RemoteEndpointConfig,
}

/// Base URL + timeout of a locally hosted remote provider (Ollama wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEndpointConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

/// Knowledge-graph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Master switch; when off, ingestion skips graph builds and hybrid
    /// retrieval degrades to vector-only.
    pub enabled: bool,
    /// Traversal bound for related-entity expansion.
    pub max_hops: usize,
    pub extraction: ExtractionConfig,
}

/// Entity extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Provider tag for the extraction LLM.
    pub provider: String,
    pub model: String,
    /// Inputs shorter than this are skipped (query-time callers may pass a
    /// lower override).
    pub min_text_length: usize,
    /// Entity names shorter than this are discarded.
    pub min_entity_length: usize,
    /// Concurrent extraction tasks in a batch.
    pub batch_size: usize,
    pub temperature: f32,
}

/// Retrieval scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results with similarity below this are dropped after conversion.
    pub score_threshold: f32,
    /// Weight applied to vector scores during hybrid fusion.
    pub vector_weight: f32,
    /// Weight applied to graph scores during hybrid fusion.
    pub graph_weight: f32,
}

/// Chat orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// History window in turns; `2 × this` messages are loaded.
    pub max_history_turns: usize,
    /// Retrieved passages per query.
    pub top_k: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Engine log level: "trace" | "debug" | "info" | "warn" | "error".
    /// `RUST_LOG` overrides the whole filter when set.
    pub level: String,
    /// Write a JSON log file in addition to stdout.
    pub file_enabled: bool,
    /// Directory for the rolling log file; defaults to `<data_dir>/logs`.
    pub dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ragweave"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            files: FilesConfig::default(),
            text: TextConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            graph: GraphConfig::default(),
            retrieval: RetrievalConfig::default(),
            chat: ChatConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: true,
            dir: None,
        }
    }
}

impl LoggingConfig {
    /// Resolved log directory (override or `<data_dir>/logs`).
    pub fn log_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("logs"))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("catalog.db"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir().join("store"),
            namespace: "ragweave".to_string(),
            database: "main".to_string(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            upload_root: default_data_dir().join("uploads"),
            max_file_size_mb: 100,
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 100,
            semantic: SemanticSplitConfig::default(),
        }
    }
}

impl Default for SemanticSplitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_chunk_size: 800,
            min_chunk_size: 200,
            provider: "remote".to_string(),
            model: "qwen2.5:7b".to_string(),
            short_text_threshold: 5000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            default_provider: "remote".to_string(),
            default_model: "nomic-embed-text".to_string(),
            model_dir: default_data_dir().join("models").join("embedding"),
            batch_size: 32,
            remote: RemoteEndpointConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: "remote".to_string(),
            default_model: "qwen2.5:7b".to_string(),
            models_dir: default_data_dir().join("models").join("llm"),
            quantization: "q4".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            remote: RemoteEndpointConfig::default(),
        }
    }
}

impl Default for RemoteEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 2,
            extraction: ExtractionConfig::default(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: "remote".to_string(),
            model: "qwen2.5:7b".to_string(),
            min_text_length: 50,
            min_entity_length: 2,
            batch_size: 5,
            temperature: 0.1,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.2,
            vector_weight: 0.7,
            graph_weight: 0.3,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 5,
            top_k: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional TOML file, and the
    /// environment. A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("ragweave.toml"));
        }
        figment
            .merge(Env::prefixed("RAGWEAVE_").split("__"))
            .extract()
    }

    /// Per-file upload cap in bytes.
    pub fn max_file_bytes(&self) -> u64 {
        self.files.max_file_size_mb * 1024 * 1024
    }
}
