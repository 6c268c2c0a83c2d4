//! Test Fixtures
//!
//! Builds a full engine on tempdir-backed stores with deterministic stub
//! providers injected through the provider dispatch tables.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::chat::{ChatOrchestrator, GenerationDefaults};
use crate::core::embedding::{
    EmbeddingBackend, EmbeddingError, EmbeddingProviderKind, EmbeddingService, ModelInfo,
};
use crate::core::extract::EntityExtractor;
use crate::core::files::FileStore;
use crate::core::llm::{
    ChatBackend, ChatMessage, LlmError, LlmModelInfo, LlmProviderKind, LlmService,
};
use crate::core::metadata::MetadataStore;
use crate::core::model_admin::ModelAdmin;
use crate::core::progress::ProgressBus;
use crate::core::retrieval::Retriever;
use crate::core::services::Services;
use crate::core::split::TextSplitter;
use crate::core::storage::{GraphStore, SurrealStore, VectorStore};
use crate::database::Database;
use crate::ingestion::IngestionPipeline;

/// Stub embedding dimension.
pub const STUB_DIMENSION: usize = 16;

/// Deterministic embedding backend: each text hashes to a fixed
/// L2-normalized vector, so identical texts are identical vectors and the
/// similarity conversion behaves exactly as in production. Calls are
/// counted so tests can assert that no embedding I/O happened.
pub struct StubEmbedder {
    pub calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let hash = blake3::hash(text.as_bytes());
        let bytes = hash.as_bytes();
        let mut v: Vec<f32> = (0..STUB_DIMENSION)
            .map(|i| bytes[i % bytes.len()] as f32 - 127.5)
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

#[async_trait]
impl EmbeddingBackend for StubEmbedder {
    async fn encode(
        &self,
        texts: &[String],
        _model: &str,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    async fn dimension(&self, _model: &str) -> Result<usize, EmbeddingError> {
        Ok(STUB_DIMENSION)
    }

    async fn unload(&self, _model: Option<&str>) {}

    async fn list_models(&self) -> Result<Vec<ModelInfo>, EmbeddingError> {
        Ok(vec![ModelInfo {
            name: "stub-embedder".into(),
            provider: "remote".into(),
            dimension: Some(STUB_DIMENSION),
        }])
    }
}

/// Scripted chat backend behaviors.
#[derive(Debug, Clone)]
pub enum StubLlmMode {
    /// Answer with the concatenation of all message contents, so tests can
    /// assert on the composed prompt.
    Echo,
    /// Always answer with a fixed string.
    Fixed(String),
    /// Stream the given fragments with a small delay between them.
    Fragments(Vec<String>),
    /// Fail every call.
    Fail,
}

pub struct StubLlm {
    pub mode: StubLlmMode,
}

impl StubLlm {
    pub fn new(mode: StubLlmMode) -> Self {
        Self { mode }
    }

    fn full_answer(&self, messages: &[ChatMessage]) -> String {
        match &self.mode {
            StubLlmMode::Echo => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            StubLlmMode::Fixed(answer) => answer.clone(),
            StubLlmMode::Fragments(fragments) => fragments.concat(),
            StubLlmMode::Fail => String::new(),
        }
    }
}

#[async_trait]
impl ChatBackend for StubLlm {
    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        if matches!(self.mode, StubLlmMode::Fail) {
            return Err(LlmError::Model("stub backend failure".into()));
        }
        Ok(self.full_answer(messages))
    }

    async fn chat_stream(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let (tx, rx) = mpsc::channel(8);

        let fragments: Vec<Result<String, LlmError>> = match &self.mode {
            StubLlmMode::Fail => vec![Err(LlmError::Model("stub backend failure".into()))],
            StubLlmMode::Fragments(fragments) => fragments.iter().cloned().map(Ok).collect(),
            _ => vec![Ok(self.full_answer(messages))],
        };

        tokio::spawn(async move {
            for fragment in fragments {
                if tx.send(fragment).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<LlmModelInfo>, LlmError> {
        Ok(vec![LlmModelInfo {
            name: "stub-llm".into(),
            provider: "remote".into(),
            size_bytes: None,
        }])
    }

    async fn unload(&self) {}
}

/// Everything a scenario test needs, with handles on the stubs.
pub struct TestEngine {
    pub services: Services,
    pub embedder: Arc<StubEmbedder>,
    _dir: TempDir,
}

/// Knobs for building a test engine.
pub struct TestEngineOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub graph_enabled: bool,
    pub llm_mode: StubLlmMode,
}

impl Default for TestEngineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 100,
            graph_enabled: false,
            llm_mode: StubLlmMode::Echo,
        }
    }
}

fn test_config(dir: &TempDir, options: &TestEngineOptions) -> AppConfig {
    let root: PathBuf = dir.path().to_path_buf();
    let mut config = AppConfig::default();
    config.database.path = root.join("catalog.db");
    config.storage.dir = root.join("store");
    config.files.upload_root = root.join("uploads");
    config.embedding.model_dir = root.join("models").join("embedding");
    config.llm.models_dir = root.join("models").join("llm");
    config.text.chunk_size = options.chunk_size;
    config.text.chunk_overlap = options.chunk_overlap;
    config.text.semantic.enabled = false;
    config.graph.enabled = options.graph_enabled;
    config
}

/// Build an engine whose embedding and chat providers are the stubs above.
/// Both provider kinds dispatch to the same stub, so KBs can be created
/// with either tag.
pub async fn test_engine(options: TestEngineOptions) -> TestEngine {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir, &options);

    let catalog = Database::new(&config.database.path).await.expect("catalog");
    let store = SurrealStore::new(config.storage.dir.clone(), "test", "engine")
        .await
        .expect("store");
    let vectors = Arc::new(VectorStore::new(store.clone()));
    let graph = options
        .graph_enabled
        .then(|| Arc::new(GraphStore::new(store)));

    let embedder = Arc::new(StubEmbedder::new());
    let embeddings = Arc::new(
        EmbeddingService::new()
            .with_backend(EmbeddingProviderKind::Remote, embedder.clone())
            .with_backend(EmbeddingProviderKind::Local, embedder.clone()),
    );

    let llm_backend: Arc<dyn ChatBackend> = Arc::new(StubLlm::new(options.llm_mode.clone()));
    let llm = Arc::new(
        LlmService::new()
            .with_backend(LlmProviderKind::Remote, llm_backend.clone())
            .with_backend(LlmProviderKind::Local, llm_backend),
    );

    let extractor = options.graph_enabled.then(|| {
        Arc::new(EntityExtractor::new(
            llm.clone(),
            LlmProviderKind::Remote,
            config.graph.extraction.clone(),
        ))
    });

    let mut retriever = Retriever::new(
        catalog.clone(),
        vectors.clone(),
        embeddings.clone(),
        config.retrieval.clone(),
    );
    if let (Some(graph), Some(extractor)) = (&graph, &extractor) {
        retriever = retriever.with_graph(graph.clone(), extractor.clone(), config.graph.max_hops);
    }
    let retriever = Arc::new(retriever);

    let chat = Arc::new(ChatOrchestrator::new(
        catalog.clone(),
        retriever.clone(),
        llm.clone(),
        embeddings.clone(),
        config.chat.clone(),
        GenerationDefaults {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        },
    ));

    let progress = Arc::new(ProgressBus::new());
    let files = Arc::new(FileStore::new(
        config.files.upload_root.clone(),
        config.max_file_bytes(),
    ));
    let metadata = MetadataStore::new(config.files.upload_root.clone());

    let mut pipeline = IngestionPipeline::new(
        catalog.clone(),
        files.clone(),
        TextSplitter::new(config.text.clone()),
        config.text.semantic.clone(),
        embeddings.clone(),
        vectors.clone(),
        progress.clone(),
        metadata.clone(),
        llm.clone(),
    );
    if let (Some(graph), Some(extractor)) = (&graph, &extractor) {
        pipeline = pipeline.with_graph(graph.clone(), extractor.clone());
    }
    let pipeline = Arc::new(pipeline);

    let model_admin = ModelAdmin::new(
        catalog.clone(),
        config.embedding.model_dir.clone(),
        config.llm.models_dir.clone(),
    );

    let services = Services {
        config,
        catalog,
        progress,
        files,
        vectors,
        graph,
        embeddings,
        llm,
        extractor,
        retriever,
        chat,
        pipeline,
        metadata,
        model_admin,
    };

    TestEngine {
        services,
        embedder,
        _dir: dir,
    }
}
