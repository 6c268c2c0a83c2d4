//! Service registry.
//!
//! The engine's dependency graph, built once at startup and passed by
//! reference. No module-level singletons: the only shared mutable state
//! lives inside the progress bus and the provider model caches, each
//! behind its own lock. The registry also composes the cross-store
//! cascades (a KB delete touches the catalog, the vector collection, the
//! graph scope, the upload directory, and the metadata sidecar) and exposes
//! the engine's public operations.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::chat::{ChatError, ChatOrchestrator, GenerationDefaults};
use crate::core::embedding::{
    EmbeddingError, EmbeddingProviderKind, EmbeddingService, LocalTransformerBackend,
    RemoteEmbedBackend,
};
use crate::core::extract::EntityExtractor;
use crate::core::files::{FileStore, FileStoreError};
use crate::core::llm::{LlmProviderKind, LlmService, LocalLlmBackend, RemoteLlmBackend};
use crate::core::metadata::{MetadataError, MetadataStore};
use crate::core::model_admin::ModelAdmin;
use crate::core::progress::ProgressBus;
use crate::core::retrieval::{RetrievalError, Retriever};
use crate::core::storage::vector::collection_name;
use crate::core::storage::{GraphStore, StorageError, SurrealStore, VectorStore};
use crate::database::models::{FileRecord, KnowledgeBaseRecord};
use crate::database::{CatalogError, ChunkOps, Database, FileOps, KnowledgeBaseOps};
use crate::ingestion::{IngestJob, IngestionPipeline};

static KB_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\x00-\x1f/\\]{1,100}$").expect("valid kb name regex"));

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    File(#[from] FileStoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Registry
// ============================================================================

pub struct Services {
    pub config: AppConfig,
    pub catalog: Database,
    pub progress: Arc<ProgressBus>,
    pub files: Arc<FileStore>,
    pub vectors: Arc<VectorStore>,
    pub graph: Option<Arc<GraphStore>>,
    pub embeddings: Arc<EmbeddingService>,
    pub llm: Arc<LlmService>,
    pub extractor: Option<Arc<EntityExtractor>>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatOrchestrator>,
    pub pipeline: Arc<IngestionPipeline>,
    pub metadata: MetadataStore,
    pub model_admin: ModelAdmin,
}

impl Services {
    /// Build the whole dependency graph. Failing to open the catalog or
    /// the vector/graph store is fatal; remote provider reachability is
    /// checked later, at boot, as a warning.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let catalog = Database::new(&config.database.path).await?;

        let store = SurrealStore::new(
            config.storage.dir.clone(),
            &config.storage.namespace,
            &config.storage.database,
        )
        .await?;
        let vectors = Arc::new(VectorStore::new(store.clone()));
        let graph = if config.graph.enabled {
            Some(Arc::new(GraphStore::new(store)))
        } else {
            None
        };

        let embeddings = Arc::new(
            EmbeddingService::new()
                .with_backend(
                    EmbeddingProviderKind::Local,
                    Arc::new(LocalTransformerBackend::new(
                        config.embedding.model_dir.clone(),
                        config.embedding.batch_size,
                    )),
                )
                .with_backend(
                    EmbeddingProviderKind::Remote,
                    Arc::new(RemoteEmbedBackend::new(
                        config.embedding.remote.base_url.clone(),
                        config.embedding.remote.timeout_secs,
                    )),
                ),
        );

        let llm = Arc::new(
            LlmService::new()
                .with_backend(
                    LlmProviderKind::Local,
                    Arc::new(LocalLlmBackend::new(
                        config.llm.models_dir.clone(),
                        config.llm.quantization.clone(),
                    )),
                )
                .with_backend(
                    LlmProviderKind::Remote,
                    Arc::new(RemoteLlmBackend::new(
                        config.llm.remote.base_url.clone(),
                        config.llm.remote.timeout_secs,
                    )),
                ),
        );

        let extractor = if config.graph.enabled {
            let kind = LlmProviderKind::parse(&config.graph.extraction.provider)
                .map_err(|e| EngineError::Validation(e.to_string()))?;
            Some(Arc::new(EntityExtractor::new(
                llm.clone(),
                kind,
                config.graph.extraction.clone(),
            )))
        } else {
            None
        };

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
            crate::core::split::TextSplitter::new(config.text.clone()),
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

        tracing::info!(graph_enabled = config.graph.enabled, "engine services initialized");
        Ok(Self {
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
        })
    }

    /// Startup health check: an unreachable catalog is fatal; everything
    /// else logs and continues.
    pub async fn health_check(&self) -> Result<()> {
        self.catalog.health_check().await?;
        if let Err(e) = self.vectors.list_collections().await {
            tracing::warn!("vector store degraded at boot: {}", e);
        }
        if let Some(graph) = &self.graph {
            if !graph.is_available().await {
                tracing::warn!("graph store unavailable at boot");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Knowledge base lifecycle
    // ========================================================================

    /// Create a KB with its metadata sidecar. Name collisions are a
    /// conflict; the provider tag and name are validated up front.
    pub async fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
        embedding_model: Option<&str>,
        embedding_provider: Option<&str>,
    ) -> Result<KnowledgeBaseRecord> {
        let name = name.trim();
        if !KB_NAME.is_match(name) {
            return Err(EngineError::Validation(format!(
                "invalid knowledge base name: {:?}",
                name
            )));
        }

        let model = embedding_model.unwrap_or(&self.config.embedding.default_model);
        let provider = embedding_provider.unwrap_or(&self.config.embedding.default_provider);
        EmbeddingProviderKind::parse(provider)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        if self.catalog.get_knowledge_base_by_name(name).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "knowledge base {:?} already exists",
                name
            )));
        }

        let kb = self
            .catalog
            .create_knowledge_base(name, description, model, provider)
            .await?;
        self.metadata
            .create(kb.id, &kb.name, description, model, provider, &kb.created_at)?;
        Ok(kb)
    }

    /// Delete a KB and everything it owns: catalog rows, vector
    /// collection, graph scope, uploaded bytes, metadata sidecar. Store
    /// cleanup is best-effort so a degraded store cannot wedge deletion.
    pub async fn delete_knowledge_base(&self, kb_id: i64) -> Result<()> {
        if self.catalog.get_knowledge_base(kb_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("knowledge base {}", kb_id)));
        }

        if let Err(e) = self.vectors.delete_collection(&collection_name(kb_id)).await {
            tracing::warn!(kb_id, "vector collection cleanup failed: {}", e);
        }
        if let Some(graph) = &self.graph {
            if let Err(e) = graph.delete_kb(kb_id).await {
                tracing::warn!(kb_id, "graph cleanup failed: {}", e);
            }
        }
        if let Err(e) = self.files.remove_kb_dir(kb_id) {
            tracing::warn!(kb_id, "upload cleanup failed: {}", e);
        }
        if let Err(e) = self.metadata.delete(kb_id) {
            tracing::warn!(kb_id, "metadata cleanup failed: {}", e);
        }

        self.catalog.delete_knowledge_base_rows(kb_id).await?;
        tracing::info!(kb_id, "knowledge base deleted");
        Ok(())
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Store an upload and spawn its ingestion job. The call returns as
    /// soon as the bytes are durable; progress flows to `client_id`.
    ///
    /// Re-uploading bytes already completed in this KB returns the existing
    /// file without scheduling new work, so chunk and vector counts are
    /// unchanged.
    pub async fn upload_file(
        &self,
        kb_id: i64,
        client_id: &str,
        filename: &str,
        bytes: &[u8],
        build_graph: bool,
    ) -> Result<FileRecord> {
        if self.catalog.get_knowledge_base(kb_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("knowledge base {}", kb_id)));
        }

        let file = self.files.save(&self.catalog, kb_id, filename, bytes).await?;

        if file.status == "completed" {
            tracing::info!(file_id = file.id, "duplicate upload already ingested, skipping");
            return Ok(file);
        }

        self.pipeline.spawn(IngestJob {
            file_id: file.id,
            kb_id,
            client_id: client_id.to_string(),
            build_graph: build_graph && self.config.graph.enabled,
        });
        Ok(file)
    }

    /// Run ingestion for a stored file inline (no detached task). Used by
    /// callers that need completion before returning.
    pub async fn ingest_file(&self, kb_id: i64, file_id: i64, client_id: &str, build_graph: bool) {
        self.pipeline
            .run(IngestJob {
                file_id,
                kb_id,
                client_id: client_id.to_string(),
                build_graph: build_graph && self.config.graph.enabled,
            })
            .await;
    }

    /// Delete a file: its vectors, chunk rows, stored bytes, and catalog
    /// row, then refresh KB stats.
    pub async fn delete_file(&self, kb_id: i64, file_id: i64) -> Result<()> {
        let file = self
            .catalog
            .get_file(file_id)
            .await?
            .filter(|f| f.kb_id == kb_id)
            .ok_or_else(|| EngineError::NotFound(format!("file {} in kb {}", file_id, kb_id)))?;

        let vector_ids = self.catalog.vector_ids_by_file(file_id).await?;
        if !vector_ids.is_empty() {
            if let Err(e) = self
                .vectors
                .delete_by_ids(&collection_name(kb_id), vector_ids)
                .await
            {
                tracing::warn!(file_id, "vector cleanup failed: {}", e);
            }
        }

        self.catalog.delete_chunks_by_file(file_id).await?;
        if let Err(e) = self.files.remove_bytes(&file) {
            tracing::warn!(file_id, "stored bytes cleanup failed: {}", e);
        }
        self.catalog.delete_file_row(file_id).await?;

        let (file_count, chunk_count) = self.catalog.update_kb_stats(kb_id).await?;
        if let Err(e) = self.metadata.update_counts(kb_id, file_count, chunk_count) {
            tracing::warn!(kb_id, "metadata sidecar update failed: {}", e);
        }

        tracing::info!(kb_id, file_id, "file deleted");
        Ok(())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Vector or hybrid search across one or more knowledge bases.
    pub async fn search(
        &self,
        kb_ids: &[i64],
        query: &str,
        top_k: usize,
        hybrid: bool,
    ) -> Result<Vec<crate::core::retrieval::RetrievedChunk>> {
        let results = if hybrid {
            self.retriever.hybrid_search(kb_ids, query, top_k).await?
        } else {
            self.retriever.search_many(kb_ids, query, top_k, None).await?
        };
        Ok(results)
    }
}
