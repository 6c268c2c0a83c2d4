//! Ingestion pipeline.
//!
//! A phase machine over one uploaded file. Phases run strictly in order,
//! each emitting a `progress` event with a monotone percentage:
//!
//! 1. parse (10%)          file bytes -> text
//! 2. chunk (30%)          splitter strategy per configuration
//! 3. embed (50%)          chunks -> vectors, batched
//! 4. store (80%)          vectors upserted under `file_<id>_chunk_<i>` ids
//! 5. persist (85%)        chunk rows inserted in one transaction
//! 6. counts               file chunk_count, KB stats, metadata sidecar
//! 7. graph (optional)     batch extraction + graph import, non-fatal
//! 8. complete             event with (file_id, chunk_count)
//!
//! Vectors are written before chunk rows; if the row insert fails the
//! just-written vector ids are deleted before the error is reported, so no
//! orphaned vectors survive a failed run. Any failure sets the file to
//! `error` with the message, emits an `error` event, and stops — nothing
//! propagates to the spawner.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SemanticSplitConfig;
use crate::core::embedding::{EmbeddingError, EmbeddingProviderKind, EmbeddingService};
use crate::core::extract::EntityExtractor;
use crate::core::files::{FileStore, FileStoreError};
use crate::core::llm::{ChatMessage, LlmProviderKind, LlmService};
use crate::core::metadata::MetadataStore;
use crate::core::progress::{ProgressBus, ProgressEvent};
use crate::core::split::{MergeDecider, TextSplitter};
use crate::core::storage::graph::{GraphEntity, GraphRelation};
use crate::core::storage::vector::{collection_name, VectorRecord, VectorStore};
use crate::core::storage::{GraphStore, StorageError};
use crate::database::models::{vector_id, FileRecord, FileStatus, KnowledgeBaseRecord};
use crate::database::{ChunkOps, Database, FileOps, KnowledgeBaseOps, NewChunk};

#[derive(Error, Debug)]
enum PipelineError {
    #[error("file not found: {0}")]
    FileNotFound(i64),

    #[error("knowledge base not found: {0}")]
    KnowledgeBaseNotFound(i64),

    #[error("parsed file produced no text")]
    EmptyContent,

    #[error("{0}")]
    File(#[from] FileStoreError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store failed: {0}")]
    Storage(#[from] StorageError),

    #[error("catalog failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// One unit of ingestion work, spawned off the upload path.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub file_id: i64,
    pub kb_id: i64,
    /// Progress subscriber this job reports to.
    pub client_id: String,
    /// Run entity extraction and graph import after the vector path.
    pub build_graph: bool,
}

/// Merge decider backed by the configured LLM; any failure degrades to
/// "do not merge".
pub struct LlmMergeDecider {
    llm: Arc<LlmService>,
    kind: LlmProviderKind,
    model: String,
}

impl LlmMergeDecider {
    pub fn new(llm: Arc<LlmService>, kind: LlmProviderKind, model: impl Into<String>) -> Self {
        Self {
            llm,
            kind,
            model: model.into(),
        }
    }
}

#[async_trait]
impl MergeDecider for LlmMergeDecider {
    async fn should_merge(&self, tail: &str, head: &str) -> bool {
        let prompt = format!(
            "Do these two text fragments discuss the same topic or belong together?\n\n\
             End of fragment 1:\n{}\n\nStart of fragment 2:\n{}\n\n\
             Answer only \"yes\" or \"no\".",
            tail, head
        );

        match self
            .llm
            .chat(self.kind, &self.model, &[ChatMessage::user(prompt)], 0.1, Some(8))
            .await
        {
            Ok(answer) => answer.trim().to_lowercase().starts_with("yes"),
            Err(e) => {
                tracing::warn!("merge decision failed, cutting: {}", e);
                false
            }
        }
    }
}

pub struct IngestionPipeline {
    catalog: Database,
    files: Arc<FileStore>,
    splitter: TextSplitter,
    semantic: SemanticSplitConfig,
    embeddings: Arc<EmbeddingService>,
    vectors: Arc<VectorStore>,
    progress: Arc<ProgressBus>,
    metadata: MetadataStore,
    llm: Arc<LlmService>,
    graph: Option<Arc<GraphStore>>,
    extractor: Option<Arc<EntityExtractor>>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Database,
        files: Arc<FileStore>,
        splitter: TextSplitter,
        semantic: SemanticSplitConfig,
        embeddings: Arc<EmbeddingService>,
        vectors: Arc<VectorStore>,
        progress: Arc<ProgressBus>,
        metadata: MetadataStore,
        llm: Arc<LlmService>,
    ) -> Self {
        Self {
            catalog,
            files,
            splitter,
            semantic,
            embeddings,
            vectors,
            progress,
            metadata,
            llm,
            graph: None,
            extractor: None,
        }
    }

    /// Attach the graph side used when jobs request a graph build.
    pub fn with_graph(mut self, graph: Arc<GraphStore>, extractor: Arc<EntityExtractor>) -> Self {
        self.graph = Some(graph);
        self.extractor = Some(extractor);
        self
    }

    /// Run a job detached so the upload path can return immediately.
    pub fn spawn(self: &Arc<Self>, job: IngestJob) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(job).await })
    }

    /// Run one job to completion. All failures are absorbed here: the file
    /// row carries the message, the bus carries the `error` event.
    pub async fn run(&self, job: IngestJob) {
        match self.execute(&job).await {
            Ok((chunk_count, warning)) => {
                let message = match warning {
                    Some(warning) => format!("File processed ({})", warning),
                    None => "File processed".to_string(),
                };
                self.progress.publish(
                    &job.client_id,
                    ProgressEvent::complete(job.kb_id, message, Some(job.file_id), Some(chunk_count)),
                );
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(file_id = job.file_id, kb_id = job.kb_id, "ingestion failed: {}", message);

                if let Err(db_err) = self
                    .catalog
                    .update_file_status(job.file_id, FileStatus::Error, Some(&message))
                    .await
                {
                    tracing::error!(file_id = job.file_id, "failed to record error status: {}", db_err);
                }
                self.progress.publish(
                    &job.client_id,
                    ProgressEvent::error(job.kb_id, "file processing failed", Some(message)),
                );
            }
        }
    }

    fn report(&self, job: &IngestJob, stage: &str, pct: f32, message: &str) {
        self.progress
            .publish(&job.client_id, ProgressEvent::progress(job.kb_id, stage, pct, message));
    }

    async fn execute(&self, job: &IngestJob) -> Result<(usize, Option<String>), PipelineError> {
        let file = self
            .catalog
            .get_file(job.file_id)
            .await?
            .ok_or(PipelineError::FileNotFound(job.file_id))?;
        let kb = self
            .catalog
            .get_knowledge_base(job.kb_id)
            .await?
            .ok_or(PipelineError::KnowledgeBaseNotFound(job.kb_id))?;
        let kind = EmbeddingProviderKind::parse(&kb.embedding_provider)?;

        // 1. Parse.
        self.report(job, "parsing", 10.0, "Parsing file...");
        let content = self.files.parse(&self.catalog, &file).await?;
        if content.trim().is_empty() {
            return Err(PipelineError::EmptyContent);
        }

        // 2. Chunk.
        self.report(job, "chunking", 30.0, "Splitting text...");
        let chunks = self.split(&content).await;
        if chunks.is_empty() {
            return Err(PipelineError::EmptyContent);
        }

        // 3. Embed.
        self.report(
            job,
            "embedding",
            50.0,
            &format!("Encoding {} chunks ({})...", chunks.len(), kb.embedding_provider),
        );
        self.catalog
            .update_file_status(job.file_id, FileStatus::Embedding, None)
            .await?;
        let embeddings = self.embeddings.encode(kind, &kb.embedding_model, &chunks).await?;

        // 4. Store vectors.
        self.report(job, "storing", 80.0, "Storing vectors...");
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        let collection = collection_name(job.kb_id);
        self.vectors.ensure_collection(&collection, dimension).await?;

        let ids: Vec<String> = (0..chunks.len()).map(|i| vector_id(job.file_id, i)).collect();
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (chunk, embedding))| {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("kb_id".to_string(), job.kb_id.to_string());
                metadata.insert("file_id".to_string(), job.file_id.to_string());
                metadata.insert("chunk_index".to_string(), i.to_string());
                VectorRecord {
                    id: ids[i].clone(),
                    embedding,
                    document: chunk.clone(),
                    metadata,
                }
            })
            .collect();
        self.vectors.upsert(&collection, records).await?;

        // 5. Persist chunk rows; compensate the vector write on failure.
        self.report(job, "persisting", 85.0, "Persisting chunks...");
        let rows: Vec<NewChunk> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| NewChunk {
                kb_id: job.kb_id,
                file_id: job.file_id,
                chunk_index: i as i64,
                content: chunk.clone(),
                vector_id: ids[i].clone(),
            })
            .collect();

        if let Err(e) = self.catalog.insert_chunks(&rows).await {
            tracing::warn!(
                file_id = job.file_id,
                "chunk rows failed, deleting {} just-written vectors",
                ids.len()
            );
            if let Err(cleanup) = self.vectors.delete_by_ids(&collection, ids.clone()).await {
                tracing::error!(file_id = job.file_id, "compensating delete failed: {}", cleanup);
            }
            return Err(e.into());
        }

        // 6. Counts.
        self.catalog
            .update_file_chunk_count(job.file_id, chunks.len() as i64)
            .await?;
        self.catalog
            .update_file_status(job.file_id, FileStatus::Completed, None)
            .await?;
        let (file_count, chunk_count) = self.catalog.update_kb_stats(job.kb_id).await?;
        if let Err(e) = self.metadata.update_counts(job.kb_id, file_count, chunk_count) {
            tracing::warn!(kb_id = job.kb_id, "metadata sidecar update failed: {}", e);
        }

        // 7. Optional graph build; failures degrade to a completion warning.
        let warning = if job.build_graph {
            self.build_graph(job, &kb, &file, &chunks, &ids).await
        } else {
            None
        };

        tracing::info!(
            file_id = job.file_id,
            kb_id = job.kb_id,
            chunks = chunks.len(),
            "file ingested"
        );
        Ok((chunks.len(), warning))
    }

    async fn split(&self, content: &str) -> Vec<String> {
        if !self.semantic.enabled {
            return self.splitter.split(content, None).await;
        }

        match LlmProviderKind::parse(&self.semantic.provider) {
            Ok(kind) => {
                let decider =
                    LlmMergeDecider::new(self.llm.clone(), kind, self.semantic.model.clone());
                self.splitter.split(content, Some(&decider)).await
            }
            Err(e) => {
                tracing::warn!("bad semantic split provider, merging by rules only: {}", e);
                self.splitter.split(content, None).await
            }
        }
    }

    /// Extract entities from the chunks and import them into the graph.
    /// Returns a warning string instead of failing the pipeline.
    async fn build_graph(
        &self,
        job: &IngestJob,
        _kb: &KnowledgeBaseRecord,
        _file: &FileRecord,
        chunks: &[String],
        ids: &[String],
    ) -> Option<String> {
        let (Some(graph), Some(extractor)) = (self.graph.as_ref(), self.extractor.as_ref()) else {
            return Some("graph build skipped: graph side not configured".to_string());
        };
        if !graph.is_available().await {
            return Some("graph build skipped: graph store unavailable".to_string());
        }

        self.report(job, "graph", 90.0, "Building knowledge graph...");

        let texts: Vec<(String, Option<String>)> = chunks
            .iter()
            .zip(ids)
            .map(|(chunk, id)| (chunk.clone(), Some(id.clone())))
            .collect();
        let extractions = extractor.batch_extract(texts, None).await;
        let (entities, relations) = EntityExtractor::merge(&extractions);

        if entities.is_empty() {
            return Some("graph build found no entities".to_string());
        }

        let graph_entities: Vec<GraphEntity> = entities
            .into_iter()
            .map(|e| GraphEntity::new(e.name, e.etype))
            .collect();
        let graph_relations: Vec<GraphRelation> = relations
            .into_iter()
            .map(|r| GraphRelation::new(r.source, r.target, r.rtype))
            .collect();

        if let Err(e) = graph.batch_upsert_entities(job.kb_id, graph_entities).await {
            tracing::warn!(kb_id = job.kb_id, "entity import failed: {}", e);
            return Some(format!("graph build failed: {}", e));
        }
        if let Err(e) = graph.batch_upsert_relations(job.kb_id, graph_relations).await {
            tracing::warn!(kb_id = job.kb_id, "relation import failed: {}", e);
            return Some(format!("graph relations failed: {}", e));
        }

        match graph.stats(job.kb_id).await {
            Ok(stats) => {
                tracing::info!(
                    kb_id = job.kb_id,
                    nodes = stats.node_count,
                    edges = stats.edge_count,
                    "graph updated"
                );
                None
            }
            Err(e) => Some(format!("graph stats failed: {}", e)),
        }
    }
}
