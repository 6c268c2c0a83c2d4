//! Retrieval Engine
//!
//! Single-KB and multi-KB vector search plus hybrid vector+graph fusion.
//! Multi-KB requests are validated for embedding-config agreement before
//! any embedding or store I/O happens; hybrid retrieval degrades to
//! vector-only whenever the graph side is unavailable.

pub mod hybrid;
pub mod similarity;

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RetrievalConfig;
use crate::core::embedding::{EmbeddingError, EmbeddingProviderKind, EmbeddingService};
use crate::core::extract::EntityExtractor;
use crate::core::storage::vector::collection_name;
use crate::core::storage::{GraphStore, StorageError, VectorStore};
use crate::database::models::KnowledgeBaseRecord;
use crate::database::{Database, FileOps, KnowledgeBaseOps};

use similarity::l2_distance_to_similarity;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("knowledge base not found: {0}")]
    KnowledgeBaseNotFound(i64),

    #[error("embedding configuration mismatch: {0}")]
    EmbeddingConfigMismatch(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

// ============================================================================
// Results
// ============================================================================

/// Where a retrieved item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Vector,
    GraphDirect,
    GraphRelated,
}

/// A retrieved passage (or graph fact) with its score and attribution.
///
/// For plain vector search `similarity` is the converted distance; for
/// hybrid search it is the fused, weighted score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Vector-store id for vector hits; absent for graph facts.
    pub chunk_id: Option<String>,
    pub content: String,
    pub similarity: f32,
    pub kb_id: i64,
    pub file_id: Option<i64>,
    pub chunk_index: Option<i64>,
    pub filename: Option<String>,
    pub source: RetrievalSource,
}

// ============================================================================
// Retriever
// ============================================================================

pub struct Retriever {
    catalog: Database,
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    pub(crate) graph: Option<Arc<GraphStore>>,
    pub(crate) extractor: Option<Arc<EntityExtractor>>,
    pub(crate) config: RetrievalConfig,
    pub(crate) max_hops: usize,
}

impl Retriever {
    pub fn new(
        catalog: Database,
        vectors: Arc<VectorStore>,
        embeddings: Arc<EmbeddingService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            catalog,
            vectors,
            embeddings,
            graph: None,
            extractor: None,
            config,
            max_hops: 2,
        }
    }

    /// Attach the graph side used by hybrid search.
    pub fn with_graph(
        mut self,
        graph: Arc<GraphStore>,
        extractor: Arc<EntityExtractor>,
        max_hops: usize,
    ) -> Self {
        self.graph = Some(graph);
        self.extractor = Some(extractor);
        self.max_hops = max_hops;
        self
    }

    pub(crate) async fn knowledge_base(&self, kb_id: i64) -> Result<KnowledgeBaseRecord> {
        self.catalog
            .get_knowledge_base(kb_id)
            .await?
            .ok_or(RetrievalError::KnowledgeBaseNotFound(kb_id))
    }

    /// Search one knowledge base: encode the query with the KB's own
    /// embedding binding, run k-NN, convert distances, filter by threshold,
    /// and attach filenames.
    pub async fn search_kb(
        &self,
        kb_id: i64,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<RetrievedChunk>> {
        let kb = self.knowledge_base(kb_id).await?;
        let kind = EmbeddingProviderKind::parse(&kb.embedding_provider)?;
        let threshold = score_threshold.unwrap_or(self.config.score_threshold);

        let query_vector = self
            .embeddings
            .encode_one(kind, &kb.embedding_model, query)
            .await?;

        // A KB with no ingested files has no collection yet; that is an
        // empty result, not a failure.
        let result = match self
            .vectors
            .query(&collection_name(kb_id), query_vector, top_k, None)
            .await
        {
            Ok(result) => result,
            Err(StorageError::UnknownCollection(_)) => {
                tracing::debug!(kb_id, "no vector collection yet, empty result");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut file_ids = Vec::new();
        for metadata in &result.metadatas {
            if let Some(id) = metadata.get("file_id").and_then(|v| v.parse::<i64>().ok()) {
                if !file_ids.contains(&id) {
                    file_ids.push(id);
                }
            }
        }
        let filenames = self.catalog.filenames_by_ids(&file_ids).await?;

        let mut chunks = Vec::new();
        for i in 0..result.len() {
            let similarity = l2_distance_to_similarity(result.distances[i]);
            if similarity < threshold {
                continue;
            }

            let metadata = &result.metadatas[i];
            let file_id = metadata.get("file_id").and_then(|v| v.parse::<i64>().ok());
            chunks.push(RetrievedChunk {
                chunk_id: Some(result.ids[i].clone()),
                content: result.documents[i].clone(),
                similarity,
                kb_id,
                file_id,
                chunk_index: metadata.get("chunk_index").and_then(|v| v.parse::<i64>().ok()),
                filename: file_id.and_then(|id| filenames.get(&id).cloned()),
                source: RetrievalSource::Vector,
            });
        }

        tracing::info!(
            kb_id,
            results = chunks.len(),
            model = %kb.embedding_model,
            "knowledge base searched"
        );
        Ok(chunks)
    }

    /// Search several knowledge bases and merge by similarity.
    ///
    /// All requested KBs must share one embedding configuration; the check
    /// runs before any embedding or store I/O and rejects with
    /// `EmbeddingConfigMismatch` otherwise. Unknown KB ids are skipped.
    pub async fn search_many(
        &self,
        kb_ids: &[i64],
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<RetrievedChunk>> {
        if kb_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut valid_ids = Vec::new();
        let mut configs: Vec<(String, String)> = Vec::new();
        for kb_id in kb_ids {
            match self.catalog.get_knowledge_base(*kb_id).await? {
                Some(kb) => {
                    let config = (kb.embedding_provider.clone(), kb.embedding_model.clone());
                    if !configs.contains(&config) {
                        configs.push(config);
                    }
                    valid_ids.push(*kb_id);
                }
                None => tracing::warn!(kb_id, "unknown knowledge base skipped"),
            }
        }

        if configs.len() > 1 {
            return Err(RetrievalError::EmbeddingConfigMismatch(format!(
                "knowledge bases {:?} use {} distinct embedding configurations: {:?}",
                valid_ids,
                configs.len(),
                configs
            )));
        }
        if valid_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Over-fetch per KB so the merged cut still has depth.
        let per_kb = top_k.max(valid_ids.len() * 2);
        let searches = valid_ids
            .iter()
            .map(|kb_id| self.search_kb(*kb_id, query, per_kb, score_threshold));

        let mut merged = Vec::new();
        for (kb_id, result) in valid_ids.iter().zip(join_all(searches).await) {
            match result {
                Ok(chunks) => merged.extend(chunks),
                Err(e) => tracing::error!(kb_id, "per-KB search failed: {}", e),
            }
        }

        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(top_k);
        Ok(merged)
    }
}
