//! Catalog Records
//!
//! Row types for knowledge bases, files, chunks, assistants, conversations,
//! and messages. Timestamps are RFC 3339 strings.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Knowledge Base
// ============================================================================

/// Knowledge base record. The embedding model/provider pair is immutable
/// once any chunk has been indexed; changing it requires a full reindex.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KnowledgeBaseRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub embedding_model: String,
    pub embedding_provider: String,
    pub file_count: i64,
    pub chunk_count: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// File
// ============================================================================

/// Processing status of an ingested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Parsing,
    Parsed,
    Embedding,
    Completed,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Parsing => "parsing",
            FileStatus::Parsed => "parsed",
            FileStatus::Embedding => "embedding",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
        }
    }
}

/// Ingested file record. `(kb_id, file_hash)` is unique; a duplicate upload
/// resolves to the existing row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub kb_id: i64,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub file_hash: String,
    pub storage_path: String,
    pub chunk_count: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub processed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Chunk
// ============================================================================

/// Text chunk row referencing its vector-store record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChunkRecord {
    pub id: i64,
    pub kb_id: i64,
    pub file_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub vector_id: String,
    pub created_at: String,
}

/// The load-bearing vector-store id convention for a chunk.
pub fn vector_id(file_id: i64, chunk_index: usize) -> String {
    format!("file_{}_chunk_{}", file_id, chunk_index)
}

// ============================================================================
// Assistant
// ============================================================================

/// Assistant persona: system prompt, bound KB list, LLM binding. KB
/// references are weak (by id); deleting a KB does not cascade here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssistantRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Bound knowledge base ids, comma separated.
    pub kb_ids: String,
    /// Derived from the bound KBs; None when no KBs are bound.
    pub embedding_model: Option<String>,
    pub llm_model: String,
    pub llm_provider: String,
    pub system_prompt: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl AssistantRecord {
    /// Parse the comma-separated KB list, ignoring malformed entries.
    pub fn kb_id_list(&self) -> Vec<i64> {
        self.kb_ids
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .collect()
    }
}

/// Join a KB id list back into its stored form.
pub fn kb_ids_to_string(kb_ids: &[i64]) -> String {
    kb_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Conversation / Message
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConversationRecord {
    pub id: i64,
    pub assistant_id: i64,
    pub title: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    /// "system", "user", or "assistant".
    pub role: String,
    pub content: String,
    /// JSON array of source attributions, present on assistant turns that
    /// were grounded in retrieval.
    pub sources: Option<String>,
    pub created_at: String,
}
