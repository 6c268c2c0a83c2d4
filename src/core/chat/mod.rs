//! Chat Orchestrator
//!
//! The query-time composition engine: loads the history window, persists
//! the user turn, retrieves evidence (vector or hybrid), composes the
//! grounded prompt, releases local embedding memory before generation, and
//! streams or returns the answer, persisting the assistant turn on
//! completion.
//!
//! Turn persistence is serialized per conversation: a per-conversation
//! async mutex is held from before the user turn is written until the
//! assistant turn lands (or the turn is abandoned). Cancelled streams do
//! not persist a partial assistant turn; the user turn remains.

pub mod prompts;
pub mod stream;

pub use stream::{ChatEvent, SourceRef, SourcesPayload};

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::config::ChatConfig;
use crate::core::embedding::{EmbeddingProviderKind, EmbeddingService};
use crate::core::llm::{ChatMessage, LlmError, LlmProviderKind, LlmService};
use crate::core::retrieval::{RetrievalError, RetrievedChunk, Retriever};
use crate::database::models::AssistantRecord;
use crate::database::{CatalogError, ConversationOps, Database, KnowledgeBaseOps};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(i64),

    #[error("assistant not found: {0}")]
    AssistantNotFound(i64),

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

// ============================================================================
// Requests / Outcomes
// ============================================================================

/// One chat turn against a conversation.
#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub conversation_id: i64,
    pub query: String,
    /// Fuse graph evidence into retrieval.
    pub hybrid: bool,
    pub temperature: Option<f32>,
    pub max_history_turns: Option<usize>,
    pub top_k: Option<usize>,
}

impl ChatTurnRequest {
    pub fn new(conversation_id: i64, query: impl Into<String>) -> Self {
        Self {
            conversation_id,
            query: query.into(),
            hybrid: false,
            temperature: None,
            max_history_turns: None,
            top_k: None,
        }
    }
}

/// Result of a non-streaming chat turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub retrieval_count: usize,
}

/// Generation defaults inherited from the LLM configuration.
#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
}

// ============================================================================
// Conversation Locks
// ============================================================================

/// Per-conversation serialization: turn N's assistant write completes
/// before turn N+1's user write is accepted.
#[derive(Default)]
struct ConversationLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct ChatOrchestrator {
    catalog: Database,
    retriever: Arc<Retriever>,
    llm: Arc<LlmService>,
    embeddings: Arc<EmbeddingService>,
    config: ChatConfig,
    defaults: GenerationDefaults,
    locks: ConversationLocks,
}

/// Everything assembled before generation starts. The lock guard rides
/// along so it survives into the streaming task.
struct PreparedTurn {
    conversation_id: i64,
    assistant: AssistantRecord,
    guard: OwnedMutexGuard<()>,
    /// None: no KBs bound (pure chat). Some: retrieval ran.
    retrieved: Option<Vec<RetrievedChunk>>,
    messages: Vec<ChatMessage>,
    llm_kind: LlmProviderKind,
    temperature: f32,
}

impl ChatOrchestrator {
    pub fn new(
        catalog: Database,
        retriever: Arc<Retriever>,
        llm: Arc<LlmService>,
        embeddings: Arc<EmbeddingService>,
        config: ChatConfig,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            catalog,
            retriever,
            llm,
            embeddings,
            config,
            defaults,
            locks: ConversationLocks::default(),
        }
    }

    /// Load history, persist the user turn, retrieve, compose the prompt,
    /// and release local embedding memory. Holds the conversation lock on
    /// return.
    async fn prepare(&self, request: &ChatTurnRequest) -> Result<PreparedTurn> {
        let conversation = self
            .catalog
            .get_conversation(request.conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound(request.conversation_id))?;

        let assistant = {
            use crate::database::AssistantOps;
            self.catalog
                .get_assistant(conversation.assistant_id)
                .await?
                .ok_or(ChatError::AssistantNotFound(conversation.assistant_id))?
        };

        let llm_kind = LlmProviderKind::parse(&assistant.llm_provider)?;
        let guard = self.locks.acquire(conversation.id).await;

        // 1. History window, oldest first.
        let window = 2 * request
            .max_history_turns
            .unwrap_or(self.config.max_history_turns) as i64;
        let mut records = self.catalog.recent_messages(conversation.id, window).await?;
        records.reverse();
        let history: Vec<ChatMessage> = records
            .iter()
            .filter_map(|m| {
                prompts::parse_role(&m.role).map(|role| ChatMessage {
                    role,
                    content: m.content.clone(),
                })
            })
            .collect();

        // 2. Persist the user turn before anything can fail downstream.
        self.catalog
            .append_message(conversation.id, "user", &request.query, None)
            .await?;

        // 3. Retrieve when KBs are bound.
        let kb_ids = assistant.kb_id_list();
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        let retrieved = if kb_ids.is_empty() {
            None
        } else if request.hybrid {
            Some(
                self.retriever
                    .hybrid_search(&kb_ids, &request.query, top_k)
                    .await?,
            )
        } else {
            Some(
                self.retriever
                    .search_many(&kb_ids, &request.query, top_k, None)
                    .await?,
            )
        };

        // 4. Compose the prompt.
        let context = retrieved.as_deref().and_then(|results| {
            if results.is_empty() {
                None
            } else {
                Some(prompts::build_context(results))
            }
        });
        let user_message = prompts::build_user_message(&request.query, context.as_deref(), &history);
        let messages =
            prompts::build_messages(user_message, &history, assistant.system_prompt.as_deref());

        // 5. Free local embedding memory before generation competes for it.
        if retrieved.as_deref().map(|r| !r.is_empty()).unwrap_or(false) {
            if let Some(kb_id) = kb_ids.first() {
                if let Ok(Some(kb)) = self.catalog.get_knowledge_base(*kb_id).await {
                    if let Ok(EmbeddingProviderKind::Local) =
                        EmbeddingProviderKind::parse(&kb.embedding_provider)
                    {
                        self.embeddings
                            .unload(EmbeddingProviderKind::Local, None)
                            .await;
                    }
                }
            }
        }

        Ok(PreparedTurn {
            conversation_id: conversation.id,
            assistant,
            guard,
            retrieved,
            messages,
            llm_kind,
            temperature: request.temperature.unwrap_or(self.defaults.temperature),
        })
    }

    fn sources_of(retrieved: &[RetrievedChunk]) -> (Vec<SourceRef>, String) {
        let sources: Vec<SourceRef> = retrieved.iter().take(5).map(SourceRef::from_chunk).collect();
        let json = serde_json::to_string(&sources).unwrap_or_else(|_| "[]".to_string());
        (sources, json)
    }

    /// Non-streaming chat turn.
    pub async fn chat(&self, request: ChatTurnRequest) -> Result<ChatOutcome> {
        let turn = self.prepare(&request).await?;
        let PreparedTurn {
            conversation_id,
            guard,
            retrieved,
            messages,
            llm_kind,
            temperature,
            assistant,
        } = turn;

        // Bound KBs with no evidence: canned answer, no generation.
        if let Some(results) = &retrieved {
            if results.is_empty() {
                tracing::warn!(conversation_id, "no evidence retrieved");
                self.catalog
                    .append_message(
                        conversation_id,
                        "assistant",
                        prompts::NO_EVIDENCE_ANSWER,
                        Some("[]"),
                    )
                    .await?;
                drop(guard);
                return Ok(ChatOutcome {
                    answer: prompts::NO_EVIDENCE_ANSWER.to_string(),
                    sources: Vec::new(),
                    retrieval_count: 0,
                });
            }
        }

        let answer = self
            .llm
            .chat(
                llm_kind,
                &assistant.llm_model,
                &messages,
                temperature,
                Some(self.defaults.max_tokens),
            )
            .await?;

        let (sources, sources_json) = retrieved
            .as_deref()
            .map(Self::sources_of)
            .unwrap_or_else(|| (Vec::new(), "[]".to_string()));

        self.catalog
            .append_message(conversation_id, "assistant", &answer, Some(&sources_json))
            .await?;
        drop(guard);

        Ok(ChatOutcome {
            retrieval_count: retrieved.map(|r| r.len()).unwrap_or(0),
            answer,
            sources,
        })
    }

    /// Streaming chat turn: a `sources` event (when KBs are bound), ordered
    /// `text` fragments, then `done`. The assistant turn is persisted only
    /// on `done`; dropping the receiver abandons the generation with the
    /// user turn already durable.
    pub async fn chat_stream(
        &self,
        request: ChatTurnRequest,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let turn = self.prepare(&request).await?;
        let (tx, rx) = mpsc::channel(64);

        let catalog = self.catalog.clone();
        let llm = self.llm.clone();
        let max_tokens = self.defaults.max_tokens;

        tokio::spawn(async move {
            // The guard lives for the whole turn, including persistence.
            let _guard = turn.guard;
            let conversation_id = turn.conversation_id;

            if let Some(results) = &turn.retrieved {
                let event =
                    ChatEvent::sources(results, 5, turn.assistant.embedding_model.clone());
                if tx.send(event).await.is_err() {
                    return;
                }

                if results.is_empty() {
                    let _ = tx.send(ChatEvent::text(prompts::NO_EVIDENCE_ANSWER)).await;
                    let _ = tx.send(ChatEvent::done()).await;
                    if let Err(e) = catalog
                        .append_message(
                            conversation_id,
                            "assistant",
                            prompts::NO_EVIDENCE_ANSWER,
                            Some("[]"),
                        )
                        .await
                    {
                        tracing::error!(conversation_id, "failed to persist canned answer: {}", e);
                    }
                    return;
                }
            }

            let mut fragments = match llm
                .chat_stream(
                    turn.llm_kind,
                    &turn.assistant.llm_model,
                    &turn.messages,
                    turn.temperature,
                    Some(max_tokens),
                )
                .await
            {
                Ok(fragments) => fragments,
                Err(e) => {
                    tracing::error!(conversation_id, "generation failed to start: {}", e);
                    let _ = tx.send(ChatEvent::error(e.to_string())).await;
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(fragment) = fragments.recv().await {
                match fragment {
                    Ok(text) => {
                        answer.push_str(&text);
                        if tx.send(ChatEvent::text(text)).await.is_err() {
                            // Consumer cancelled: abandon without persisting
                            // the partial assistant turn.
                            tracing::info!(conversation_id, "stream cancelled by consumer");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(conversation_id, "generation failed mid-stream: {}", e);
                        let _ = tx.send(ChatEvent::error(e.to_string())).await;
                        return;
                    }
                }
            }

            if tx.send(ChatEvent::done()).await.is_err() {
                return;
            }

            let sources_json = turn
                .retrieved
                .as_deref()
                .map(|r| Self::sources_of(r).1)
                .unwrap_or_else(|| "[]".to_string());
            if let Err(e) = catalog
                .append_message(conversation_id, "assistant", &answer, Some(&sources_json))
                .await
            {
                tracing::error!(conversation_id, "failed to persist assistant turn: {}", e);
            }
        });

        Ok(rx)
    }
}
