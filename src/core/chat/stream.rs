//! Chat stream events and SSE framing.
//!
//! Streaming chat emits a `sources` event, ordered `text` fragments, and a
//! terminal `done` (or `error`). The wire envelope is
//! `{"type": "sources" | "text" | "done" | "error", "data": ...}`, framed
//! for Server-Sent Events as `data: <json>\n\n`.

use serde::{Deserialize, Serialize};

use crate::core::retrieval::{RetrievalSource, RetrievedChunk};

/// Characters of passage content carried in a source attribution.
const SOURCE_PREVIEW_CHARS: usize = 200;

/// One entry of an answer's source attribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub content: String,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub source: RetrievalSource,
}

impl SourceRef {
    pub fn from_chunk(chunk: &RetrievedChunk) -> Self {
        let mut content: String = chunk.content.chars().take(SOURCE_PREVIEW_CHARS).collect();
        if content.len() < chunk.content.len() {
            content.push_str("...");
        }
        Self {
            content,
            similarity: chunk.similarity,
            file_id: chunk.file_id,
            filename: chunk.filename.clone(),
            source: chunk.source,
        }
    }
}

/// Payload of the `sources` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcesPayload {
    pub sources: Vec<SourceRef>,
    pub retrieval_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

/// Payload of the terminal `done` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DonePayload {}

/// Payload of the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}

/// A chat stream event in wire-envelope form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    Sources(SourcesPayload),
    Text(String),
    Done(DonePayload),
    Error(ErrorPayload),
}

impl ChatEvent {
    pub fn sources(
        chunks: &[RetrievedChunk],
        top: usize,
        embedding_model: Option<String>,
    ) -> Self {
        Self::Sources(SourcesPayload {
            sources: chunks.iter().take(top).map(SourceRef::from_chunk).collect(),
            retrieval_count: chunks.len(),
            embedding_model,
        })
    }

    pub fn text(fragment: impl Into<String>) -> Self {
        Self::Text(fragment.into())
    }

    pub fn done() -> Self {
        Self::Done(DonePayload::default())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            error: message.into(),
        })
    }

    /// Frame this event for an SSE sink: one `data: <json>` line and a
    /// blank line.
    pub fn to_sse(&self) -> String {
        // Serialization of these enums cannot fail; fall back to an error
        // envelope just in case.
        let json = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":{"error":"serialization"}}"#.to_string());
        format!("data: {}\n\n", json)
    }
}

/// Response headers an SSE sink should set: no caching, keep-alive, and a
/// buffering-off hint for reverse proxies.
pub fn sse_headers() -> [(&'static str, &'static str); 3] {
    [
        ("Cache-Control", "no-cache"),
        ("Connection", "keep-alive"),
        ("X-Accel-Buffering", "no"),
    ]
}
