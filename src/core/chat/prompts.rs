//! Prompt composition for grounded chat.
//!
//! Three user-message shapes: history + retrieved context (with an
//! explicit clause making the conversation history win over the context
//! when they conflict), context only (grounded QA), and the raw query.
//! The system prompt gains a remember-prior-conversation clause whenever
//! history is present.

use crate::core::llm::{ChatMessage, MessageRole};
use crate::core::retrieval::RetrievedChunk;

/// History-over-context rule, verbatim in the composed prompt.
pub const HISTORY_PRIORITY_CLAUSE: &str =
    "Rules: if the earlier conversation established a rule or fact (even one that contradicts \
     common knowledge), answer according to the conversation. The conversation history takes \
     priority over the reference material whenever they conflict. Use the reference material \
     only when the history has nothing relevant. Answer directly, without explaining your \
     reasoning.";

/// Grounded-QA instruction used when there is context but no history.
pub const UNKNOWN_ANSWER_CLAUSE: &str =
    "Answer the question using the context below. If the context does not contain the answer, \
     say you do not know.";

/// System-prompt augmentation for conversations with history.
pub const REMEMBER_CLAUSE: &str =
    "Remember the prior conversation and honor any agreements made in it, even when they \
     contradict common knowledge.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Canned reply when retrieval over bound knowledge bases finds nothing.
pub const NO_EVIDENCE_ANSWER: &str =
    "I could not find relevant information in the knowledge base. Try rephrasing the question \
     or check the knowledge base contents.";

/// Messages older than this (from the window's tail) are summarized into
/// the history block of the user message.
const HISTORY_SUMMARY_MESSAGES: usize = 4;
/// Per-message truncation inside the history block.
const HISTORY_SUMMARY_CHARS: usize = 100;

/// Render retrieved passages into a context block.
pub fn build_context(results: &[RetrievedChunk]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "[Document {}] (similarity: {:.1}%)\n{}\n",
                i + 1,
                r.similarity * 100.0,
                r.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compose the user message from query, optional context, and history.
pub fn build_user_message(
    query: &str,
    context: Option<&str>,
    history: &[ChatMessage],
) -> String {
    match context {
        Some(context) if !history.is_empty() => {
            let summary: Vec<String> = history
                .iter()
                .rev()
                .take(HISTORY_SUMMARY_MESSAGES)
                .rev()
                .map(|m| {
                    let content: String = m.content.chars().take(HISTORY_SUMMARY_CHARS).collect();
                    if content.len() < m.content.len() {
                        format!("{}: {}...", m.role, content)
                    } else {
                        format!("{}: {}", m.role, content)
                    }
                })
                .collect();

            format!(
                "Important — what we agreed on earlier in this conversation:\n{}\n\n---\n\n\
                 Reference material:\n{}\n\n---\n\nQuestion: {}\n\n{}\n\nAnswer:",
                summary.join("\n"),
                context,
                query,
                HISTORY_PRIORITY_CLAUSE
            )
        }
        Some(context) => {
            format!(
                "{}\n\nContext:\n{}\n\nQuestion: {}\n\nAnswer:",
                UNKNOWN_ANSWER_CLAUSE, context, query
            )
        }
        None => query.to_string(),
    }
}

/// Assemble the full message list: system prompt (augmented when history is
/// present), the history window, and the composed user message.
pub fn build_messages(
    user_message: String,
    history: &[ChatMessage],
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    if !history.is_empty() {
        let base = system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);
        messages.push(ChatMessage::system(format!("{}\n\n{}", base, REMEMBER_CLAUSE)));
    } else if let Some(prompt) = system_prompt {
        messages.push(ChatMessage::system(prompt));
    }

    for message in history {
        messages.push(message.clone());
    }

    messages.push(ChatMessage::user(user_message));
    messages
}

/// Parse a stored message role; rows with unknown roles are dropped from
/// the prompt rather than guessed.
pub fn parse_role(role: &str) -> Option<MessageRole> {
    match role {
        "system" => Some(MessageRole::System),
        "user" => Some(MessageRole::User),
        "assistant" => Some(MessageRole::Assistant),
        _ => None,
    }
}
