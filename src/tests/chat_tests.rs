//! Chat orchestration scenarios: history precedence, stream/persistence
//! agreement, cancellation, canned answers, and error surfacing.

use std::time::Duration;

use crate::core::chat::prompts::{
    HISTORY_PRIORITY_CLAUSE, NO_EVIDENCE_ANSWER, REMEMBER_CLAUSE,
};
use crate::core::chat::{ChatEvent, ChatTurnRequest};
use crate::database::{AssistantOps, ConversationOps, NewAssistant};

use super::common::fixtures::{test_engine, StubLlmMode, TestEngineOptions};

async fn conversation_with_assistant(
    services: &crate::core::services::Services,
    kb_ids: &[i64],
) -> i64 {
    let assistant = services
        .catalog
        .create_assistant(NewAssistant {
            name: "helper",
            description: None,
            kb_ids,
            llm_model: "stub-llm",
            llm_provider: "remote",
            system_prompt: Some("You are a careful assistant."),
        })
        .await
        .unwrap();
    services
        .catalog
        .create_conversation(assistant.id, "chat")
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_history_agreement_survives_into_prompt() {
    // Echo LLM: the answer is the composed prompt, so the test can assert
    // what the model actually saw.
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let conversation_id = conversation_with_assistant(services, &[]).await;

    // Establish the agreement in history.
    services
        .catalog
        .append_message(conversation_id, "user", "remember that 1+1=3", None)
        .await
        .unwrap();
    services
        .catalog
        .append_message(conversation_id, "assistant", "Understood: 1+1=3.", None)
        .await
        .unwrap();

    let outcome = services
        .chat
        .chat(ChatTurnRequest::new(conversation_id, "what is 1+1?"))
        .await
        .unwrap();

    // The prompt carried the agreement and the remember-the-history clause.
    assert!(outcome.answer.contains("1+1=3"));
    assert!(outcome.answer.contains(REMEMBER_CLAUSE));
    assert!(outcome.answer.contains("what is 1+1?"));
}

#[tokio::test]
async fn test_history_priority_clause_with_context() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    // A KB with content so retrieval is non-empty.
    let kb = services
        .create_knowledge_base("math", None, Some("m1"), Some("remote"))
        .await
        .unwrap();
    let file = services
        .files
        .save(&services.catalog, kb.id, "math.txt", b"Arithmetic: 1+1=2 in standard math.")
        .await
        .unwrap();
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    let conversation_id = conversation_with_assistant(services, &[kb.id]).await;
    services
        .catalog
        .append_message(conversation_id, "user", "remember that 1+1=3", None)
        .await
        .unwrap();
    services
        .catalog
        .append_message(conversation_id, "assistant", "Understood: 1+1=3.", None)
        .await
        .unwrap();

    // Query the exact indexed text so the stub embedder retrieves it.
    let outcome = services
        .chat
        .chat(ChatTurnRequest::new(
            conversation_id,
            "Arithmetic: 1+1=2 in standard math.",
        ))
        .await
        .unwrap();

    // History + context path: the explicit priority clause is present, and
    // the agreement ("3") outranks the retrieved context in the template.
    assert!(outcome.answer.contains(HISTORY_PRIORITY_CLAUSE));
    assert!(outcome.answer.contains("1+1=3"));
    assert!(!outcome.sources.is_empty());
}

#[tokio::test]
async fn test_stream_concatenation_equals_persisted_turn() {
    let fragments = vec!["The ".to_string(), "answer ".to_string(), "is 42.".to_string()];
    let engine = test_engine(TestEngineOptions {
        llm_mode: StubLlmMode::Fragments(fragments.clone()),
        ..Default::default()
    })
    .await;
    let services = &engine.services;

    let conversation_id = conversation_with_assistant(services, &[]).await;

    let mut events = services
        .chat
        .chat_stream(ChatTurnRequest::new(conversation_id, "question?"))
        .await
        .unwrap();

    let mut streamed = String::new();
    let mut done = false;
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Text(fragment) => streamed.push_str(&fragment),
            ChatEvent::Done(_) => done = true,
            ChatEvent::Sources(_) => {}
            ChatEvent::Error(e) => panic!("unexpected error event: {:?}", e),
        }
    }
    assert!(done);
    assert_eq!(streamed, fragments.concat());

    // Give the post-done persistence a moment, then verify the stored turn
    // equals the streamed concatenation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = services.catalog.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, streamed);

    let conversation = services
        .catalog
        .get_conversation(conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.message_count, 2);
}

#[tokio::test]
async fn test_cancellation_keeps_user_turn_drops_assistant_turn() {
    // Plenty of fragments so the consumer can hang up mid-stream.
    let fragments: Vec<String> = (0..40).map(|i| format!("frag{} ", i)).collect();
    let engine = test_engine(TestEngineOptions {
        llm_mode: StubLlmMode::Fragments(fragments),
        ..Default::default()
    })
    .await;
    let services = &engine.services;

    let conversation_id = conversation_with_assistant(services, &[]).await;

    let mut events = services
        .chat
        .chat_stream(ChatTurnRequest::new(conversation_id, "question?"))
        .await
        .unwrap();

    // Take three text fragments, then hang up.
    let mut received = 0;
    while received < 3 {
        match events.recv().await {
            Some(ChatEvent::Text(_)) => received += 1,
            Some(_) => {}
            None => panic!("stream ended before three fragments"),
        }
    }
    drop(events);

    // Let the orchestrator notice the dead sink.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let messages = services.catalog.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1, "only the user turn may be persisted");
    assert_eq!(messages[0].role, "user");

    let conversation = services
        .catalog
        .get_conversation(conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.message_count, 1);

    // The conversation is not wedged: a later turn still works.
    let outcome = services
        .chat
        .chat(ChatTurnRequest::new(conversation_id, "still there?"))
        .await
        .unwrap();
    assert!(!outcome.answer.is_empty());
}

#[tokio::test]
async fn test_empty_retrieval_yields_canned_answer_and_empty_sources() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    // Bound KB with nothing ingested: retrieval runs and finds nothing.
    let kb = services
        .create_knowledge_base("empty", None, Some("m1"), Some("remote"))
        .await
        .unwrap();
    let conversation_id = conversation_with_assistant(services, &[kb.id]).await;

    let mut events = services
        .chat
        .chat_stream(ChatTurnRequest::new(conversation_id, "anything?"))
        .await
        .unwrap();

    // Terminal sources event with an empty list comes first.
    match events.recv().await {
        Some(ChatEvent::Sources(payload)) => {
            assert!(payload.sources.is_empty());
            assert_eq!(payload.retrieval_count, 0);
        }
        other => panic!("expected sources event, got {:?}", other),
    }

    let mut text = String::new();
    let mut done = false;
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Text(fragment) => text.push_str(&fragment),
            ChatEvent::Done(_) => done = true,
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(done);
    assert_eq!(text, NO_EVIDENCE_ANSWER);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = services.catalog.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, NO_EVIDENCE_ANSWER);
    assert_eq!(messages[1].sources.as_deref(), Some("[]"));
}

#[tokio::test]
async fn test_generation_failure_emits_error_and_keeps_user_turn() {
    let engine = test_engine(TestEngineOptions {
        llm_mode: StubLlmMode::Fail,
        ..Default::default()
    })
    .await;
    let services = &engine.services;

    let conversation_id = conversation_with_assistant(services, &[]).await;

    let mut events = services
        .chat
        .chat_stream(ChatTurnRequest::new(conversation_id, "question?"))
        .await
        .unwrap();

    let mut saw_error = false;
    while let Some(event) = events.recv().await {
        if matches!(event, ChatEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = services.catalog.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");
}

#[tokio::test]
async fn test_conversation_ordering_matches_written_interleaving() {
    let engine = test_engine(TestEngineOptions {
        llm_mode: StubLlmMode::Fixed("ack".into()),
        ..Default::default()
    })
    .await;
    let services = &engine.services;

    let conversation_id = conversation_with_assistant(services, &[]).await;

    for i in 0..3 {
        services
            .chat
            .chat(ChatTurnRequest::new(conversation_id, format!("turn {}", i)))
            .await
            .unwrap();
    }

    let messages = services.catalog.list_messages(conversation_id).await.unwrap();
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, ["user", "assistant", "user", "assistant", "user", "assistant"]);

    let conversation = services
        .catalog
        .get_conversation(conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.message_count, 6);
}

#[tokio::test]
async fn test_unknown_conversation_rejected() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let err = engine
        .services
        .chat
        .chat(ChatTurnRequest::new(404, "hello"))
        .await;
    assert!(err.is_err());
}
