//! Retrieval scenarios: single-KB, multi-KB fan-in, hybrid fusion and
//! degradation.

use crate::core::retrieval::{RetrievalError, RetrievalSource};
use crate::core::storage::graph::{GraphEntity, GraphRelation};

use super::common::fixtures::{test_engine, StubLlmMode, TestEngineOptions};

async fn seeded_kb(
    services: &crate::core::services::Services,
    name: &str,
    model: &str,
    docs: &[(&str, &[u8])],
) -> i64 {
    let kb = services
        .create_knowledge_base(name, None, Some(model), Some("remote"))
        .await
        .unwrap();
    for (filename, bytes) in docs {
        let file = services
            .files
            .save(&services.catalog, kb.id, filename, bytes)
            .await
            .unwrap();
        services.ingest_file(kb.id, file.id, "client-1", false).await;
    }
    kb.id
}

#[tokio::test]
async fn test_single_kb_search_ranks_exact_match_first() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let kb_id = seeded_kb(
        services,
        "docs",
        "m1",
        &[("doc.txt", b"alpha passage\n\nbeta passage\n\ngamma passage")],
    )
    .await;

    // The whole file fits one chunk at the default chunk size, so search
    // with the exact chunk text: similarity must be ~1 and the filename
    // must be joined on.
    let results = services
        .retriever
        .search_kb(kb_id, "alpha passage\n\nbeta passage\n\ngamma passage", 5, None)
        .await
        .unwrap();

    assert!(!results.is_empty());
    let top = &results[0];
    assert!(top.similarity > 0.99, "exact text must score ~1.0, got {}", top.similarity);
    assert_eq!(top.filename.as_deref(), Some("doc.txt"));
    assert_eq!(top.source, RetrievalSource::Vector);
    assert!(top.chunk_id.as_deref().unwrap().starts_with("file_"));
}

#[tokio::test]
async fn test_search_empty_kb_returns_no_results() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("empty", None, Some("m1"), Some("remote"))
        .await
        .unwrap();

    let results = services.retriever.search_kb(kb.id, "anything", 5, None).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_multi_kb_mismatch_rejected_before_any_io() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let a = services
        .create_knowledge_base("a", None, Some("m1"), Some("remote"))
        .await
        .unwrap();
    let b = services
        .create_knowledge_base("b", None, Some("m2"), Some("remote"))
        .await
        .unwrap();

    let before = engine.embedder.call_count();
    let err = services
        .retriever
        .search_many(&[a.id, b.id], "x", 5, None)
        .await
        .unwrap_err();

    assert!(matches!(err, RetrievalError::EmbeddingConfigMismatch(_)));
    assert_eq!(
        engine.embedder.call_count(),
        before,
        "the gate must fire before any embedding I/O"
    );
}

#[tokio::test]
async fn test_multi_kb_merges_and_sorts() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let a = seeded_kb(services, "a", "m1", &[("one.txt", b"the moon orbits the earth")]).await;
    let b = seeded_kb(services, "b", "m1", &[("two.txt", b"the earth orbits the sun")]).await;

    let results = services
        .retriever
        .search_many(&[a, b], "the moon orbits the earth", 5, Some(0.0))
        .await
        .unwrap();

    assert!(results.len() >= 2);
    // Globally sorted by similarity descending; the exact match leads.
    assert!(results[0].similarity >= results[1].similarity);
    assert_eq!(results[0].kb_id, a);
    assert!(results[0].similarity > 0.99);
}

#[tokio::test]
async fn test_multi_kb_skips_unknown_ids() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let a = seeded_kb(services, "a", "m1", &[("one.txt", b"known content here")]).await;

    let results = services
        .retriever
        .search_many(&[a, 9999], "known content here", 5, Some(0.0))
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_hybrid_without_graph_degrades_to_vector_only() {
    // Graph disabled entirely: hybrid queries still succeed.
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let kb_id = seeded_kb(
        services,
        "docs",
        "m1",
        &[("doc.txt", b"Alice works at Acme in Paris")],
    )
    .await;

    let results = services
        .retriever
        .hybrid_search(&[kb_id], "Alice works at Acme in Paris", 5)
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.source == RetrievalSource::Vector));
}

#[tokio::test]
async fn test_hybrid_fuses_graph_evidence() {
    // The stub LLM answers every extraction prompt with a fixed entity
    // payload, so the query extracts "Alice".
    let extraction_json = r#"{"entities": [{"name": "Alice", "type": "Person"}], "relations": []}"#;
    let engine = test_engine(TestEngineOptions {
        graph_enabled: true,
        llm_mode: StubLlmMode::Fixed(extraction_json.to_string()),
        ..Default::default()
    })
    .await;
    let services = &engine.services;

    let kb_id = seeded_kb(
        services,
        "docs",
        "m1",
        &[("doc.txt", b"Alice works at Acme in Paris")],
    )
    .await;

    // Seed the graph scope directly.
    let graph = services.graph.as_ref().unwrap();
    graph
        .batch_upsert_entities(
            kb_id,
            vec![
                GraphEntity::new("Alice", "Person"),
                GraphEntity::new("Acme", "Organization"),
            ],
        )
        .await
        .unwrap();
    graph
        .batch_upsert_relations(kb_id, vec![GraphRelation::new("Alice", "Acme", "works_at")])
        .await
        .unwrap();

    let results = services
        .retriever
        .hybrid_search(&[kb_id], "Where does Alice work?", 10)
        .await
        .unwrap();

    let direct: Vec<_> = results
        .iter()
        .filter(|r| r.source == RetrievalSource::GraphDirect)
        .collect();
    assert_eq!(direct.len(), 1, "expected one direct entity hit");
    assert!(direct[0].content.contains("Alice"));
    // Direct hit: 0.9 x graph weight 0.3.
    assert!((direct[0].similarity - 0.27).abs() < 1e-5);

    let related: Vec<_> = results
        .iter()
        .filter(|r| r.source == RetrievalSource::GraphRelated)
        .collect();
    assert_eq!(related.len(), 1);
    assert!(related[0].content.contains("works_at"));
    // One hop: 0.7 x 0.3.
    assert!((related[0].similarity - 0.21).abs() < 1e-5);
}

#[tokio::test]
async fn test_score_threshold_filters_results() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let kb_id = seeded_kb(services, "docs", "m1", &[("doc.txt", b"completely unrelated text")]).await;

    // An impossible threshold drops everything.
    let results = services
        .retriever
        .search_kb(kb_id, "zzz different query zzz", 5, Some(0.999))
        .await
        .unwrap();
    assert!(results.is_empty());
}
