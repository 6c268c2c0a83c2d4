//! End-to-end ingestion scenarios.

use crate::core::progress::ProgressEvent;
use crate::database::models::vector_id;
use crate::database::{ChunkOps, FileOps, KnowledgeBaseOps, NewChunk};

use super::common::fixtures::{test_engine, StubLlmMode, TestEngineOptions};

fn small_chunk_options() -> TestEngineOptions {
    TestEngineOptions {
        chunk_size: 5,
        chunk_overlap: 0,
        graph_enabled: false,
        llm_mode: StubLlmMode::Echo,
    }
}

#[tokio::test]
async fn test_ingest_produces_chunks_vectors_and_counts() {
    let engine = test_engine(small_chunk_options()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();

    let (_sink, mut events) = services.progress.subscribe("client-1");

    let file = services
        .files
        .save(&services.catalog, kb.id, "doc.txt", b"hello\n\nworld")
        .await
        .unwrap();
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    // File row: completed, two chunks, processed_at stamped.
    let file = services.catalog.get_file(file.id).await.unwrap().unwrap();
    assert_eq!(file.status, "completed");
    assert_eq!(file.chunk_count, 2);
    assert!(file.processed_at.is_some());

    // Chunk rows reference the conventional vector ids.
    let chunks = services.catalog.list_chunks_by_file(file.id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].vector_id, vector_id(file.id, 0));
    assert_eq!(chunks[1].vector_id, vector_id(file.id, 1));

    // Vector collection holds exactly those two records.
    let collection = format!("kb_{}", kb.id);
    let stats = services.vectors.stats(&collection).await.unwrap();
    assert_eq!(stats.count, 2);
    let stored = services
        .vectors
        .get_by_ids(
            &collection,
            vec![vector_id(file.id, 0), vector_id(file.id, 1)],
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);

    // KB stats rolled up; sidecar in lockstep.
    let kb = services.catalog.get_knowledge_base(kb.id).await.unwrap().unwrap();
    assert_eq!(kb.file_count, 1);
    assert_eq!(kb.chunk_count, 2);
    let sidecar = services.metadata.read(kb.id).unwrap();
    assert_eq!(sidecar.total_files, 1);
    assert_eq!(sidecar.total_chunks, 2);

    // Progress: monotone percentages, completion last with the counts.
    let mut last_pct = 0.0f32;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Progress { progress, .. } => {
                assert!(progress >= last_pct, "progress must be monotone");
                last_pct = progress;
            }
            ProgressEvent::Complete { file_id, chunk_count, .. } => {
                completed = Some((file_id, chunk_count));
            }
            ProgressEvent::Error { error, .. } => panic!("unexpected error event: {}", error),
        }
    }
    assert_eq!(completed, Some((Some(file.id), Some(2))));
}

#[tokio::test]
async fn test_reupload_same_bytes_changes_nothing() {
    let engine = test_engine(small_chunk_options()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();

    let file = services
        .files
        .save(&services.catalog, kb.id, "doc.txt", b"hello\n\nworld")
        .await
        .unwrap();
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    let collection = format!("kb_{}", kb.id);
    let before = services.vectors.stats(&collection).await.unwrap().count;

    // Same bytes, different name: resolves to the same completed file and
    // schedules no new work.
    let again = services
        .upload_file(kb.id, "client-1", "renamed.txt", b"hello\n\nworld", false)
        .await
        .unwrap();
    assert_eq!(again.id, file.id);
    assert_eq!(again.status, "completed");

    let after = services.vectors.stats(&collection).await.unwrap().count;
    assert_eq!(before, after);
    assert_eq!(
        services.catalog.count_chunks_by_file(file.id).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_chunk_row_failure_deletes_written_vectors() {
    let engine = test_engine(small_chunk_options()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();
    let file = services
        .files
        .save(&services.catalog, kb.id, "doc.txt", b"hello\n\nworld")
        .await
        .unwrap();

    // Poison the chunk table: the pipeline's bulk insert will violate the
    // (file_id, chunk_index) uniqueness and fail after the vector upsert.
    services
        .catalog
        .insert_chunks(&[NewChunk {
            kb_id: kb.id,
            file_id: file.id,
            chunk_index: 0,
            content: "poison".into(),
            vector_id: "poison".into(),
        }])
        .await
        .unwrap();

    let (_sink, mut events) = services.progress.subscribe("client-1");
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    // The file is in error state with a message.
    let file = services.catalog.get_file(file.id).await.unwrap().unwrap();
    assert_eq!(file.status, "error");
    assert!(file.error_message.is_some());

    // The compensating delete removed the just-written vectors.
    let collection = format!("kb_{}", kb.id);
    let stats = services.vectors.stats(&collection).await.unwrap();
    assert_eq!(stats.count, 0, "no orphaned vectors may survive");

    // An error event reached the subscriber.
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ProgressEvent::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_unsupported_upload_rejected() {
    let engine = test_engine(TestEngineOptions::default()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();

    let err = services
        .upload_file(kb.id, "client-1", "binary.exe", b"MZ", false)
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_delete_file_purges_vectors_and_rows() {
    let engine = test_engine(small_chunk_options()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();
    let file = services
        .files
        .save(&services.catalog, kb.id, "doc.txt", b"hello\n\nworld")
        .await
        .unwrap();
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    services.delete_file(kb.id, file.id).await.unwrap();

    assert!(services.catalog.get_file(file.id).await.unwrap().is_none());
    assert_eq!(services.catalog.count_chunks_by_file(file.id).await.unwrap(), 0);

    let collection = format!("kb_{}", kb.id);
    assert_eq!(services.vectors.stats(&collection).await.unwrap().count, 0);

    let kb = services.catalog.get_knowledge_base(kb.id).await.unwrap().unwrap();
    assert_eq!(kb.file_count, 0);
    assert_eq!(kb.chunk_count, 0);
}

#[tokio::test]
async fn test_delete_knowledge_base_cascades_everything() {
    let engine = test_engine(small_chunk_options()).await;
    let services = &engine.services;

    let kb = services
        .create_knowledge_base("docs", None, None, Some("remote"))
        .await
        .unwrap();
    let file = services
        .files
        .save(&services.catalog, kb.id, "doc.txt", b"hello\n\nworld")
        .await
        .unwrap();
    services.ingest_file(kb.id, file.id, "client-1", false).await;

    services.delete_knowledge_base(kb.id).await.unwrap();

    assert!(services.catalog.get_knowledge_base(kb.id).await.unwrap().is_none());
    assert!(services.catalog.get_file(file.id).await.unwrap().is_none());
    assert!(services.metadata.read(kb.id).is_none());
    assert!(!services.files.kb_dir(kb.id).exists());
    assert!(services.vectors.list_collections().await.unwrap().is_empty());
}
