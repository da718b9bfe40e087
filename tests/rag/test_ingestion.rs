// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use offline_llm_runtime::backend::{MockBackend, MockBackendConfig};
use offline_llm_runtime::config::ChunkingConfig;
use offline_llm_runtime::embeddings::ModelEmbedder;
use offline_llm_runtime::errors::Result;
use offline_llm_runtime::rag::{EmbeddingPipeline, IngestProgress, DOCUMENTS_TABLE};
use offline_llm_runtime::vector::{VectorRow, VectorTable};
use offline_llm_runtime::{
    InMemoryRecordStore, LoadOptions, LocalVectorStore, ModelLifecycle, RecordStore,
    RuntimeConfig, RuntimeError, VectorStore,
};

mock! {
    pub Vectors {}

    #[async_trait]
    impl VectorStore for Vectors {
        async fn list_tables(&self) -> Result<Vec<String>>;
        async fn create_table(&self, name: &str, rows: Vec<VectorRow>) -> Result<Arc<dyn VectorTable>>;
        async fn open_table(&self, name: &str) -> Result<Arc<dyn VectorTable>>;
        async fn drop_table(&self, name: &str) -> Result<()>;
    }
}

async fn loaded_lifecycle() -> Arc<ModelLifecycle> {
    let config = RuntimeConfig {
        warm_up: false,
        ..Default::default()
    };
    let backend = MockBackend::new(MockBackendConfig {
        embedding_dimension: 256,
        ..Default::default()
    });
    let lifecycle = Arc::new(ModelLifecycle::new(Arc::new(backend), &config));
    assert!(lifecycle
        .load_model("/models/tiny.gguf", LoadOptions::default())
        .await
        .unwrap());
    lifecycle
}

fn small_chunks() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 20,
        chunk_overlap: 5,
    }
}

#[tokio::test]
async fn test_ingest_writes_record_and_vectors() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("colors.txt");
    tokio::fs::write(&file, "The sky is blue. The grass is green.")
        .await
        .unwrap();

    let vectors = Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap());
    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        vectors.clone(),
        records.clone(),
        &small_chunks(),
    )
    .unwrap();

    let report = pipeline.ingest_file(&file).await.unwrap();

    assert_eq!(report.title, "colors.txt");
    assert_eq!(report.chunks, 3);

    let document = records.get_document(&report.document_id).await.unwrap().unwrap();
    assert_eq!(document.content, "The sky is blue. The grass is green.");
    assert_eq!(document.file_type.as_deref(), Some("txt"));

    let table = vectors.open_table(DOCUMENTS_TABLE).await.unwrap();
    assert_eq!(table.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_ingest_replaces_previous_corpus() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.md");
    let second = dir.path().join("second.txt");
    tokio::fs::write(&first, "# Notes\n\nThe sky is blue.").await.unwrap();
    tokio::fs::write(&second, "The grass is green.").await.unwrap();

    let vectors = Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap());
    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        vectors.clone(),
        records.clone(),
        &ChunkingConfig::default(),
    )
    .unwrap();

    pipeline.ingest_file(&first).await.unwrap();
    let report = pipeline.ingest_file(&second).await.unwrap();

    let documents = records.list_documents().await.unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, report.document_id);

    let table = vectors.open_table(DOCUMENTS_TABLE).await.unwrap();
    assert_eq!(table.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_progress_updates() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("colors.txt");
    tokio::fs::write(&file, "The sky is blue. The grass is green.")
        .await
        .unwrap();

    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap()),
        Arc::new(InMemoryRecordStore::new()),
        &small_chunks(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    pipeline.ingest_file_with_progress(&file, Some(tx)).await.unwrap();

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }

    assert_eq!(updates[0], IngestProgress::TextExtracted { characters: 36 });
    assert!(matches!(updates[1], IngestProgress::DocumentCreated { .. }));
    assert_eq!(updates[2], IngestProgress::Chunked { chunks: 3 });
    assert_eq!(
        updates.last(),
        Some(&IngestProgress::VectorsWritten { rows: 3 })
    );
}

#[tokio::test]
async fn test_ingest_requires_loaded_model() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("colors.txt");
    tokio::fs::write(&file, "The sky is blue.").await.unwrap();

    let lifecycle = Arc::new(ModelLifecycle::new(
        Arc::new(MockBackend::new(MockBackendConfig::default())),
        &RuntimeConfig::default(),
    ));
    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(lifecycle)),
        Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap()),
        records.clone(),
        &ChunkingConfig::default(),
    )
    .unwrap();

    let err = pipeline.ingest_file(&file).await.unwrap_err();

    assert!(matches!(err, RuntimeError::NotLoaded));
    assert!(records.list_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_file_type() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("slides.pptx");
    tokio::fs::write(&file, b"not really slides").await.unwrap();

    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap()),
        records.clone(),
        &ChunkingConfig::default(),
    )
    .unwrap();

    let err = pipeline.ingest_file(&file).await.unwrap_err();

    assert!(matches!(err, RuntimeError::UnsupportedFileType(ref ext) if ext == "pptx"));
    assert!(records.list_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_file_creates_record_without_vectors() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("empty.txt");
    tokio::fs::write(&file, "  \n\n ").await.unwrap();

    let vectors = Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap());
    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        vectors.clone(),
        records.clone(),
        &ChunkingConfig::default(),
    )
    .unwrap();

    let report = pipeline.ingest_file(&file).await.unwrap();

    assert_eq!(report.chunks, 0);
    assert_eq!(records.list_documents().await.unwrap().len(), 1);
    assert!(vectors.list_tables().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_vector_failure_leaves_orphan_record() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("colors.txt");
    tokio::fs::write(&file, "The sky is blue. The grass is green.")
        .await
        .unwrap();

    let mut vectors = MockVectors::new();
    vectors.expect_list_tables().returning(|| Ok(Vec::new()));
    vectors
        .expect_create_table()
        .times(1)
        .returning(|_, _| Err(RuntimeError::VectorStore("disk full".to_string())));

    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        Arc::new(vectors),
        records.clone(),
        &small_chunks(),
    )
    .unwrap();

    let err = pipeline.ingest_file(&file).await.unwrap_err();

    assert!(matches!(err, RuntimeError::VectorStore(_)));
    // No cross-store transaction: the record stays behind
    assert_eq!(records.list_documents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_all_embeddings() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("colors.txt");
    tokio::fs::write(&file, "The sky is blue.").await.unwrap();

    let vectors = Arc::new(LocalVectorStore::open(dir.path().join("vectors")).await.unwrap());
    let records = Arc::new(InMemoryRecordStore::new());
    let pipeline = EmbeddingPipeline::new(
        Arc::new(ModelEmbedder::new(loaded_lifecycle().await)),
        vectors.clone(),
        records.clone(),
        &ChunkingConfig::default(),
    )
    .unwrap();
    pipeline.ingest_file(&file).await.unwrap();

    pipeline.delete_all_embeddings().await.unwrap();

    assert!(vectors.list_tables().await.unwrap().is_empty());
    assert!(records.list_documents().await.unwrap().is_empty());
    // Nothing left to delete is still fine
    pipeline.delete_all_embeddings().await.unwrap();
}
