// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use offline_llm_runtime::vector::{LocalVectorStore, VectorRow, VectorStore};
use offline_llm_runtime::RuntimeError;

fn row(content: &str, vector: Vec<f32>, index: usize) -> VectorRow {
    VectorRow {
        content: content.to_string(),
        vector,
        metadata: json!({"chunk_index": index, "source": "notes.txt"}),
    }
}

fn rows() -> Vec<VectorRow> {
    vec![
        row("north", vec![1.0, 0.0, 0.0], 0),
        row("east", vec![0.0, 1.0, 0.0], 1),
        row("north-east", vec![0.7, 0.7, 0.0], 2),
    ]
}

#[tokio::test]
async fn test_tables_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = LocalVectorStore::open(dir.path()).await.unwrap();
        store.create_table("documents", rows()).await.unwrap();
    }

    let reopened = LocalVectorStore::open(dir.path()).await.unwrap();
    assert_eq!(reopened.list_tables().await.unwrap(), vec!["documents"]);

    let table = reopened.open_table("documents").await.unwrap();
    assert_eq!(table.name(), "documents");
    assert_eq!(table.count().await.unwrap(), 3);

    let matches = table.search(&[1.0, 0.0, 0.0], 1).await.unwrap();
    assert_eq!(matches[0].content, "north");
    assert_eq!(matches[0].metadata["source"], "notes.txt");
}

#[tokio::test]
async fn test_search_orders_by_distance() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();
    let table = store.create_table("documents", rows()).await.unwrap();

    let matches = table.search(&[1.0, 0.1, 0.0], 10).await.unwrap();

    let order: Vec<&str> = matches.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(order, vec!["north", "north-east", "east"]);
    assert!(matches[0].distance < 0.01);
    assert!(matches.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[tokio::test]
async fn test_add_appends_rows() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();
    let table = store.create_table("documents", rows()).await.unwrap();

    assert_ok!(table.add(vec![row("up", vec![0.0, 0.0, 1.0], 3)]).await);

    assert_eq!(table.count().await.unwrap(), 4);
    let matches = table.search(&[0.0, 0.0, 1.0], 1).await.unwrap();
    assert_eq!(matches[0].content, "up");
}

#[tokio::test]
async fn test_rejects_mismatched_dimension() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();
    let table = store.create_table("documents", rows()).await.unwrap();

    let err = table
        .add(vec![row("flat", vec![1.0, 0.0], 3)])
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::VectorStore(_)));
    assert_eq!(table.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_rejects_non_finite_values() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();

    let result = store
        .create_table("documents", vec![row("bad", vec![f32::NAN, 1.0, 0.0], 0)])
        .await;
    assert!(matches!(result, Err(RuntimeError::VectorStore(_))));
    assert!(store.list_tables().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_existing_table_fails() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();
    store.create_table("documents", rows()).await.unwrap();

    assert!(store.create_table("documents", rows()).await.is_err());
}

#[tokio::test]
async fn test_drop_table() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();
    store.create_table("documents", rows()).await.unwrap();

    assert_ok!(store.drop_table("documents").await);

    assert!(store.list_tables().await.unwrap().is_empty());
    assert!(store.open_table("documents").await.is_err());
    assert_err!(store.drop_table("documents").await);
}

#[tokio::test]
async fn test_invalid_table_name() {
    let dir = TempDir::new().unwrap();
    let store = LocalVectorStore::open(dir.path()).await.unwrap();

    assert!(store.create_table("../escape", rows()).await.is_err());
}
