// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::sync::Arc;

use offline_llm_runtime::backend::mock::MockStats;
use offline_llm_runtime::backend::{MockBackend, MockBackendConfig};
use offline_llm_runtime::{
    ChatController, LifecycleState, LoadOptions, ModelLifecycle, RuntimeConfig, RuntimeError,
};

const MODEL: &str = "/models/tiny-llama.gguf";

fn setup(config: MockBackendConfig) -> (Arc<ModelLifecycle>, Arc<MockStats>) {
    let runtime_config = RuntimeConfig {
        warm_up: false,
        ..Default::default()
    };
    let backend = MockBackend::new(config);
    let stats = backend.stats();
    (
        Arc::new(ModelLifecycle::new(Arc::new(backend), &runtime_config)),
        stats,
    )
}

#[tokio::test]
async fn test_unload_without_model_succeeds() {
    let (lifecycle, stats) = setup(MockBackendConfig::default());

    assert!(lifecycle.unload_model().await);
    assert_eq!(lifecycle.get_state(), LifecycleState::Unloaded);
    assert!(stats.events().is_empty());
}

#[tokio::test]
async fn test_teardown_order() {
    let (lifecycle, stats) = setup(MockBackendConfig::default());
    assert!(lifecycle
        .load_model(MODEL, LoadOptions::default())
        .await
        .unwrap());

    let chat = ChatController::new(lifecycle.clone());
    chat.create_session(Some("You are terse.")).await.unwrap();
    // Creates the embedding context lazily
    lifecycle.embed("warm the embedder").await.unwrap();

    assert!(lifecycle.unload_model().await);

    assert_eq!(lifecycle.get_state(), LifecycleState::Unloaded);
    assert!(!chat.has_session().await);
    assert_eq!(
        stats.events(),
        vec![
            "model:load",
            "context:create",
            "embedding:create",
            "context:dispose",
            "embedding:dispose",
            "model:dispose",
        ]
    );
}

#[tokio::test]
async fn test_failed_dispose_still_unloads() {
    let (lifecycle, _stats) = setup(MockBackendConfig {
        fail_dispose: true,
        ..Default::default()
    });
    assert!(lifecycle
        .load_model(MODEL, LoadOptions::default())
        .await
        .unwrap());

    assert!(!lifecycle.unload_model().await);
    assert_eq!(lifecycle.get_state(), LifecycleState::Unloaded);
    assert!(lifecycle.model_info().await.is_none());

    // The slot is free again
    assert!(lifecycle
        .load_model(MODEL, LoadOptions::default())
        .await
        .unwrap());
}

#[tokio::test]
async fn test_reload_reports_dispose_failure() {
    let (lifecycle, _stats) = setup(MockBackendConfig {
        fail_dispose: true,
        ..Default::default()
    });
    assert!(lifecycle
        .load_model(MODEL, LoadOptions::default())
        .await
        .unwrap());

    let err = lifecycle
        .load_model("/models/other.gguf", LoadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::DisposeFailed(_)));
    assert_eq!(lifecycle.get_state(), LifecycleState::Unloaded);
}

#[tokio::test]
async fn test_embed_after_unload_fails() {
    let (lifecycle, _stats) = setup(MockBackendConfig::default());
    assert!(lifecycle
        .load_model(MODEL, LoadOptions::default())
        .await
        .unwrap());
    assert!(lifecycle.unload_model().await);

    let err = lifecycle.embed("text").await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotLoaded));
}

#[tokio::test]
async fn test_load_unload_load_with_same_arguments() {
    let (lifecycle, stats) = setup(MockBackendConfig::default());
    let options = LoadOptions {
        context_size: Some(1024),
        gpu_layers: Some(0),
        ..Default::default()
    };

    assert!(lifecycle.load_model(MODEL, options.clone()).await.unwrap());
    assert!(lifecycle.unload_model().await);
    assert_eq!(lifecycle.get_state(), LifecycleState::Unloaded);
    assert!(lifecycle.load_model(MODEL, options).await.unwrap());

    assert!(lifecycle.is_loaded());
    assert_eq!(stats.load_count(), 2);
}
