// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::sync::Arc;
use std::time::Duration;

use offline_llm_runtime::backend::{MockBackend, MockBackendConfig};
use offline_llm_runtime::{
    ChatController, ChatRole, InferenceOptions, InferenceOutcome, LifecycleState, LoadOptions,
    ModelLifecycle, RuntimeConfig,
};
use tokio::sync::mpsc;

async fn slow_controller() -> Arc<ChatController> {
    let runtime_config = RuntimeConfig {
        warm_up: false,
        ..Default::default()
    };
    let backend = MockBackend::new(MockBackendConfig {
        response: "one two three four five six seven eight nine ten".to_string(),
        token_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let lifecycle = Arc::new(ModelLifecycle::new(Arc::new(backend), &runtime_config));
    assert!(lifecycle
        .load_model("/models/tiny.gguf", LoadOptions::default())
        .await
        .unwrap());

    let controller = Arc::new(ChatController::new(lifecycle));
    controller.create_session(None).await.unwrap();
    controller
}

#[tokio::test]
async fn test_abort_after_first_token() {
    let controller = slow_controller().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_inference(InferenceOptions::new("count"), move |f| {
                    let _ = seen_tx.send(f.to_string());
                })
                .await
        })
    };

    let first = seen_rx.recv().await.unwrap();
    assert_eq!(first, "one ");
    assert!(controller.abort_inference());

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("aborted inference should finish promptly")
        .unwrap()
        .unwrap();

    match outcome {
        InferenceOutcome::Aborted { partial } => {
            assert!(partial.starts_with("one "));
            assert!(!partial.contains("ten"));
        }
        other => panic!("expected aborted outcome, got {:?}", other),
    }

    // Abort is a user action, the model stays usable
    assert_eq!(controller.lifecycle().get_state(), LifecycleState::Loaded);
    assert!(!controller.abort_inference());

    // Memory matches what the chat ledger stores for an aborted reply
    let history = controller.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "count");
    assert_eq!(history[1].role, ChatRole::Assistant);
    assert_eq!(history[1].content, "");
}

#[tokio::test]
async fn test_runs_again_after_abort() {
    let controller = slow_controller().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_inference(InferenceOptions::new("count"), move |f| {
                    let _ = seen_tx.send(f.to_string());
                })
                .await
        })
    };
    seen_rx.recv().await.unwrap();
    controller.abort_inference();
    assert!(running.await.unwrap().unwrap().is_aborted());

    let outcome = controller
        .run_inference(InferenceOptions::new("again").with_max_tokens(2), |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, InferenceOutcome::Completed("one two ".to_string()));
}

#[tokio::test]
async fn test_dropped_call_releases_abort_slot() {
    let controller = slow_controller().await;

    let timed_out = tokio::time::timeout(
        Duration::from_millis(120),
        controller.run_inference(InferenceOptions::new("count"), |_| {}),
    )
    .await;
    assert!(timed_out.is_err());

    // Nothing is running any more
    assert!(!controller.abort_inference());

    let outcome = controller
        .run_inference(InferenceOptions::new("again").with_max_tokens(1), |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, InferenceOutcome::Completed("one ".to_string()));
}

#[tokio::test]
async fn test_embedding_waits_for_running_generation() {
    let controller = slow_controller().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run_inference(InferenceOptions::new("count"), move |f| {
                    let _ = seen_tx.send(f.to_string());
                })
                .await
        })
    };
    seen_rx.recv().await.unwrap();

    let vector = controller.lifecycle().embed("sky").await.unwrap();
    assert!(!vector.is_empty());

    // The generation finished streaming before the handle was released
    let mut remaining = 0;
    while seen_rx.try_recv().is_ok() {
        remaining += 1;
    }
    assert_eq!(remaining, 9);
    assert!(running.await.unwrap().unwrap().text().ends_with("ten"));
}
