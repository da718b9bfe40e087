// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::sync::Arc;
use tempfile::TempDir;

use offline_llm_runtime::backend::{MockBackend, MockBackendConfig};
use offline_llm_runtime::storage::NewMessage;
use offline_llm_runtime::{
    ChatCompletionRequest, ChatRole, ChatTurn, InMemoryRecordStore, LocalVectorStore, Runtime,
    RuntimeConfig, RuntimeError, RuntimeEvent,
};

async fn open_runtime(dir: &TempDir) -> Runtime {
    let config = RuntimeConfig {
        data_dir: dir.path().to_path_buf(),
        warm_up: false,
        ..Default::default()
    };
    let vectors = Arc::new(LocalVectorStore::open(config.vector_dir()).await.unwrap());
    let runtime = Runtime::with_stores(
        config,
        Arc::new(MockBackend::new(MockBackendConfig::default())),
        vectors,
        Arc::new(InMemoryRecordStore::new()),
    )
    .unwrap();
    assert!(runtime.load_model("/models/tiny.gguf").await.unwrap());
    runtime
}

fn request(chat_id: &str, prompt: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        chat_id: chat_id.to_string(),
        prompt: prompt.to_string(),
        temperature: 0.7,
        max_tokens: 256,
        history: Vec::new(),
        context: None,
    }
}

#[tokio::test]
async fn test_chat_completion_records_both_messages() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();
    assert_eq!(chat.title, "New Chat");

    let reply = runtime.chat_completion(request(&chat.id, "Hi there")).await;

    assert_eq!(reply.as_deref(), Some("Hello from the local model."));
    let stored = runtime.records().get_chat_by_id(&chat.id).await.unwrap().unwrap();
    let messages: Vec<(&str, &str)> = stored
        .messages
        .iter()
        .map(|m| (m.role.as_str(), m.content.as_str()))
        .collect();
    assert_eq!(
        messages,
        vec![
            ("user", "Hi there"),
            ("assistant", "Hello from the local model."),
        ]
    );
}

#[tokio::test]
async fn test_streaming_events_bracket_tokens() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();
    let mut events = runtime.subscribe_events();

    runtime.chat_completion(request(&chat.id, "Hi")).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert_eq!(received.first(), Some(&RuntimeEvent::StreamingStarted));
    assert_eq!(received.last(), Some(&RuntimeEvent::StreamingStopped));
    let text: String = received
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Token(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello from the local model.");
}

#[tokio::test]
async fn test_failure_keeps_user_message_only() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    // Chat record without a session on the model
    let chat = runtime.records().create_chat("Orphan").await.unwrap();
    let mut events = runtime.subscribe_events();

    let reply = runtime.chat_completion(request(&chat.id, "Hello?")).await;

    assert!(reply.is_none());
    let stored = runtime.records().get_chat_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].role, "user");

    // The streaming flag is still reset
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(last, Some(RuntimeEvent::StreamingStopped));
}

#[tokio::test]
async fn test_init_history_from_chat() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();
    runtime
        .records()
        .append_message(&chat.id, NewMessage::new("user", "My name is Ada."))
        .await
        .unwrap();
    runtime
        .records()
        .append_message(&chat.id, NewMessage::new("assistant", "Hello Ada."))
        .await
        .unwrap();

    runtime
        .init_history_from_chat(&chat.id, Some("Be brief."))
        .await
        .unwrap();

    let history = runtime.chat().history().await.unwrap();
    assert_eq!(
        history,
        vec![
            ChatTurn::system("Be brief."),
            ChatTurn::user("My name is Ada."),
            ChatTurn::assistant("Hello Ada."),
        ]
    );
}

#[tokio::test]
async fn test_init_history_rejects_unknown_role() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();
    runtime
        .records()
        .append_message(&chat.id, NewMessage::new("tool", "{}"))
        .await
        .unwrap();

    let err = runtime
        .init_history_from_chat(&chat.id, None)
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::InvalidRole(ref role) if role == "tool"));
}

#[tokio::test]
async fn test_init_history_for_missing_chat() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    runtime.start_chat(None).await.unwrap();

    let err = runtime
        .init_history_from_chat("no-such-chat", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::RecordStore(_)));
}

#[tokio::test]
async fn test_clear_chat_history() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(Some("system")).await.unwrap();
    runtime.chat_completion(request(&chat.id, "Hi")).await.unwrap();

    runtime.clear_chat_history(&chat.id).await.unwrap();

    let stored = runtime.records().get_chat_by_id(&chat.id).await.unwrap().unwrap();
    assert!(stored.messages.is_empty());
    assert!(runtime.chat().history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_leaves_ledger_untouched() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();

    let reply = runtime
        .completion(
            "Continue: the quick brown",
            0.2,
            64,
            vec![ChatTurn::new(ChatRole::User, "earlier text")],
        )
        .await;

    assert!(reply.is_some());
    let stored = runtime.records().get_chat_by_id(&chat.id).await.unwrap().unwrap();
    assert!(stored.messages.is_empty());
}

#[tokio::test]
async fn test_unloaded_runtime_returns_none() {
    let dir = TempDir::new().unwrap();
    let runtime = open_runtime(&dir).await;
    let chat = runtime.start_chat(None).await.unwrap();
    assert!(runtime.unload_model().await);

    assert!(runtime.chat_completion(request(&chat.id, "Hi")).await.is_none());
    assert!(runtime.completion("Hi", 0.7, 16, Vec::new()).await.is_none());
}
