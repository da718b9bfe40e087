// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Process-wide runtime
//!
//! Owns the lifecycle manager, the chat controller and both stores, and wires
//! them together once at startup. The chat ledger in the record store stays
//! authoritative; the in-memory session is rebuilt from it on demand.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::backend::InferenceBackend;
use crate::config::RuntimeConfig;
use crate::embeddings::{Embedder, ModelEmbedder};
use crate::errors::{Result, RuntimeError};
use crate::inference::{
    ChatController, ChatTurn, InferenceOptions, InferenceOutcome, LifecycleState, LoadOptions,
    ModelLifecycle,
};
use crate::rag::{EmbeddingPipeline, IngestReport, SearchResult, SimilaritySearch};
use crate::storage::{Chat, InMemoryRecordStore, NewMessage, RecordStore, NEW_CHAT_TITLE};
use crate::vector::{LocalVectorStore, VectorStore};

const EVENT_CAPACITY: usize = 1024;

/// Notifications for a UI following the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    StreamingStarted,
    /// Generated text fragment, in generation order
    Token(String),
    StreamingStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub chat_id: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub history: Vec<ChatTurn>,
    /// Retrieved document text for the prompt
    pub context: Option<String>,
}

pub struct Runtime {
    config: RuntimeConfig,
    lifecycle: Arc<ModelLifecycle>,
    chat: ChatController,
    pipeline: EmbeddingPipeline,
    search: SimilaritySearch,
    records: Arc<dyn RecordStore>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl Runtime {
    /// Runtime with a vector store under `config.vector_dir()` and an
    /// in-memory record store
    pub async fn new(config: RuntimeConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;
        let vectors = Arc::new(LocalVectorStore::open(config.vector_dir()).await?);
        let records = Arc::new(InMemoryRecordStore::new());
        Self::with_stores(config, backend, vectors, records)
    }

    pub fn with_stores(
        config: RuntimeConfig,
        backend: Arc<dyn InferenceBackend>,
        vectors: Arc<dyn VectorStore>,
        records: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        config.validate()?;

        let lifecycle = Arc::new(ModelLifecycle::new(backend, &config));
        let embedder: Arc<dyn Embedder> = Arc::new(ModelEmbedder::new(lifecycle.clone()));
        let pipeline = EmbeddingPipeline::new(
            embedder.clone(),
            vectors.clone(),
            records.clone(),
            &config.chunking,
        )?;
        let search = SimilaritySearch::new(embedder, vectors, config.search);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(backend = lifecycle.backend_name(), data_dir = %config.data_dir.display(), "Runtime initialized");

        Ok(Self {
            chat: ChatController::new(lifecycle.clone()),
            config,
            lifecycle,
            pipeline,
            search,
            records,
            events,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle> {
        &self.lifecycle
    }

    pub fn chat(&self) -> &ChatController {
        &self.chat
    }

    pub fn pipeline(&self) -> &EmbeddingPipeline {
        &self.pipeline
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get_state()
    }

    /// Load with the configured settings
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.lifecycle
            .load_model(path, LoadOptions::from(&self.config.llm))
            .await
    }

    pub async fn unload_model(&self) -> bool {
        self.lifecycle.unload_model().await
    }

    pub fn abort_load(&self) -> bool {
        self.lifecycle.abort_load()
    }

    pub fn abort_inference(&self) -> bool {
        self.chat.abort_inference()
    }

    /// Create a session and a chat record for it
    pub async fn start_chat(&self, system_prompt: Option<&str>) -> Result<Chat> {
        self.chat.create_session(system_prompt).await?;
        self.records.create_chat(NEW_CHAT_TITLE).await
    }

    /// Rebuild the session memory from a stored chat
    pub async fn init_history_from_chat(&self, chat_id: &str, system_prompt: Option<&str>) -> Result<()> {
        let chat = self
            .records
            .get_chat_by_id(chat_id)
            .await?
            .ok_or_else(|| RuntimeError::RecordStore(format!("Chat not found: {}", chat_id)))?;

        let mut turns = Vec::with_capacity(chat.messages.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            turns.push(ChatTurn::system(prompt));
        }
        for message in chat.messages {
            turns.push(ChatTurn::from_parts(&message.role, message.content)?);
        }

        self.chat.set_history(turns).await
    }

    /// Forget the conversation both in memory and in the ledger
    pub async fn clear_chat_history(&self, chat_id: &str) -> Result<()> {
        self.chat.clear_history().await?;
        self.records.clear_messages(chat_id).await
    }

    /// Chat turn recorded in the ledger
    ///
    /// The user message is stored first, then the reply (empty when the
    /// generation was aborted). Returns `None` when aborted or failed.
    pub async fn chat_completion(&self, request: ChatCompletionRequest) -> Option<String> {
        if let Err(e) = self
            .records
            .append_message(&request.chat_id, NewMessage::new("user", request.prompt.clone()))
            .await
        {
            error!(chat_id = %request.chat_id, error = %e, "Failed to add user message to chat");
        }

        let mut options = InferenceOptions::new(request.prompt)
            .with_temperature(request.temperature)
            .with_max_tokens(request.max_tokens)
            .with_history(request.history);
        options.context = request.context;

        let outcome = match self.run_streaming(options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(chat_id = %request.chat_id, error = %e, "Failed to run chat completion");
                return None;
            }
        };

        let reply = match outcome {
            InferenceOutcome::Completed(text) => Some(text),
            InferenceOutcome::Aborted { .. } => None,
        };

        if let Err(e) = self
            .records
            .append_message(
                &request.chat_id,
                NewMessage::new("assistant", reply.clone().unwrap_or_default()),
            )
            .await
        {
            error!(chat_id = %request.chat_id, error = %e, "Failed to add assistant message to chat");
            return None;
        }

        reply
    }

    /// Editor completion, nothing is written to the ledger
    pub async fn completion(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
        history: Vec<ChatTurn>,
    ) -> Option<String> {
        let options = InferenceOptions::new(prompt)
            .with_temperature(temperature)
            .with_max_tokens(max_tokens)
            .with_history(history);

        match self.run_streaming(options).await {
            Ok(InferenceOutcome::Completed(text)) => Some(text),
            Ok(InferenceOutcome::Aborted { .. }) => None,
            Err(e) => {
                error!(error = %e, "Failed to run completion");
                None
            }
        }
    }

    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        self.pipeline.ingest_file(path).await
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchResult>> {
        self.search.search(query, limit).await
    }

    /// Search results joined into one context block
    pub async fn search_context(&self, query: &str, limit: Option<usize>) -> Result<Option<String>> {
        self.search.search_context(query, limit).await
    }

    pub async fn delete_all_embeddings(&self) -> Result<()> {
        self.pipeline.delete_all_embeddings().await
    }

    /// Release the model before the process exits
    pub async fn shutdown(&self) {
        if !self.lifecycle.unload_model().await {
            warn!("Model was not released cleanly on shutdown");
        }
    }

    async fn run_streaming(&self, options: InferenceOptions) -> Result<InferenceOutcome> {
        let _ = self.events.send(RuntimeEvent::StreamingStarted);
        let events = &self.events;
        let result = self
            .chat
            .run_inference(options, |fragment| {
                let _ = events.send(RuntimeEvent::Token(fragment.to_string()));
            })
            .await;
        let _ = self.events.send(RuntimeEvent::StreamingStopped);
        result
    }
}
