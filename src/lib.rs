// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Offline LLM runtime
//!
//! Loads a local GGUF model, streams chat completions from it and answers
//! questions over a single ingested document.

pub mod backend;
pub mod cli;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod inference;
pub mod parsers;
pub mod rag;
pub mod runtime;
pub mod storage;
pub mod vector;
pub mod version;

pub use backend::{InferenceBackend, LlamaCppBackend, MockBackend, MockBackendConfig};
pub use config::{LlmSettings, RuntimeConfig};
pub use errors::{Result, RuntimeError};
pub use inference::{
    ChatController, ChatRole, ChatTurn, InferenceOptions, InferenceOutcome, LifecycleState,
    LoadOptions, ModelLifecycle,
};
pub use rag::{EmbeddingPipeline, IngestReport, SearchResult, SimilaritySearch};
pub use runtime::{ChatCompletionRequest, Runtime, RuntimeEvent};
pub use storage::{InMemoryRecordStore, RecordStore};
pub use vector::{LocalVectorStore, VectorStore};
