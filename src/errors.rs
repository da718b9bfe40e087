// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error types for the local runtime
//!
//! One taxonomy covers the model lifecycle, chat sessions, document ingestion
//! and similarity search:
//! - Precondition errors (no model loaded, no chat session)
//! - Native backend errors (load failure, generation failure)
//! - Ingestion errors (unsupported file type, text extraction)
//! - Store errors (vector store, record store)
//!
//! Cooperative cancellation is represented by [`RuntimeError::Aborted`] but is
//! absorbed by the public operations and never returned to callers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while driving the loaded model and the RAG stores
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Operation requires a loaded model
    #[error("Model is not loaded")]
    NotLoaded,

    /// Operation requires an active chat session
    #[error("Chat session is not created")]
    NoSession,

    /// Native model load failed for a reason other than cancellation
    #[error("Failed to load model {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Cooperative cancellation of a load or a generation
    #[error("Operation aborted")]
    Aborted,

    /// Releasing a previously loaded model failed
    #[error("Failed to release previous model: {0}")]
    DisposeFailed(String),

    /// No reader is registered for the file extension
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// A reader accepted the file but could not extract its text
    #[error("Failed to extract text from {path}: {reason}")]
    ExtractionFailed { path: String, reason: String },

    /// Unexpected failure while generating tokens or embeddings
    #[error("Failed to run inference: {0}")]
    BackendInference(String),

    /// Chat turn carried a role outside system/user/assistant
    #[error("Invalid message role: {0}")]
    InvalidRole(String),

    /// Vector store operation failed
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Record store operation failed
    #[error("Record store error: {0}")]
    RecordStore(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Get error code for logging and UI mapping
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::NotLoaded => "NOT_LOADED",
            RuntimeError::NoSession => "NO_SESSION",
            RuntimeError::LoadFailed { .. } => "LOAD_FAILED",
            RuntimeError::Aborted => "ABORTED",
            RuntimeError::DisposeFailed(_) => "DISPOSE_FAILED",
            RuntimeError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            RuntimeError::ExtractionFailed { .. } => "EXTRACTION_FAILED",
            RuntimeError::BackendInference(_) => "BACKEND_INFERENCE_ERROR",
            RuntimeError::InvalidRole(_) => "INVALID_ROLE",
            RuntimeError::VectorStore(_) => "VECTOR_STORE_ERROR",
            RuntimeError::RecordStore(_) => "RECORD_STORE_ERROR",
            RuntimeError::InvalidConfig(_) => "INVALID_CONFIG",
            RuntimeError::Io(_) => "IO_ERROR",
        }
    }

    /// Check if retrying the same call later can succeed
    ///
    /// Failures always leave the lifecycle in a retryable state, so this only
    /// singles out errors caused by the caller's input.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RuntimeError::UnsupportedFileType(_)
                | RuntimeError::InvalidRole(_)
                | RuntimeError::InvalidConfig(_)
        )
    }

    /// Cancellation is a quiet outcome, not a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, RuntimeError::Aborted)
    }
}
