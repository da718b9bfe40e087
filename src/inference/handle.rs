// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Ownership tree of a loaded model
//!
//! `ModelHandle` owns the weights, the single generation context and the
//! lazily created embedding context. The generation context in turn owns the
//! chat session. Teardown walks the tree leaves first.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error};

use crate::backend::{EmbeddingContext, GenerationContext, LoadedModel};
use crate::config::GpuLayers;
use crate::errors::{Result, RuntimeError};
use crate::inference::{ChatSession, ChatTemplate};

/// Settings a model was loaded with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_path: PathBuf,
    /// Effective generation window, already capped by the trained size
    pub context_size: u32,
    pub train_context_size: u32,
    pub gpu_layers: GpuLayers,
    pub use_mlock: bool,
    pub flash_attention: bool,
    pub loaded_at: DateTime<Utc>,
}

/// Generation context plus the session bound to it
pub(crate) struct InferenceContext {
    pub(crate) session: Option<ChatSession>,
    pub(crate) inner: Box<dyn GenerationContext>,
    pub(crate) template: ChatTemplate,
}

impl InferenceContext {
    pub(crate) fn new(inner: Box<dyn GenerationContext>, template: ChatTemplate) -> Self {
        Self {
            session: None,
            inner,
            template,
        }
    }

    /// Dispose the session, then the context. Returns the failures seen.
    fn dispose(self) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(session) = self.session {
            if let Err(e) = session.dispose() {
                error!(error = %e, "Failed to dispose chat session");
                failures.push(format!("session: {}", e));
            }
        }

        if let Err(e) = self.inner.dispose() {
            error!(error = %e, "Failed to dispose inference context");
            failures.push(format!("context: {}", e));
        }

        failures
    }
}

pub(crate) struct ModelHandle {
    info: ModelInfo,
    context: Option<InferenceContext>,
    embedding: Option<Box<dyn EmbeddingContext>>,
    model: Box<dyn LoadedModel>,
}

impl ModelHandle {
    pub(crate) fn new(info: ModelInfo, model: Box<dyn LoadedModel>, context: InferenceContext) -> Self {
        Self {
            info,
            context: Some(context),
            embedding: None,
            model,
        }
    }

    pub(crate) fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut InferenceContext> {
        self.context.as_mut()
    }

    pub(crate) fn has_session(&self) -> bool {
        self.context
            .as_ref()
            .map(|ctx| ctx.session.is_some())
            .unwrap_or(false)
    }

    /// Embedding context, created on first use and kept until unload
    pub(crate) async fn embedding_context(&mut self) -> anyhow::Result<&dyn EmbeddingContext> {
        if self.embedding.is_none() {
            let ctx = self.model.create_embedding_context().await?;
            debug!(dimension = ctx.dimension(), "Embedding context created");
            self.embedding = Some(ctx);
        }

        self.embedding
            .as_deref()
            .ok_or_else(|| anyhow!("Embedding context is not available"))
    }

    /// Tear down session, generation context, embedding context and model,
    /// in that order. Every stage is attempted even if an earlier one fails.
    pub(crate) fn dispose(self) -> Result<()> {
        let Self {
            info,
            context,
            embedding,
            model,
        } = self;

        let mut failures = context.map(InferenceContext::dispose).unwrap_or_default();

        if let Some(embedding) = embedding {
            if let Err(e) = embedding.dispose() {
                error!(error = %e, "Failed to dispose embedding context");
                failures.push(format!("embedding: {}", e));
            }
        }

        if let Err(e) = model.dispose() {
            error!(
                model_path = %info.model_path.display(),
                error = %e,
                "Failed to dispose model"
            );
            failures.push(format!("model: {}", e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::DisposeFailed(failures.join("; ")))
        }
    }
}
