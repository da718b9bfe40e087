// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding source for ingestion and search
//!
//! The pipeline only needs "text in, vector out". `ModelEmbedder` serves that
//! from the embedding context of the loaded model, so it fails with
//! `NotLoaded` while no model is loaded.

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::{Result, RuntimeError};
use crate::inference::ModelLifecycle;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fail early when vectors cannot be produced right now
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for text in texts {
            embeddings.push(self.embed(text).await?);
        }

        Ok(embeddings)
    }
}

/// Embeddings from the model held by the lifecycle manager
pub struct ModelEmbedder {
    lifecycle: Arc<ModelLifecycle>,
}

impl ModelEmbedder {
    pub fn new(lifecycle: Arc<ModelLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl Embedder for ModelEmbedder {
    async fn ensure_ready(&self) -> Result<()> {
        if self.lifecycle.is_loaded() {
            Ok(())
        } else {
            Err(RuntimeError::NotLoaded)
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.lifecycle.embed(text).await
    }
}
