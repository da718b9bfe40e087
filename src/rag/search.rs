// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Similarity search over the ingested corpus

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::SearchConfig;
use crate::embeddings::Embedder;
use crate::errors::Result;
use crate::rag::pipeline::DOCUMENTS_TABLE;
use crate::vector::VectorStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub distance: f32,
}

pub struct SimilaritySearch {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    config: SearchConfig,
    table_name: String,
}

impl SimilaritySearch {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>, config: SearchConfig) -> Self {
        Self {
            embedder,
            vectors,
            config,
            table_name: DOCUMENTS_TABLE.to_string(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Closest chunks to `query`, nearest first
    ///
    /// Results with blank content or a distance at or beyond the configured
    /// threshold are dropped. A missing table yields no results.
    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchResult>> {
        let limit = limit.unwrap_or(self.config.default_limit);

        let tables = self.vectors.list_tables().await?;
        if !tables.iter().any(|name| name == &self.table_name) {
            debug!(table = %self.table_name, "No vector table, nothing to search");
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        let table = self.vectors.open_table(&self.table_name).await?;
        let matches = table.search(&vector, limit).await?;
        let candidates = matches.len();

        let results: Vec<SearchResult> = matches
            .into_iter()
            .filter(|m| !m.content.trim().is_empty() && m.distance < self.config.max_distance)
            .map(|m| SearchResult {
                content: m.content,
                distance: m.distance,
            })
            .collect();

        debug!(
            candidates,
            results = results.len(),
            max_distance = self.config.max_distance,
            "Similarity search finished"
        );
        Ok(results)
    }

    /// Matching contents joined by newlines, `None` when nothing matched
    pub async fn search_context(&self, query: &str, limit: Option<usize>) -> Result<Option<String>> {
        let results = self.search(query, limit).await?;
        if results.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            results
                .into_iter()
                .map(|r| r.content)
                .collect::<Vec<_>>()
                .join("\n"),
        ))
    }
}
