// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Document ingestion
//!
//! One file at a time goes into both stores: the document record first, then
//! one vector row per chunk. The corpus holds a single document; ingesting a
//! new file replaces everything ingested before.
//!
//! There is no transaction across the two stores. When the vector write fails
//! after the record was created, the record stays behind and the call fails;
//! re-ingesting the file replaces it.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info};

use crate::config::ChunkingConfig;
use crate::embeddings::Embedder;
use crate::errors::Result;
use crate::parsers;
use crate::rag::chunker::{DocumentChunk, TextChunker};
use crate::storage::{NewDocument, RecordStore};
use crate::vector::{VectorRow, VectorStore};

/// Vector table holding the ingested corpus
pub const DOCUMENTS_TABLE: &str = "documents";

/// Progress updates during ingestion
#[derive(Debug, Clone, PartialEq)]
pub enum IngestProgress {
    /// Previous corpus dropped
    CorpusCleared,

    TextExtracted { characters: usize },

    DocumentCreated { document_id: String },

    Chunked { chunks: usize },

    ChunkEmbedded { index: usize, total: usize },

    VectorsWritten { rows: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub title: String,
    /// Zero when the file holds no text
    pub chunks: usize,
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    records: Arc<dyn RecordStore>,
    chunker: TextChunker,
    table_name: String,
}

impl EmbeddingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        records: Arc<dyn RecordStore>,
        chunking: &ChunkingConfig,
    ) -> Result<Self> {
        Ok(Self {
            embedder,
            vectors,
            records,
            chunker: TextChunker::new(chunking.chunk_size, chunking.chunk_overlap)?,
            table_name: DOCUMENTS_TABLE.to_string(),
        })
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        self.ingest_file_with_progress(path, None).await
    }

    /// Ingest `path`, replacing the current corpus
    pub async fn ingest_file_with_progress(
        &self,
        path: impl AsRef<Path>,
        progress: Option<Sender<IngestProgress>>,
    ) -> Result<IngestReport> {
        let path = path.as_ref();
        self.embedder.ensure_ready().await?;

        if self.table_exists().await? {
            info!(table = %self.table_name, "Replacing existing corpus");
            self.delete_all_embeddings().await?;
            report(&progress, IngestProgress::CorpusCleared).await;
        }

        let content = parsers::load_text(path).await?;
        report(
            &progress,
            IngestProgress::TextExtracted {
                characters: content.chars().count(),
            },
        )
        .await;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file_size = tokio::fs::metadata(path).await.ok().map(|m| m.len());

        let document_id = self
            .records
            .create_document(NewDocument {
                title: file_name.clone(),
                content: content.clone(),
                file_name: Some(file_name.clone()),
                file_path: Some(path.display().to_string()),
                file_size,
                file_type: Some(parsers::file_type(path)),
            })
            .await?;
        report(
            &progress,
            IngestProgress::DocumentCreated {
                document_id: document_id.clone(),
            },
        )
        .await;

        let chunks = self.chunker.split(&content, &document_id);
        report(
            &progress,
            IngestProgress::Chunked {
                chunks: chunks.len(),
            },
        )
        .await;

        if chunks.is_empty() {
            info!(document_id = %document_id, file = %file_name, "Document has no text to embed");
            return Ok(IngestReport {
                document_id,
                title: file_name,
                chunks: 0,
            });
        }

        let total = chunks.len();
        if let Err(e) = self.write_vectors(&chunks, &file_name, &progress).await {
            error!(
                document_id = %document_id,
                file = %file_name,
                error = %e,
                "Document record created but vector write failed; record is orphaned"
            );
            return Err(e);
        }

        info!(document_id = %document_id, file = %file_name, chunks = total, "Document ingested");
        Ok(IngestReport {
            document_id,
            title: file_name,
            chunks: total,
        })
    }

    /// Drop the vector table and delete every document record
    ///
    /// Both steps are attempted; the first failure is returned.
    pub async fn delete_all_embeddings(&self) -> Result<()> {
        let dropped = match self.table_exists().await {
            Ok(true) => self.vectors.drop_table(&self.table_name).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        let deleted = self.records.delete_all_documents().await;

        if let Err(e) = &dropped {
            error!(table = %self.table_name, error = %e, "Failed to drop vector table");
        }
        match &deleted {
            Ok(count) => debug!(documents = count, "Deleted document records"),
            Err(e) => error!(error = %e, "Failed to delete document records"),
        }

        dropped?;
        deleted?;
        info!(table = %self.table_name, "Deleted all embeddings");
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        Ok(self
            .vectors
            .list_tables()
            .await?
            .iter()
            .any(|name| name == &self.table_name))
    }

    async fn write_vectors(
        &self,
        chunks: &[DocumentChunk],
        source: &str,
        progress: &Option<Sender<IngestProgress>>,
    ) -> Result<()> {
        let total = chunks.len();
        let mut rows = Vec::with_capacity(total);

        for chunk in chunks {
            let vector = self.embedder.embed(&chunk.content).await?;
            rows.push(VectorRow {
                content: chunk.content.clone(),
                vector,
                metadata: json!({
                    "document_id": chunk.document_id,
                    "chunk_index": chunk.index,
                    "start": chunk.metadata.start,
                    "end": chunk.metadata.end,
                    "source": source,
                }),
            });
            report(
                progress,
                IngestProgress::ChunkEmbedded {
                    index: chunk.index,
                    total,
                },
            )
            .await;
        }

        if self.table_exists().await? {
            self.vectors.open_table(&self.table_name).await?.add(rows).await?;
        } else {
            self.vectors.create_table(&self.table_name, rows).await?;
        }

        report(progress, IngestProgress::VectorsWritten { rows: total }).await;
        Ok(())
    }
}

async fn report(progress: &Option<Sender<IngestProgress>>, update: IngestProgress) {
    if let Some(tx) = progress {
        // A dropped receiver only means nobody is watching
        let _ = tx.send(update).await;
    }
}
