// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// RAG (Retrieval-Augmented Generation) module
// Document chunking, ingestion into the vector store and similarity search

pub mod chunker;
pub mod pipeline;
pub mod search;

pub use chunker::{ChunkMetadata, DocumentChunk, TextChunker};
pub use pipeline::{EmbeddingPipeline, IngestProgress, IngestReport, DOCUMENTS_TABLE};
pub use search::{SearchResult, SimilaritySearch};
