// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod embeddings;
pub mod store;

pub use embeddings::Embedding;
pub use store::{LocalVectorStore, VectorMatch, VectorRow, VectorStore, VectorTable};
