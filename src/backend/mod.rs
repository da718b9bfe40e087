// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Native inference backend seam
//!
//! The lifecycle manager only talks to these traits. `llama` drives llama.cpp
//! through `llama-cpp-2`; `mock` is a scripted stand-in used by the tests and
//! for running the runtime without a GGUF file.

pub mod llama;
pub mod mock;

pub use llama::LlamaCppBackend;
pub use mock::{MockBackend, MockBackendConfig};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::GpuLayers;

/// Receiving end of generated text fragments, in generation order
pub type TokenSender = mpsc::UnboundedSender<String>;

/// Parameters for loading model weights
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model_path: PathBuf,
    pub gpu_layers: GpuLayers,
    pub use_mlock: bool,
}

/// Parameters for a generation context derived from a loaded model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextParams {
    pub context_size: u32,
    pub batch_size: u32,
    pub flash_attention: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Fully rendered prompt, chat template already applied
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfGeneration,
    StopSequence,
    MaxTokens,
    ContextFull,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Text streamed to the sender, concatenated
    pub text: String,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
}

/// Entry point of a native inference library
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Load weights. Must observe `cancel` and fail promptly once it fires;
    /// native work already committed may finish in the background.
    async fn load_model(
        &self,
        params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn LoadedModel>>;
}

/// Weights resident in memory
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Context length the model was trained with, 0 when unknown
    fn train_context_size(&self) -> u32;

    async fn create_context(&self, params: ContextParams) -> Result<Box<dyn GenerationContext>>;

    async fn create_embedding_context(&self) -> Result<Box<dyn EmbeddingContext>>;

    /// Free the weights. Every context created from this model must already
    /// be disposed.
    fn dispose(self: Box<Self>) -> Result<()>;
}

/// Sized token window used for generation
#[async_trait]
pub trait GenerationContext: Send + Sync {
    fn context_size(&self) -> u32;

    /// Generate a reply for `request`, sending each text fragment to `tokens`
    /// as soon as it is produced. `cancel` is checked before every token; a
    /// cancelled generation returns `Ok` with [`FinishReason::Cancelled`].
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
        tokens: TokenSender,
    ) -> Result<GenerationOutcome>;

    fn dispose(self: Box<Self>) -> Result<()>;
}

/// Context producing one embedding vector per input text
#[async_trait]
pub trait EmbeddingContext: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dispose(self: Box<Self>) -> Result<()>;
}

/// Holds back streamed text that could be the start of a stop sequence
///
/// Fragments are pushed as the model produces them; only text that can no
/// longer turn into a stop sequence is released to the caller.
#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    /// Returns the text safe to emit, and whether a stop sequence was hit
    pub fn push(&mut self, fragment: &str) -> (String, bool) {
        self.pending.push_str(fragment);

        let hit = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min();
        if let Some(idx) = hit {
            let emit = self.pending[..idx].to_string();
            self.pending.clear();
            return (emit, true);
        }

        let held = self.held_suffix_len();
        let split = self.pending.len() - held;
        let emit = self.pending[..split].to_string();
        self.pending.drain(..split);
        (emit, false)
    }

    /// Release whatever is still held back
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    fn held_suffix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            for (idx, _) in self.pending.char_indices() {
                let suffix = &self.pending[idx..];
                if suffix.len() > longest && stop.starts_with(suffix) {
                    longest = suffix.len();
                    break;
                }
            }
        }
        longest
    }
}

/// Remove characters that break C string handling in the native tokenizer
///
/// Document text extracted from PDFs may carry NUL bytes and stray control
/// characters; tabs and newlines are kept.
pub fn sanitize_prompt_for_tokenizer(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| *c != '\0' && (*c >= ' ' || *c == '\t' || *c == '\n' || *c == '\r'))
        .collect()
}

/// Scale a vector to unit length; zero vectors are returned unchanged
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}
