// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Scripted backend without native code
//!
//! Streams a fixed reply word by word and embeds text by feature hashing, so
//! lexically similar texts land close together. Every call is recorded in
//! [`MockStats`] for assertions on call counts and teardown order.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    normalize, ContextParams, EmbeddingContext, FinishReason, GenerationContext,
    GenerationOutcome, GenerationRequest, InferenceBackend, LoadedModel, ModelParams, StopMatcher,
    TokenSender,
};

#[derive(Debug, Clone)]
pub struct MockBackendConfig {
    /// Simulated time spent reading weights
    pub load_delay: Duration,
    pub fail_load: bool,
    pub train_context_size: u32,
    /// Reply streamed for every generation, one word per token
    pub response: String,
    /// Pause between tokens; zero still yields to the scheduler
    pub token_delay: Duration,
    pub embedding_dimension: usize,
    pub fail_generation: bool,
    pub fail_embedding: bool,
    /// Make the model refuse to be freed
    pub fail_dispose: bool,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            load_delay: Duration::ZERO,
            fail_load: false,
            train_context_size: 4096,
            response: "Hello from the local model.".to_string(),
            token_delay: Duration::ZERO,
            embedding_dimension: 1024,
            fail_generation: false,
            fail_embedding: false,
            fail_dispose: false,
        }
    }
}

/// Call log shared between the backend and everything it creates
#[derive(Debug, Default)]
pub struct MockStats {
    loads: AtomicUsize,
    generations: AtomicUsize,
    embeddings: AtomicUsize,
    events: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockStats {
    fn record(&self, event: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.to_string());
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn embedding_count(&self) -> usize {
        self.embeddings.load(Ordering::SeqCst)
    }

    /// Lifecycle events in order, e.g. `context:dispose`, `model:dispose`
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rendered prompts received by generation contexts
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

#[derive(Debug, Default)]
pub struct MockBackend {
    config: MockBackendConfig,
    stats: Arc<MockStats>,
}

impl MockBackend {
    pub fn new(config: MockBackendConfig) -> Self {
        Self {
            config,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load_model(
        &self,
        params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn LoadedModel>> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        self.stats.record("model:load");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.stats.record("model:aborted");
                bail!("Model load aborted");
            }
            _ = tokio::time::sleep(self.config.load_delay) => {}
        }

        if self.config.fail_load {
            bail!("Failed to read {}", params.model_path.display());
        }

        debug!(model_path = %params.model_path.display(), "Mock model loaded");
        Ok(Box::new(MockModel {
            config: self.config.clone(),
            stats: self.stats.clone(),
            live_contexts: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

struct MockModel {
    config: MockBackendConfig,
    stats: Arc<MockStats>,
    live_contexts: Arc<AtomicUsize>,
}

#[async_trait]
impl LoadedModel for MockModel {
    fn train_context_size(&self) -> u32 {
        self.config.train_context_size
    }

    async fn create_context(&self, params: ContextParams) -> Result<Box<dyn GenerationContext>> {
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        self.stats.record("context:create");
        Ok(Box::new(MockGenerationContext {
            config: self.config.clone(),
            stats: self.stats.clone(),
            context_size: params.context_size,
            live_contexts: self.live_contexts.clone(),
        }))
    }

    async fn create_embedding_context(&self) -> Result<Box<dyn EmbeddingContext>> {
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        self.stats.record("embedding:create");
        Ok(Box::new(MockEmbeddingContext {
            config: self.config.clone(),
            stats: self.stats.clone(),
            live_contexts: self.live_contexts.clone(),
        }))
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.stats.record("model:dispose");
        let live = self.live_contexts.load(Ordering::SeqCst);
        if live > 0 {
            bail!("Model disposed while {} context(s) are alive", live);
        }
        if self.config.fail_dispose {
            bail!("Native free failed");
        }
        Ok(())
    }
}

struct MockGenerationContext {
    config: MockBackendConfig,
    stats: Arc<MockStats>,
    context_size: u32,
    live_contexts: Arc<AtomicUsize>,
}

#[async_trait]
impl GenerationContext for MockGenerationContext {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
        tokens: TokenSender,
    ) -> Result<GenerationOutcome> {
        self.stats.generations.fetch_add(1, Ordering::SeqCst);
        self.stats
            .prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());

        if self.config.fail_generation {
            bail!("Decode failed");
        }
        if request.prompt.split_whitespace().count() >= self.context_size as usize {
            bail!("Prompt does not fit the {} token context", self.context_size);
        }

        let mut matcher = StopMatcher::new(&request.stop_sequences);
        let mut text = String::new();
        let mut generated = 0;
        let mut finish = FinishReason::EndOfGeneration;

        for piece in self.config.response.split_inclusive(' ') {
            if generated >= request.max_tokens {
                finish = FinishReason::MaxTokens;
                break;
            }
            if cancel.is_cancelled() {
                finish = FinishReason::Cancelled;
                break;
            }

            if self.config.token_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.token_delay).await;
            }
            generated += 1;

            let (emit, stopped) = matcher.push(piece);
            if !emit.is_empty() {
                if tokens.send(emit.clone()).is_err() {
                    finish = FinishReason::Cancelled;
                    break;
                }
                text.push_str(&emit);
            }
            if stopped {
                finish = FinishReason::StopSequence;
                break;
            }
        }

        if finish != FinishReason::StopSequence {
            let rest = matcher.flush();
            if !rest.is_empty() && tokens.send(rest.clone()).is_ok() {
                text.push_str(&rest);
            }
        }

        Ok(GenerationOutcome {
            text,
            tokens_generated: generated,
            finish_reason: finish,
        })
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.stats.record("context:dispose");
        Ok(())
    }
}

struct MockEmbeddingContext {
    config: MockBackendConfig,
    stats: Arc<MockStats>,
    live_contexts: Arc<AtomicUsize>,
}

#[async_trait]
impl EmbeddingContext for MockEmbeddingContext {
    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.stats.embeddings.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_embedding {
            return Err(anyhow!("Embedding extraction failed"));
        }
        tokio::task::yield_now().await;
        Ok(hashed_embedding(text, self.config.embedding_dimension))
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.stats.record("embedding:dispose");
        Ok(())
    }
}

/// Bag-of-words vector: each lowercase word bumps one hashed bucket
pub fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dimension = dimension.max(1);
    let mut vector = vec![0.0f32; dimension];

    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[word_bucket(word, dimension)] += 1.0;
    }

    normalize(vector)
}

/// Bucket from the first eight bytes of the word's SHA-256, stable across builds
fn word_bucket(word: &str, dimension: usize) -> usize {
    let digest = Sha256::digest(word.to_lowercase().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % dimension as u64) as usize
}
