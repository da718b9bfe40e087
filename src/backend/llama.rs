// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! llama.cpp backend
//!
//! `LlamaContext` borrows the model it was created from, so every context
//! lives on a dedicated worker thread that owns a clone of the model `Arc`.
//! Jobs are handed over through a channel; the async side only waits for
//! replies. Dropping the job sender ends the worker and releases its context.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use llama_cpp_2::{
    context::{
        params::{LlamaContextParams, LlamaPoolingType},
        LlamaContext,
    },
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    EmbeddingsError,
};
use std::num::NonZeroU32;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    normalize, sanitize_prompt_for_tokenizer, ContextParams, EmbeddingContext, FinishReason,
    GenerationContext, GenerationOutcome, GenerationRequest, InferenceBackend, LoadedModel,
    ModelParams, StopMatcher, TokenSender,
};

/// Upper bound for the embedding context window
const EMBEDDING_CONTEXT_CAP: u32 = 2048;

/// llama.cpp, initialised once for the whole process
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self> {
        let backend =
            LlamaBackend::init().map_err(|e| anyhow!("Failed to initialize backend: {:?}", e))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

#[async_trait]
impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    async fn load_model(
        &self,
        params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn LoadedModel>> {
        let backend = self.backend.clone();
        let load_params = params.clone();

        let mut task = tokio::task::spawn_blocking(move || -> Result<LlamaModel> {
            let model_params = LlamaModelParams::default()
                .with_n_gpu_layers(load_params.gpu_layers.as_layer_count())
                .with_use_mlock(load_params.use_mlock);

            LlamaModel::load_from_file(&backend, &load_params.model_path, &model_params)
                .map_err(|e| anyhow!("Failed to load model: {:?}", e))
        });

        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = cancel.cancelled() => None,
        };

        let Some(joined) = joined else {
            // The native loader cannot be interrupted; free the weights once it lands
            let path = params.model_path.display().to_string();
            tokio::spawn(async move {
                if let Ok(Ok(model)) = task.await {
                    drop(model);
                    debug!(model_path = %path, "Discarded model that finished loading after abort");
                }
            });
            return Err(anyhow!("Model load aborted"));
        };

        let model = joined.map_err(|e| anyhow!("Model load task failed: {}", e))??;

        info!(
            n_ctx_train = model.n_ctx_train(),
            n_embd = model.n_embd(),
            n_params = model.n_params(),
            "Model weights loaded"
        );

        Ok(Box::new(LlamaLoadedModel {
            backend: self.backend.clone(),
            model: Arc::new(model),
        }))
    }
}

struct LlamaLoadedModel {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
}

#[async_trait]
impl LoadedModel for LlamaLoadedModel {
    fn train_context_size(&self) -> u32 {
        self.model.n_ctx_train()
    }

    async fn create_context(&self, params: ContextParams) -> Result<Box<dyn GenerationContext>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (job_tx, job_rx) = std_mpsc::channel::<GenerationJob>();
        let backend = self.backend.clone();
        let model = self.model.clone();

        let worker = std::thread::Builder::new()
            .name("llama-generation".to_string())
            .spawn(move || {
                let ctx_params = LlamaContextParams::default()
                    .with_n_ctx(NonZeroU32::new(params.context_size))
                    .with_n_batch(params.batch_size)
                    .with_flash_attention(params.flash_attention);

                let mut ctx = match model.new_context(&backend, ctx_params) {
                    Ok(ctx) => {
                        let _ = ready_tx.send(Ok(()));
                        ctx
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!("Failed to create context: {:?}", e)));
                        return;
                    }
                };

                while let Ok(job) = job_rx.recv() {
                    let result = run_generation(
                        &model,
                        &mut ctx,
                        params.batch_size,
                        job.request,
                        &job.cancel,
                        &job.tokens,
                    );
                    let _ = job.reply.send(result);
                }
            })?;

        ready_rx
            .await
            .map_err(|_| anyhow!("Generation worker exited during startup"))??;

        Ok(Box::new(LlamaGenerationContext {
            context_size: params.context_size,
            jobs: job_tx,
            worker,
        }))
    }

    async fn create_embedding_context(&self) -> Result<Box<dyn EmbeddingContext>> {
        let train = self.model.n_ctx_train();
        let context_size = if train == 0 {
            EMBEDDING_CONTEXT_CAP
        } else {
            train.min(EMBEDDING_CONTEXT_CAP)
        };
        let dimension = self.model.n_embd().max(0) as usize;

        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (job_tx, job_rx) = std_mpsc::channel::<EmbeddingJob>();
        let backend = self.backend.clone();
        let model = self.model.clone();

        let worker = std::thread::Builder::new()
            .name("llama-embedding".to_string())
            .spawn(move || {
                let ctx_params = embedding_context_params(context_size);

                let mut ctx = match model.new_context(&backend, ctx_params) {
                    Ok(ctx) => {
                        let _ = ready_tx.send(Ok(()));
                        ctx
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!(
                            "Failed to create embedding context: {:?}",
                            e
                        )));
                        return;
                    }
                };

                while let Ok(job) = job_rx.recv() {
                    let result = run_embedding(&model, &mut ctx, context_size, &job.text);
                    let _ = job.reply.send(result);
                }
            })?;

        ready_rx
            .await
            .map_err(|_| anyhow!("Embedding worker exited during startup"))??;

        debug!(context_size, dimension, "Embedding context created");

        Ok(Box::new(LlamaEmbeddingContext {
            dimension,
            jobs: job_tx,
            worker,
        }))
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        let refs = Arc::strong_count(&self.model);
        match Arc::try_unwrap(self.model) {
            Ok(model) => {
                drop(model);
                Ok(())
            }
            Err(_) => Err(anyhow!(
                "Model is still referenced by {} live context(s)",
                refs - 1
            )),
        }
    }
}

struct GenerationJob {
    request: GenerationRequest,
    cancel: CancellationToken,
    tokens: TokenSender,
    reply: oneshot::Sender<Result<GenerationOutcome>>,
}

struct LlamaGenerationContext {
    context_size: u32,
    jobs: std_mpsc::Sender<GenerationJob>,
    worker: JoinHandle<()>,
}

#[async_trait]
impl GenerationContext for LlamaGenerationContext {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
        tokens: TokenSender,
    ) -> Result<GenerationOutcome> {
        let (reply, reply_rx) = oneshot::channel();
        self.jobs
            .send(GenerationJob {
                request,
                cancel,
                tokens,
                reply,
            })
            .map_err(|_| anyhow!("Generation worker is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("Generation worker dropped the request"))?
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        let Self { jobs, worker, .. } = *self;
        drop(jobs);
        worker
            .join()
            .map_err(|_| anyhow!("Generation worker panicked"))
    }
}

struct EmbeddingJob {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

struct LlamaEmbeddingContext {
    dimension: usize,
    jobs: std_mpsc::Sender<EmbeddingJob>,
    worker: JoinHandle<()>,
}

#[async_trait]
impl EmbeddingContext for LlamaEmbeddingContext {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (reply, reply_rx) = oneshot::channel();
        self.jobs
            .send(EmbeddingJob {
                text: text.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("Embedding worker is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("Embedding worker dropped the request"))?
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        let Self { jobs, worker, .. } = *self;
        drop(jobs);
        worker
            .join()
            .map_err(|_| anyhow!("Embedding worker panicked"))
    }
}

fn run_generation(
    model: &LlamaModel,
    ctx: &mut LlamaContext<'_>,
    batch_size: u32,
    request: GenerationRequest,
    cancel: &CancellationToken,
    tokens: &TokenSender,
) -> Result<GenerationOutcome> {
    // Session history is re-rendered for every call
    ctx.clear_kv_cache();

    let sanitized = sanitize_prompt_for_tokenizer(&request.prompt);
    if sanitized.len() != request.prompt.len() {
        warn!(
            removed = request.prompt.len() - sanitized.len(),
            "Sanitized prompt before tokenization"
        );
    }

    let prompt_tokens = model
        .str_to_token(&sanitized, AddBos::Always)
        .map_err(|e| anyhow!("Failed to tokenize: {:?}", e))?;
    let n_ctx = ctx.n_ctx() as usize;
    if prompt_tokens.is_empty() {
        return Err(anyhow!("Prompt produced no tokens"));
    }
    if prompt_tokens.len() >= n_ctx {
        return Err(anyhow!(
            "Prompt of {} tokens does not fit the {} token context",
            prompt_tokens.len(),
            n_ctx
        ));
    }

    let batch_size = (batch_size as usize).max(1);
    let mut batch = LlamaBatch::new(batch_size, 1);
    let last = prompt_tokens.len() - 1;
    for (chunk_idx, chunk) in prompt_tokens.chunks(batch_size).enumerate() {
        batch.clear();
        for (offset, &token) in chunk.iter().enumerate() {
            let pos = chunk_idx * batch_size + offset;
            batch
                .add(token, pos as i32, &[0], pos == last)
                .map_err(|e| anyhow!("Failed to add token to batch: {:?}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("Decode failed: {:?}", e))?;
    }

    let mut sampler = if request.temperature <= 0.0 {
        LlamaSampler::greedy()
    } else {
        let seed = request
            .seed
            .unwrap_or_else(|| chrono::Utc::now().timestamp_subsec_nanos());
        LlamaSampler::chain_simple([
            LlamaSampler::temp(request.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut matcher = StopMatcher::new(&request.stop_sequences);
    let mut text = String::new();
    let mut n_cur = prompt_tokens.len();
    let mut generated = 0;
    let mut finish = FinishReason::MaxTokens;

    while generated < request.max_tokens {
        if cancel.is_cancelled() {
            finish = FinishReason::Cancelled;
            break;
        }
        if n_cur >= n_ctx {
            finish = FinishReason::ContextFull;
            break;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        if model.is_eog_token(token) {
            finish = FinishReason::EndOfGeneration;
            break;
        }
        generated += 1;

        // Pieces that are not valid UTF-8 on their own are skipped, the
        // model state still advances below
        let piece = model
            .token_to_str(token, Special::Plaintext)
            .unwrap_or_default();
        let (emit, stopped) = matcher.push(&piece);
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

        batch.clear();
        batch
            .add(token, n_cur as i32, &[0], true)
            .map_err(|e| anyhow!("Failed to add token: {:?}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("Decode failed: {:?}", e))?;
        n_cur += 1;
    }

    if finish != FinishReason::StopSequence {
        let rest = matcher.flush();
        if !rest.is_empty() && tokens.send(rest.clone()).is_ok() {
            text.push_str(&rest);
        }
    }

    debug!(
        prompt_tokens = prompt_tokens.len(),
        tokens_generated = generated,
        finish_reason = ?finish,
        "Generation ended"
    );

    Ok(GenerationOutcome {
        text,
        tokens_generated: generated,
        finish_reason: finish,
    })
}

/// Chat models usually declare no pooling, so mean pooling is requested
/// explicitly to get one vector per sequence
fn embedding_context_params(context_size: u32) -> LlamaContextParams {
    LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(context_size))
        .with_n_batch(context_size)
        .with_embeddings(true)
        .with_pooling_type(LlamaPoolingType::Mean)
}

/// Average of per-token embeddings
fn mean_pool(rows: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut pooled = vec![0.0f32; first.len()];
    for row in rows {
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value;
        }
    }
    let count = rows.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= count);
    pooled
}

fn run_embedding(
    model: &LlamaModel,
    ctx: &mut LlamaContext<'_>,
    context_size: u32,
    text: &str,
) -> Result<Vec<f32>> {
    ctx.clear_kv_cache();

    let sanitized = sanitize_prompt_for_tokenizer(text);
    let mut tokens = model
        .str_to_token(&sanitized, AddBos::Always)
        .map_err(|e| anyhow!("Failed to tokenize: {:?}", e))?;
    if tokens.len() > context_size as usize {
        warn!(
            tokens = tokens.len(),
            context_size, "Embedding input truncated to the context window"
        );
        tokens.truncate(context_size as usize);
    }

    let mut batch = LlamaBatch::new(context_size as usize, 1);
    batch
        .add_sequence(&tokens, 0, true)
        .map_err(|e| anyhow!("Failed to add sequence to batch: {:?}", e))?;
    ctx.decode(&mut batch)
        .map_err(|e| anyhow!("Decode failed: {:?}", e))?;

    let embedding = match ctx.embeddings_seq_ith(0) {
        Ok(pooled) => pooled.to_vec(),
        // Context ended up without pooling, average the token rows instead
        Err(EmbeddingsError::NonePoolType) => {
            let rows = (0..tokens.len() as i32)
                .map(|i| ctx.embeddings_ith(i).map(|row| row.to_vec()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| anyhow!("Failed to read token embeddings: {:?}", e))?;
            mean_pool(&rows)
        }
        Err(e) => return Err(anyhow!("Failed to read embeddings: {:?}", e)),
    };

    Ok(normalize(embedding))
}
