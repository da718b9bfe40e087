// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model lifecycle manager
//!
//! Single authority over the loaded model. State moves
//! `Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`; every failure and
//! every abort resolves to `Unloaded`, so a later load can always be retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, MappedMutexGuard, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{
    ContextParams, GenerationRequest, InferenceBackend, LoadedModel, ModelParams,
};
use crate::config::{GpuLayers, LlmSettings, RuntimeConfig};
use crate::errors::{Result, RuntimeError};
use crate::inference::handle::{InferenceContext, ModelHandle, ModelInfo};
use crate::inference::ChatTemplate;

const WARM_UP_PROMPT: &str = "hello";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loading => "loading",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// Per-load overrides; unset fields fall back to the configured settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    pub context_size: Option<u32>,
    pub gpu_layers: Option<i32>,
    pub use_mlock: Option<bool>,
    pub flash_attention: Option<bool>,
}

impl LoadOptions {
    pub fn resolve(&self, defaults: &LlmSettings) -> LlmSettings {
        LlmSettings {
            context_size: self.context_size.unwrap_or(defaults.context_size),
            gpu_layers: self.gpu_layers.unwrap_or(defaults.gpu_layers),
            use_mlock: self.use_mlock.unwrap_or(defaults.use_mlock),
            flash_attention: self.flash_attention.unwrap_or(defaults.flash_attention),
        }
    }
}

impl From<&LlmSettings> for LoadOptions {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            context_size: Some(settings.context_size),
            gpu_layers: Some(settings.gpu_layers),
            use_mlock: Some(settings.use_mlock),
            flash_attention: Some(settings.flash_attention),
        }
    }
}

pub struct ModelLifecycle {
    backend: Arc<dyn InferenceBackend>,
    defaults: LlmSettings,
    template: ChatTemplate,
    batch_size: u32,
    warm_up: bool,
    state: watch::Sender<LifecycleState>,
    handle: tokio::sync::Mutex<Option<ModelHandle>>,
    load_cancel: Mutex<Option<CancellationToken>>,
}

impl ModelLifecycle {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: &RuntimeConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Unloaded);
        Self {
            backend,
            defaults: config.llm.clone(),
            template: config.chat_template,
            batch_size: config.batch_size,
            warm_up: config.warm_up,
            state,
            handle: tokio::sync::Mutex::new(None),
            load_cancel: Mutex::new(None),
        }
    }

    pub fn get_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.get_state() == LifecycleState::Loaded
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Settings of the currently loaded model
    pub async fn model_info(&self) -> Option<ModelInfo> {
        self.handle.lock().await.as_ref().map(|h| h.info().clone())
    }

    /// Load a model, replacing any model already loaded
    ///
    /// Returns `Ok(false)` when the native load fails or is aborted. An error
    /// is returned only when releasing the previous model fails.
    pub async fn load_model(&self, path: impl AsRef<Path>, options: LoadOptions) -> Result<bool> {
        let path = path.as_ref().to_path_buf();

        if self.handle.lock().await.is_some() {
            info!("Unloading previous model");
            self.teardown().await?;
        }

        let cancel = CancellationToken::new();
        let began = {
            // Token and state change together so abort_load never sees one without the other
            let mut slot = self.lock_load_cancel();
            let began = self.state.send_if_modified(|state| {
                if *state == LifecycleState::Unloaded {
                    *state = LifecycleState::Loading;
                    true
                } else {
                    false
                }
            });
            if began {
                *slot = Some(cancel.clone());
            }
            began
        };
        if !began {
            warn!(
                state = %self.get_state(),
                model_path = %path.display(),
                "Model load rejected, another transition is in progress"
            );
            return Ok(false);
        }

        let settings = options.resolve(&self.defaults);
        info!(
            model_path = %path.display(),
            backend = self.backend.name(),
            context_size = settings.context_size,
            gpu_layers = settings.gpu_layers,
            use_mlock = settings.use_mlock,
            flash_attention = settings.flash_attention,
            "Loading model"
        );

        let result = self.build_handle(&path, &settings, &cancel).await;
        self.lock_load_cancel().take();

        match result {
            Ok(handle) => {
                let context_size = handle.info().context_size;
                *self.handle.lock().await = Some(handle);
                self.state.send_replace(LifecycleState::Loaded);
                info!(model_path = %path.display(), context_size, "Model loaded");
                Ok(true)
            }
            Err(e) if e.is_aborted() => {
                self.state.send_replace(LifecycleState::Unloaded);
                info!(model_path = %path.display(), "Model load aborted");
                Ok(false)
            }
            Err(e) => {
                self.state.send_replace(LifecycleState::Unloaded);
                error!(model_path = %path.display(), error = %e, "Failed to load model");
                Ok(false)
            }
        }
    }

    /// Ask an in-flight load to stop
    ///
    /// Returns whether a load was signalled. The load itself reports the
    /// outcome and moves the state to `Unloaded`.
    pub fn abort_load(&self) -> bool {
        let slot = self.lock_load_cancel();
        if self.get_state() != LifecycleState::Loading {
            return false;
        }

        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                info!("Model load abort requested");
                true
            }
            None => false,
        }
    }

    /// Release the model. Returns `true` when nothing was loaded.
    pub async fn unload_model(&self) -> bool {
        match self.teardown().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to dispose model");
                false
            }
        }
    }

    /// Loaded handle, locked for the caller's use
    pub(crate) async fn loaded_handle(&self) -> Result<MappedMutexGuard<'_, ModelHandle>> {
        let guard = self.handle.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| RuntimeError::NotLoaded)
    }

    /// Embedding vector for `text` from the loaded model
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut handle = self.loaded_handle().await?;
        let ctx = handle
            .embedding_context()
            .await
            .map_err(|e| RuntimeError::BackendInference(e.to_string()))?;
        ctx.embed(text)
            .await
            .map_err(|e| RuntimeError::BackendInference(e.to_string()))
    }

    async fn teardown(&self) -> Result<()> {
        let mut slot = self.handle.lock().await;
        let Some(handle) = slot.take() else {
            return Ok(());
        };

        self.state.send_replace(LifecycleState::Unloading);
        let model_path = handle.info().model_path.clone();
        let result = handle.dispose();
        // Best effort: a failed stage still leaves the runtime reusable
        self.state.send_replace(LifecycleState::Unloaded);

        if result.is_ok() {
            info!(model_path = %model_path.display(), "Model unloaded");
        }
        result
    }

    async fn build_handle(
        &self,
        path: &Path,
        settings: &LlmSettings,
        cancel: &CancellationToken,
    ) -> Result<ModelHandle> {
        let gpu_layers = GpuLayers::from_setting(settings.gpu_layers);
        let params = ModelParams {
            model_path: path.to_path_buf(),
            gpu_layers,
            use_mlock: settings.use_mlock,
        };

        let model = self
            .backend
            .load_model(&params, cancel)
            .await
            .map_err(|e| {
                if cancel.is_cancelled() {
                    RuntimeError::Aborted
                } else {
                    RuntimeError::LoadFailed {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let train_context_size = model.train_context_size();
        let context_size = if train_context_size == 0 {
            settings.context_size
        } else {
            settings.context_size.min(train_context_size)
        };
        let ctx_params = ContextParams {
            context_size,
            batch_size: self.batch_size.clamp(1, context_size.max(1)),
            flash_attention: settings.flash_attention,
        };

        if self.warm_up {
            if let Err(e) = warm_up(model.as_ref(), ctx_params, cancel).await {
                release(model, None);
                return Err(self.load_error(path, cancel, e));
            }
        }
        if cancel.is_cancelled() {
            release(model, None);
            return Err(RuntimeError::Aborted);
        }

        let inner = match model.create_context(ctx_params).await {
            Ok(inner) => inner,
            Err(e) => {
                release(model, None);
                return Err(self.load_error(path, cancel, e));
            }
        };
        let context = InferenceContext::new(inner, self.template);
        if cancel.is_cancelled() {
            release(model, Some(context));
            return Err(RuntimeError::Aborted);
        }

        let info = ModelInfo {
            model_path: path.to_path_buf(),
            context_size,
            train_context_size,
            gpu_layers,
            use_mlock: settings.use_mlock,
            flash_attention: settings.flash_attention,
            loaded_at: chrono::Utc::now(),
        };

        Ok(ModelHandle::new(info, model, context))
    }

    fn load_error(&self, path: &Path, cancel: &CancellationToken, e: anyhow::Error) -> RuntimeError {
        if cancel.is_cancelled() {
            RuntimeError::Aborted
        } else {
            RuntimeError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn lock_load_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.load_cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Prime the native kernels with a one-token generation on a throwaway context
async fn warm_up(
    model: &dyn LoadedModel,
    params: ContextParams,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let ctx = model.create_context(params).await?;
    let (tokens, _rx) = mpsc::unbounded_channel();
    let request = GenerationRequest {
        prompt: WARM_UP_PROMPT.to_string(),
        temperature: 0.0,
        max_tokens: 1,
        stop_sequences: Vec::new(),
        seed: None,
    };

    let result = ctx.generate(request, cancel.clone(), tokens).await;
    let disposed = ctx.dispose();
    result?;
    disposed?;

    debug!("Model warm-up finished");
    Ok(())
}

/// Free a partially built handle after a failed or aborted load
fn release(model: Box<dyn LoadedModel>, context: Option<InferenceContext>) {
    if let Some(context) = context {
        if let Err(e) = context.inner.dispose() {
            warn!(error = %e, "Failed to dispose context of abandoned load");
        }
    }
    if let Err(e) = model.dispose() {
        warn!(error = %e, "Failed to dispose abandoned model");
    }
}
