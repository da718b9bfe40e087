// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat session controller
//!
//! Owns the single conversational session of the loaded model and runs
//! streaming generation against it. Generation can be cancelled from any task
//! through [`ChatController::abort_inference`]; a cancelled call returns the
//! partial text instead of an error.
//!
//! A running generation holds the model handle until it returns, so embedding
//! requests, session changes and unloading wait for it. Use
//! `abort_inference` to free the model early.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{FinishReason, GenerationRequest};
use crate::errors::{Result, RuntimeError};
use crate::inference::{ChatSession, ChatTurn, ModelLifecycle};

/// Parameters of one inference call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOptions {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Replaces the session memory before generating; empty means unset
    pub history: Option<Vec<ChatTurn>>,
    /// Retrieved document text placed ahead of the prompt
    pub context: Option<String>,
    pub seed: Option<u32>,
}

impl InferenceOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 1024,
            history: None,
            context: None,
            seed: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// How an inference call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    Completed(String),
    /// Stopped by `abort_inference`; holds what was streamed before the stop
    Aborted { partial: String },
}

impl InferenceOutcome {
    pub fn text(&self) -> &str {
        match self {
            InferenceOutcome::Completed(text) => text,
            InferenceOutcome::Aborted { partial } => partial,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            InferenceOutcome::Completed(text) => text,
            InferenceOutcome::Aborted { partial } => partial,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, InferenceOutcome::Aborted { .. })
    }
}

/// Place retrieved text ahead of the user's prompt
pub fn build_prompt(prompt: &str, context: Option<&str>) -> String {
    match context.filter(|c| !c.trim().is_empty()) {
        Some(context) => format!(
            "Use the following context to answer the question.\n\nContext:\n{}\n\n{}",
            context, prompt
        ),
        None => prompt.to_string(),
    }
}

pub struct ChatController {
    lifecycle: Arc<ModelLifecycle>,
    inference_cancel: Mutex<Option<CancellationToken>>,
}

impl ChatController {
    pub fn new(lifecycle: Arc<ModelLifecycle>) -> Self {
        Self {
            lifecycle,
            inference_cancel: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle> {
        &self.lifecycle
    }

    /// Start a fresh session on the loaded model, disposing any previous one
    pub async fn create_session(&self, system_prompt: Option<&str>) -> Result<()> {
        let mut handle = self.lifecycle.loaded_handle().await?;
        let ctx = handle.context_mut().ok_or(RuntimeError::NotLoaded)?;

        if let Some(previous) = ctx.session.take() {
            if let Err(e) = previous.dispose() {
                error!(error = %e, "Failed to dispose previous chat session");
            }
        }

        ctx.session = Some(ChatSession::new(system_prompt));
        debug!(has_system_prompt = system_prompt.is_some(), "Chat session created");
        Ok(())
    }

    pub async fn has_session(&self) -> bool {
        match self.lifecycle.loaded_handle().await {
            Ok(handle) => handle.has_session(),
            Err(_) => false,
        }
    }

    /// Replace the session memory; no-op without a session
    pub async fn set_history(&self, turns: Vec<ChatTurn>) -> Result<()> {
        let Ok(mut handle) = self.lifecycle.loaded_handle().await else {
            return Ok(());
        };
        if let Some(session) = handle.context_mut().and_then(|ctx| ctx.session.as_mut()) {
            debug!(turns = turns.len(), "Chat history set");
            session.replace_history(turns);
        }
        Ok(())
    }

    /// Empty the session memory in place; no-op without a session
    pub async fn clear_history(&self) -> Result<()> {
        let Ok(mut handle) = self.lifecycle.loaded_handle().await else {
            return Ok(());
        };
        if let Some(session) = handle.context_mut().and_then(|ctx| ctx.session.as_mut()) {
            session.clear();
        }
        Ok(())
    }

    /// Snapshot of the session memory
    pub async fn history(&self) -> Option<Vec<ChatTurn>> {
        let mut handle = self.lifecycle.loaded_handle().await.ok()?;
        let ctx = handle.context_mut()?;
        ctx.session.as_ref().map(|s| s.turns().to_vec())
    }

    /// Generate a reply, calling `on_token` for every fragment in order
    ///
    /// Fails with `NotLoaded` or `NoSession` before anything is generated.
    /// Cancellation through [`abort_inference`](Self::abort_inference) is not
    /// an error: the partial reply is returned, while the session records an
    /// empty reply as the chat ledger does. Dropping the returned future
    /// cancels the generation.
    pub async fn run_inference<F>(&self, options: InferenceOptions, mut on_token: F) -> Result<InferenceOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let mut handle = self.lifecycle.loaded_handle().await?;
        let ctx = handle.context_mut().ok_or(RuntimeError::NotLoaded)?;
        let template = ctx.template;
        let session = ctx.session.as_mut().ok_or(RuntimeError::NoSession)?;

        if let Some(history) = options.history.filter(|h| !h.is_empty()) {
            session.replace_history(history);
        }

        let prompt = build_prompt(&options.prompt, options.context.as_deref());
        let request = GenerationRequest {
            prompt: session.render_prompt(template, &prompt),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stop_sequences: template.stop_sequences(),
            seed: options.seed,
        };

        let cancel = CancellationToken::new();
        let _armed = ArmedCancel::arm(&self.inference_cancel, cancel.clone());

        let (tokens, mut fragments) = mpsc::unbounded_channel::<String>();
        let mut generation = ctx.inner.generate(request, cancel.clone(), tokens);
        let mut streamed = String::new();

        let result = loop {
            tokio::select! {
                biased;
                Some(fragment) = fragments.recv() => {
                    on_token(&fragment);
                    streamed.push_str(&fragment);
                }
                result = &mut generation => break result,
            }
        };
        while let Ok(fragment) = fragments.try_recv() {
            on_token(&fragment);
            streamed.push_str(&fragment);
        }

        match result {
            Ok(outcome) if outcome.finish_reason == FinishReason::Cancelled => {
                info!(tokens = outcome.tokens_generated, "Inference aborted");
                session.push_exchange(&options.prompt, "");
                Ok(InferenceOutcome::Aborted {
                    partial: outcome.text,
                })
            }
            Ok(outcome) => {
                debug!(
                    tokens = outcome.tokens_generated,
                    finish_reason = ?outcome.finish_reason,
                    "Inference finished"
                );
                session.push_exchange(&options.prompt, &outcome.text);
                Ok(InferenceOutcome::Completed(outcome.text))
            }
            Err(e) if cancel.is_cancelled() => {
                info!(error = %e, "Inference aborted");
                session.push_exchange(&options.prompt, "");
                Ok(InferenceOutcome::Aborted { partial: streamed })
            }
            Err(e) => {
                error!(error = %e, "Failed to run inference");
                Err(RuntimeError::BackendInference(e.to_string()))
            }
        }
    }

    /// Cancel the running generation. Returns whether one was running.
    pub fn abort_inference(&self) -> bool {
        match lock_slot(&self.inference_cancel).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

fn lock_slot(slot: &Mutex<Option<CancellationToken>>) -> MutexGuard<'_, Option<CancellationToken>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publishes the token of the running call and withdraws it on every exit,
/// including a dropped future
struct ArmedCancel<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
    token: CancellationToken,
}

impl<'a> ArmedCancel<'a> {
    fn arm(slot: &'a Mutex<Option<CancellationToken>>, token: CancellationToken) -> Self {
        *lock_slot(slot) = Some(token.clone());
        Self { slot, token }
    }
}

impl Drop for ArmedCancel<'_> {
    fn drop(&mut self) {
        // Stops a backend still generating for a caller that went away
        self.token.cancel();
        lock_slot(self.slot).take();
    }
}
