// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat session memory
//!
//! A session is the ordered conversational memory bound to the inference
//! context it was created on. It is not the system of record: callers replace
//! its history from the chat ledger before each generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::RuntimeError;
use crate::inference::ChatTemplate;

/// Role of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl FromStr for ChatRole {
    type Err = RuntimeError;

    /// Strict mapping, unknown roles are rejected
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ChatRole::System),
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            other => Err(RuntimeError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn of conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// Build a turn from a stored message, validating its role
    pub fn from_parts(role: &str, content: impl Into<String>) -> Result<Self, RuntimeError> {
        Ok(Self::new(role.parse()?, content))
    }
}

/// Conversational memory of the single active session
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    turns: Vec<ChatTurn>,
}

impl ChatSession {
    pub fn new(system_prompt: Option<&str>) -> Self {
        let turns = system_prompt
            .filter(|p| !p.is_empty())
            .map(|p| vec![ChatTurn::system(p)])
            .unwrap_or_default();
        Self { turns }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Overwrite the whole memory
    pub fn replace_history(&mut self, turns: Vec<ChatTurn>) {
        self.turns = turns;
    }

    /// Empty the memory in place, system prompt included
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Record a finished exchange
    pub fn push_exchange(&mut self, prompt: &str, response: &str) {
        self.turns.push(ChatTurn::user(prompt));
        self.turns.push(ChatTurn::assistant(response));
    }

    /// Render the memory plus a pending user prompt with the model's template
    pub fn render_prompt(&self, template: ChatTemplate, prompt: &str) -> String {
        let mut turns = self.turns.clone();
        turns.push(ChatTurn::user(prompt));
        template.format_turns(&turns)
    }

    /// Release the session. Memory is plain data, nothing native to free.
    pub fn dispose(self) -> anyhow::Result<()> {
        Ok(())
    }
}
