// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Runtime configuration
//!
//! Loaded from a TOML file and overridable from environment variables, the
//! same way the node reads its production config.

pub mod settings;

pub use settings::{GpuLayers, LlmSettings};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{Result, RuntimeError};
use crate::inference::ChatTemplate;

/// Text chunking policy for ingestion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
        }
    }
}

/// Similarity search policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Results at or beyond this cosine distance are discarded
    pub max_distance: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 2,
            max_distance: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub llm: LlmSettings,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub chat_template: ChatTemplate,
    /// Run a one-token generation right after loading
    pub warm_up: bool,
    pub batch_size: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            llm: LlmSettings::default(),
            chunking: ChunkingConfig::default(),
            search: SearchConfig::default(),
            chat_template: ChatTemplate::ChatML,
            warm_up: true,
            batch_size: 2048,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: RuntimeConfig = toml::from_str(&content)
            .map_err(|e| RuntimeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(num) = env_parse::<u32>("LLM_CONTEXT_SIZE") {
            self.llm.context_size = num;
        }
        if let Some(num) = env_parse::<i32>("LLM_GPU_LAYERS") {
            self.llm.gpu_layers = num;
        }
        if let Some(flag) = env_flag("LLM_USE_MLOCK") {
            self.llm.use_mlock = flag;
        }
        if let Some(flag) = env_flag("LLM_FLASH_ATTENTION") {
            self.llm.flash_attention = flag;
        }
        if let Some(num) = env_parse::<u32>("LLAMA_BATCH_SIZE") {
            self.batch_size = num;
        }
        if let Ok(dir) = std::env::var("LLM_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(RuntimeError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.llm.context_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "context_size must be greater than 0".to_string(),
            ));
        }
        if !(self.search.max_distance > 0.0 && self.search.max_distance <= 2.0) {
            return Err(RuntimeError::InvalidConfig(format!(
                "max_distance must be in (0, 2], got {}",
                self.search.max_distance
            )));
        }
        Ok(())
    }

    /// Directory holding the vector tables
    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}
