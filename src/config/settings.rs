// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Load-time model settings
//!
//! These are the values the desktop settings store hands over when a model is
//! loaded: context window cap, GPU offload, mlock and flash attention.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// GPU offload policy derived from the integer setting
///
/// The settings store keeps a single integer: `-1` selects every layer the
/// device can hold, `0` keeps the model on the CPU. Any other value is treated
/// as automatic selection as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuLayers {
    Auto,
    CpuOnly,
}

impl GpuLayers {
    pub fn from_setting(value: i32) -> Self {
        match value {
            0 => GpuLayers::CpuOnly,
            -1 => GpuLayers::Auto,
            other => {
                warn!(
                    gpu_layers = other,
                    "Explicit GPU layer counts are not supported, using auto"
                );
                GpuLayers::Auto
            }
        }
    }

    /// Layer count handed to the native loader
    pub fn as_layer_count(&self) -> u32 {
        match self {
            // llama.cpp clamps to the real layer count
            GpuLayers::Auto => u32::MAX,
            GpuLayers::CpuOnly => 0,
        }
    }
}

/// Settings read from the application store when loading a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Context window cap in tokens
    pub context_size: u32,
    /// -1 = auto, 0 = CPU only
    pub gpu_layers: i32,
    /// Pin the weights in RAM
    pub use_mlock: bool,
    /// Enable the fused attention kernel
    pub flash_attention: bool,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            context_size: 2048,
            gpu_layers: -1,
            use_mlock: false,
            flash_attention: false,
        }
    }
}
