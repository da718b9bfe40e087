// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Export all submodules and their public types
pub mod chat_template;
pub mod controller;
pub(crate) mod handle;
pub mod lifecycle;
pub mod session;

// Re-export main types for convenience
pub use chat_template::ChatTemplate;
pub use controller::{build_prompt, ChatController, InferenceOptions, InferenceOutcome};
pub use handle::ModelInfo;
pub use lifecycle::{LifecycleState, LoadOptions, ModelLifecycle};
pub use session::{ChatRole, ChatSession, ChatTurn};
