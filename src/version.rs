// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the offline LLM runtime

/// Semantic version number
pub const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Capabilities compiled into this build
pub const FEATURES: &[&str] = &[
    "gguf-models",
    "streaming-inference",
    "abortable-load",
    "chat-sessions",
    "document-ingestion",
    "similarity-search",
];

/// Supported document types for ingestion
pub const SUPPORTED_FILE_TYPES: &[&str] = &["txt", "md", "pdf", "docx"];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Offline LLM Runtime {}", VERSION_NUMBER)
}

/// Get full version info for diagnostics output
pub fn get_version_info() -> serde_json::Value {
    serde_json::json!({
        "version": VERSION_NUMBER,
        "features": FEATURES,
        "file_types": SUPPORTED_FILE_TYPES,
    })
}
