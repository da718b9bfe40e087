// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod records;

// Re-export main types for convenience
pub use records::{
    Chat, ChatMessage, Document, InMemoryRecordStore, NewDocument, NewMessage, RecordStore,
    NEW_CHAT_TITLE,
};
