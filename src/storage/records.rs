// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat and document ledger
//!
//! The record store is the system of record for chats and ingested documents.
//! The in-memory implementation backs the CLI and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Result, RuntimeError};

/// Title given to chats created from a fresh session
pub const NEW_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
    /// SHA-256 of the content, hex encoded
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
}

impl NewMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Stored message; the role is kept as written and validated on use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a document, returning its id
    async fn create_document(&self, document: NewDocument) -> Result<String>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Remove every document, returning how many were deleted
    async fn delete_all_documents(&self) -> Result<usize>;

    async fn create_chat(&self, title: &str) -> Result<Chat>;

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>>;

    async fn list_chats(&self) -> Result<Vec<Chat>>;

    async fn append_message(&self, chat_id: &str, message: NewMessage) -> Result<Chat>;

    async fn clear_messages(&self, chat_id: &str) -> Result<()>;

    async fn delete_chat(&self, id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
struct Ledger {
    documents: Vec<Document>,
    chats: HashMap<String, Chat>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn chat_not_found(id: &str) -> RuntimeError {
    RuntimeError::RecordStore(format!("Chat not found: {}", id))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_document(&self, document: NewDocument) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let record = Document {
            id: id.clone(),
            content_hash: content_hash(&document.content),
            title: document.title,
            content: document.content,
            file_name: document.file_name,
            file_path: document.file_path,
            file_size: document.file_size,
            file_type: document.file_type,
            created_at: Utc::now(),
        };

        debug!(document_id = %id, title = %record.title, "Document created");
        self.ledger.write().await.documents.push(record);
        Ok(id)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self
            .ledger
            .read()
            .await
            .documents
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.ledger.read().await.documents.clone())
    }

    async fn delete_all_documents(&self) -> Result<usize> {
        let mut ledger = self.ledger.write().await;
        let removed = ledger.documents.len();
        ledger.documents.clear();
        Ok(removed)
    }

    async fn create_chat(&self, title: &str) -> Result<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.ledger
            .write()
            .await
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>> {
        Ok(self.ledger.read().await.chats.get(id).cloned())
    }

    async fn list_chats(&self) -> Result<Vec<Chat>> {
        let mut chats: Vec<Chat> = self.ledger.read().await.chats.values().cloned().collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn append_message(&self, chat_id: &str, message: NewMessage) -> Result<Chat> {
        let mut ledger = self.ledger.write().await;
        let chat = ledger
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| chat_not_found(chat_id))?;

        let now = Utc::now();
        chat.messages.push(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: message.role,
            content: message.content,
            created_at: now,
        });
        chat.updated_at = now;
        Ok(chat.clone())
    }

    async fn clear_messages(&self, chat_id: &str) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let chat = ledger
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| chat_not_found(chat_id))?;
        chat.messages.clear();
        chat.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> Result<bool> {
        Ok(self.ledger.write().await.chats.remove(id).is_some())
    }
}
