// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! File readers used by document ingestion
//!
//! A reader is picked by file extension. Unknown extensions fail with
//! [`RuntimeError::UnsupportedFileType`] before the file is opened.

pub mod docx;
pub mod pdf;
pub mod text;

pub use docx::DocxReader;
pub use pdf::PdfReader;
pub use text::TextFileReader;

use async_trait::async_trait;
use std::path::Path;

use crate::errors::{Result, RuntimeError};

#[async_trait]
pub trait FileReader: Send + Sync {
    /// Extract the plain text of the file
    async fn load_data(&self, path: &Path) -> Result<String>;
}

/// Lowercase extension of `path`, the empty string when there is none
pub fn file_type(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Reader for the file's extension
pub fn reader_for(path: &Path) -> Result<Box<dyn FileReader>> {
    match file_type(path).as_str() {
        "txt" | "md" => Ok(Box::new(TextFileReader)),
        "pdf" => Ok(Box::new(PdfReader)),
        "docx" => Ok(Box::new(DocxReader)),
        other => Err(RuntimeError::UnsupportedFileType(other.to_string())),
    }
}

/// Extract the text of a txt, md, pdf or docx file
pub async fn load_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    reader_for(path)?.load_data(path).await
}

pub(crate) fn extraction_failed(path: &Path, reason: impl ToString) -> RuntimeError {
    RuntimeError::ExtractionFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
