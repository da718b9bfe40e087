// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use std::path::Path;

use super::{extraction_failed, FileReader};
use crate::errors::Result;

/// Text layer of PDF documents; scanned pages yield no text
pub struct PdfReader;

#[async_trait]
impl FileReader for PdfReader {
    async fn load_data(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| extraction_failed(path, e))?;

        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| extraction_failed(&owned, e))?
            .map_err(|e| extraction_failed(&owned, e))
    }
}
