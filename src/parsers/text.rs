// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use std::path::Path;

use super::{extraction_failed, FileReader};
use crate::errors::Result;

/// UTF-8 text and markdown files
pub struct TextFileReader;

#[async_trait]
impl FileReader for TextFileReader {
    async fn load_data(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| extraction_failed(path, e))
    }
}
