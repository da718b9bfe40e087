// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! DOCX text extraction
//!
//! A DOCX file is a ZIP archive; the body lives in `word/document.xml` as
//! WordprocessingML. Text runs (`<w:t>`) are concatenated, paragraphs end
//! with a newline, tabs and breaks are kept. Entities are decoded by the
//! XML parser.

use async_trait::async_trait;
use std::io::{Cursor, Read};
use std::path::Path;

use super::{extraction_failed, FileReader};
use crate::errors::Result;

const DOCUMENT_PART: &str = "word/document.xml";
const WORD_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

pub struct DocxReader;

#[async_trait]
impl FileReader for DocxReader {
    async fn load_data(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| extraction_failed(path, e))?;

        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_docx_text(&bytes))
            .await
            .map_err(|e| extraction_failed(&owned, e))?
            .map_err(|reason| extraction_failed(&owned, reason))
    }
}

/// Plain text of a DOCX archive held in memory
pub fn extract_docx_text(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| format!("Failed to read DOCX as ZIP: {}", e))?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| format!("Missing {}: {}", DOCUMENT_PART, e))?
        .read_to_string(&mut xml)
        .map_err(|e| format!("Failed to read {}: {}", DOCUMENT_PART, e))?;

    text_from_document_xml(&xml)
}

fn text_from_document_xml(xml: &str) -> std::result::Result<String, String> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| format!("Invalid {}: {}", DOCUMENT_PART, e))?;

    let mut text = String::new();
    collect_text(doc.root(), &mut text);
    Ok(text.trim_end().to_string())
}

fn collect_text(node: roxmltree::Node<'_, '_>, text: &mut String) {
    for child in node.children().filter(|n| n.is_element()) {
        if child.tag_name().namespace() != Some(WORD_NS) {
            collect_text(child, text);
            continue;
        }
        match child.tag_name().name() {
            "t" => text.push_str(child.text().unwrap_or_default()),
            "tab" => text.push('\t'),
            "br" | "cr" => text.push('\n'),
            "p" => {
                collect_text(child, text);
                text.push('\n');
            }
            _ => collect_text(child, text),
        }
    }
}
