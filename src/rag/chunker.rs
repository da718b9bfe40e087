// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Text chunker
//!
//! Splits text into windows of at most `chunk_size` characters. Each window
//! ends at the latest paragraph break it contains, else the latest line
//! break, sentence end or space, else at the hard limit. The next window
//! starts `chunk_overlap` characters before the previous one ended, so
//! consecutive chunks share exactly `chunk_overlap` characters.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RuntimeError};

/// Break candidates, most preferred first; the break falls after the separator
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Character span of a chunk in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    /// Position of the chunk in the document, from 0
    pub index: usize,
    pub document_id: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RuntimeError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into overlapping chunks. Blank text yields none.
    pub fn split(&self, text: &str, document_id: &str) -> Vec<DocumentChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        let separators: Vec<Vec<char>> = SEPARATORS.iter().map(|s| s.chars().collect()).collect();

        let mut chunks = Vec::new();
        let mut pos = 0;
        loop {
            let end = if chars.len() - pos <= self.chunk_size {
                chars.len()
            } else {
                self.find_break(&chars, &separators, pos)
            };

            chunks.push(DocumentChunk {
                content: chars[pos..end].iter().collect(),
                index: chunks.len(),
                document_id: document_id.to_string(),
                metadata: ChunkMetadata { start: pos, end },
            });

            if end == chars.len() {
                break;
            }
            pos = end - self.chunk_overlap;
        }

        chunks
    }

    /// End of the window starting at `pos`; always more than `chunk_overlap`
    /// past `pos` so the next window moves forward
    fn find_break(&self, chars: &[char], separators: &[Vec<char>], pos: usize) -> usize {
        let limit = pos + self.chunk_size;

        for separator in separators {
            let len = separator.len();
            if len > self.chunk_size {
                continue;
            }
            let mut start = limit - len;
            loop {
                let brk = start + len;
                if brk - pos <= self.chunk_overlap {
                    break;
                }
                if chars[start..brk] == separator[..] {
                    return brk;
                }
                if start == pos {
                    break;
                }
                start -= 1;
            }
        }

        limit
    }
}
