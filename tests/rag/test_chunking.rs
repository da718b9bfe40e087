// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use offline_llm_runtime::config::ChunkingConfig;
use offline_llm_runtime::rag::TextChunker;

fn sample_text() -> String {
    let sentences = [
        "Local models keep every document on the machine.",
        "The chunker cuts text into windows that overlap.",
        "Each window is embedded and stored as one row.",
        "Search compares the question with every row.",
    ];
    let mut text = String::new();
    for i in 0..40 {
        text.push_str(sentences[i % sentences.len()]);
        text.push(if i % 7 == 6 { '\n' } else { ' ' });
        if i % 13 == 12 {
            text.push('\n');
        }
    }
    text
}

#[test]
fn test_default_policy_bounds_and_overlap() {
    let config = ChunkingConfig::default();
    let chunker = TextChunker::new(config.chunk_size, config.chunk_overlap).unwrap();
    let text = sample_text();
    let total = text.chars().count();

    let chunks = chunker.split(&text, "doc-1");

    assert!(chunks.len() > 1);
    assert_eq!(chunks.first().unwrap().metadata.start, 0);
    assert_eq!(chunks.last().unwrap().metadata.end, total);

    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index, i);
        assert_eq!(chunk.document_id, "doc-1");
        assert!(chunk.content.chars().count() <= 500);
        assert_eq!(
            chunk.content.chars().count(),
            chunk.metadata.end - chunk.metadata.start
        );
    }

    for pair in chunks.windows(2) {
        assert_eq!(pair[1].metadata.start, pair[0].metadata.end - 100);
        let tail: String = pair[0]
            .content
            .chars()
            .skip(pair[0].content.chars().count() - 100)
            .collect();
        assert!(pair[1].content.starts_with(&tail));
    }
}

#[test]
fn test_chunks_cover_the_text() {
    let chunker = TextChunker::new(120, 20).unwrap();
    let text = sample_text();

    let chunks = chunker.split(&text, "doc");

    let mut rebuilt = chunks[0].content.clone();
    for chunk in &chunks[1..] {
        rebuilt.extend(chunk.content.chars().skip(20));
    }
    assert_eq!(rebuilt, text);
}

#[test]
fn test_small_window_example() {
    let chunker = TextChunker::new(20, 5).unwrap();

    let chunks = chunker.split("The sky is blue. The grass is green.", "doc");
    let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();

    assert_eq!(contents, vec!["The sky is blue. ", "lue. The grass is ", "s is green."]);
}
