//! Text chunking
//!
//! Splits document text into overlapping chunks for embedding. Two
//! strategies: `length` is a sliding window with a soft word-boundary,
//! `semantic` accumulates blank-line paragraphs up to the chunk size.
//! All window arithmetic is in characters so multi-byte text never splits
//! inside a code point.

use crate::config::ChunkingStrategy;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// How far back from a hard cut to look for a space or newline
const BOUNDARY_LOOKBACK: usize = 50;

/// Safety cap on sliding-window iterations; tripping it is a bug, not an
/// input condition
const MAX_ITERATIONS: usize = 1000;

/// Metadata carried on every chunk into the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_name: String,
    pub kb_id: i64,
    pub doc_id: i64,
    pub user_id: i64,
}

/// A chunk of document text ready for embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Globally unique id, the primary key in the vector index
    pub id: String,
    pub content: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub metadata: ChunkMetadata,
}

/// Configured chunker
#[derive(Debug, Clone)]
pub struct DocumentChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    strategy: ChunkingStrategy,
}

impl DocumentChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, strategy: ChunkingStrategy) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            strategy,
        }
    }

    /// Split text into chunks with ids, positions, and caller metadata.
    /// Empty content never becomes a chunk.
    pub fn process(&self, content: &str, metadata: ChunkMetadata) -> Result<Vec<DocumentChunk>> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::ParseFailed("document contained no text".to_string()));
        }

        debug!(
            content_length = content.chars().count(),
            strategy = ?self.strategy,
            chunk_size = self.chunk_size,
            chunk_overlap = self.chunk_overlap,
            "Splitting content"
        );

        let pieces = match self.strategy {
            ChunkingStrategy::Length => self.split_by_length(content)?,
            ChunkingStrategy::Semantic => self.split_by_semantic(content)?,
        };

        let total = pieces.len();
        let chunks: Vec<DocumentChunk> = pieces
            .into_iter()
            .enumerate()
            .filter(|(_, piece)| !piece.trim().is_empty())
            .map(|(index, piece)| DocumentChunk {
                id: Uuid::new_v4().to_string(),
                content: piece,
                chunk_index: index,
                total_chunks: total,
                metadata: metadata.clone(),
            })
            .collect();

        debug!(chunk_count = chunks.len(), "Content split complete");
        Ok(chunks)
    }

    /// Sliding window over the text with a soft word-boundary.
    ///
    /// The next window starts at `end - overlap`, clamped to at least one
    /// character past the current start so the loop always makes progress
    /// even when the overlap is as large as the window.
    fn split_by_length(&self, content: &str) -> Result<Vec<String>> {
        let chars: Vec<char> = content.chars().collect();
        let total = chars.len();

        if total <= self.chunk_size {
            return Ok(vec![content.to_string()]);
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut iterations = 0;

        while start < total {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(AppError::Internal(format!(
                    "length chunker exceeded {MAX_ITERATIONS} iterations at offset {start} of {total}"
                )));
            }

            let mut end = (start + self.chunk_size).min(total);

            // Walk the cut back to a space or newline, up to the lookback
            if end < total {
                let floor = end.saturating_sub(BOUNDARY_LOOKBACK);
                for i in (floor.max(start) + 1..=end).rev() {
                    if chars[i] == ' ' || chars[i] == '\n' {
                        end = i;
                        break;
                    }
                }
            }

            let window: String = chars[start..end].iter().collect();
            chunks.push(window.trim().to_string());

            if end >= total {
                break;
            }

            let next_start = end.saturating_sub(self.chunk_overlap);
            start = if next_start <= start { start + 1 } else { next_start };
        }

        Ok(chunks)
    }

    /// Paragraph accumulation: blank-line paragraphs are packed into chunks
    /// up to the chunk size; an oversized paragraph is flushed and split
    /// with the length strategy.
    fn split_by_semantic(&self, content: &str) -> Result<Vec<String>> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_size = 0;

        for paragraph in content.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            let para_size = paragraph.chars().count();

            if para_size > self.chunk_size {
                if current_size > 0 {
                    chunks.push(std::mem::take(&mut current));
                    current_size = 0;
                }
                chunks.extend(self.split_by_length(paragraph)?);
                continue;
            }

            // The join costs two characters when the buffer is non-empty
            if current_size > 0 && current_size + para_size + 2 > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }

            if current_size > 0 {
                current.push_str("\n\n");
                current_size += 2;
            }
            current.push_str(paragraph);
            current_size += para_size;
        }

        if current_size > 0 {
            chunks.push(current);
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ChunkMetadata {
        ChunkMetadata {
            file_name: "test.txt".to_string(),
            kb_id: 1,
            doc_id: 1,
            user_id: 1,
        }
    }

    fn chunker(size: usize, overlap: usize, strategy: ChunkingStrategy) -> DocumentChunker {
        DocumentChunker::new(size, overlap, strategy)
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunker(50, 5, ChunkingStrategy::Length)
            .process("# Hi\n\npara 1\n\npara 2", metadata())
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[test]
    fn empty_content_is_rejected() {
        let err = chunker(50, 5, ChunkingStrategy::Length)
            .process("   \n\n  ", metadata())
            .unwrap_err();
        assert!(matches!(err, AppError::ParseFailed(_)));
    }

    #[test]
    fn window_advances_and_covers_whole_text() {
        let text = "abcdefghij".repeat(20); // 200 chars, no soft boundaries
        let chunks = chunker(50, 10, ChunkingStrategy::Length)
            .process(&text, metadata())
            .unwrap();
        assert!(chunks.len() > 1);
        // Last chunk ends with the end of the text
        assert!(text.ends_with(chunks.last().unwrap().content.as_str()));
    }

    #[test]
    fn overlap_larger_than_size_still_terminates() {
        // Forward-progress guard: overlap 20 > size 10
        let text = "x".repeat(100);
        let chunks = chunker(10, 20, ChunkingStrategy::Length)
            .process(&text, metadata())
            .unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.len() <= 100);
    }

    #[test]
    fn soft_boundary_prefers_spaces() {
        // A space sits 3 chars before the hard cut at 20
        let text = "aaaaaaaaaaaaaaaaa bbbbbbbbbbbbbbbbbbbb cccc";
        let chunks = chunker(20, 0, ChunkingStrategy::Length)
            .process(text, metadata())
            .unwrap();
        // First window is cut at the space, not mid-word
        assert_eq!(chunks[0].content, "aaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let text = "自然语言处理是人工智能的一个重要方向。".repeat(30);
        let chunks = chunker(40, 10, ChunkingStrategy::Length)
            .process(&text, metadata())
            .unwrap();
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= 40);
        }
    }

    #[test]
    fn semantic_packs_small_paragraphs() {
        let text = "para one\n\npara two\n\npara three";
        let chunks = chunker(100, 0, ChunkingStrategy::Semantic)
            .process(text, metadata())
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "para one\n\npara two\n\npara three");
    }

    #[test]
    fn semantic_flushes_when_next_paragraph_would_overflow() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = chunker(40, 0, ChunkingStrategy::Semantic)
            .process(&text, metadata())
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "a".repeat(30));
        assert_eq!(chunks[1].content, "b".repeat(30));
    }

    #[test]
    fn semantic_splits_oversized_paragraph_by_length() {
        let text = format!("small start\n\n{}", "x".repeat(150));
        let chunks = chunker(50, 5, ChunkingStrategy::Semantic)
            .process(&text, metadata())
            .unwrap();
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].content, "small start");
        for chunk in &chunks[1..] {
            assert!(chunk.content.chars().count() <= 50);
        }
    }

    #[test]
    fn chunk_ids_are_unique_and_metadata_is_attached() {
        let text = "abcdefghij".repeat(20);
        let chunks = chunker(50, 10, ChunkingStrategy::Length)
            .process(&text, metadata())
            .unwrap();

        let mut ids: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());

        for chunk in &chunks {
            assert_eq!(chunk.metadata.kb_id, 1);
            assert_eq!(chunk.total_chunks, chunks.len());
        }
    }
}
