//! Recursive, boundary-aware text chunker.
//!
//! Splits a document into overlapping [`Chunk`]s of at most `chunk_size`
//! characters, preferring coarse natural boundaries (paragraphs) and only
//! falling back to finer ones (lines, sentences, words, characters) for
//! spans that are still too long.
//!
//! # Algorithm
//!
//! 1. A span of `chunk_size` characters or fewer is a single piece.
//! 2. Otherwise cut it at every occurrence of the first separator in the
//!    hierarchy that appears in it. Each separator stays attached to the
//!    end of the piece it terminates, so the pieces tile the span exactly.
//! 3. Pieces that are still too long recurse with the remaining, finer
//!    separators. The empty separator cuts fixed-width character runs.
//! 4. Merge adjacent pieces greedily into chunks of at most `chunk_size`
//!    characters. After each chunk, the trailing pieces whose combined
//!    length fits in `chunk_overlap` seed the next one.
//!
//! Chunks are reported as byte ranges into the original text, so every
//! chunk is exactly `text[start..end]` and nothing is trimmed or lost.
//!
//! # Example
//!
//! ```rust
//! use rag_chat::chunk::RecursiveSplitter;
//!
//! let splitter = RecursiveSplitter::new(500, 50);
//! let chunks: Vec<_> = splitter
//!     .chunk_document("notes.txt", "Hello world.\n\nSecond paragraph.")
//!     .collect();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata.chunk_index, 0);
//! ```

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::ops::Range;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata};

/// Hex digits of the content hash kept in a chunk id.
const ID_HASH_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    /// Splitter with the default paragraph → line → sentence → word →
    /// character hierarchy.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let defaults = ChunkingConfig::default();
        Self::with_separators(chunk_size, chunk_overlap, defaults.separators)
    }

    pub fn with_separators(chunk_size: usize, chunk_overlap: usize, separators: Vec<String>) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::with_separators(
            config.chunk_size,
            config.chunk_overlap,
            config.separators.clone(),
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text` into chunk byte ranges.
    ///
    /// # Guarantees
    ///
    /// - Text of at most `chunk_size` characters (including `""`) yields
    ///   exactly one range covering all of it.
    /// - The first range starts at 0 and the last ends at `text.len()`.
    /// - Each range holds at most `chunk_size` characters and lies on
    ///   UTF-8 char boundaries.
    /// - Range `i + 1` starts after range `i` starts and no later than it
    ///   ends.
    pub fn split_spans(&self, text: &str) -> Vec<Range<usize>> {
        if char_len(text) <= self.chunk_size {
            return vec![0..text.len()];
        }

        let mut pieces = Vec::new();
        self.split_recursive(text, 0..text.len(), &self.separators, &mut pieces);
        self.merge(&pieces)
    }

    /// Split `text` and package each span as a [`Chunk`] tagged with
    /// `source` and its ordinal. All spans are computed up front; only
    /// the chunk text, id and metadata are built as the iterator is
    /// consumed.
    pub fn chunk_document<'a>(
        &self,
        source: &'a str,
        text: &'a str,
    ) -> impl Iterator<Item = Chunk> + 'a {
        self.split_spans(text)
            .into_iter()
            .enumerate()
            .map(move |(index, span)| make_chunk(source, index as u32, text, span))
    }

    fn split_recursive(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[String],
        out: &mut Vec<(Range<usize>, usize)>,
    ) {
        let span = &text[range.clone()];
        let found = separators
            .iter()
            .position(|sep| sep.is_empty() || span.contains(sep.as_str()));

        let (separator, finer) = match found {
            Some(i) if !separators[i].is_empty() => (separators[i].as_str(), &separators[i + 1..]),
            _ => {
                self.split_chars(text, range, out);
                return;
            }
        };

        for piece in split_after(span, separator) {
            let piece = (range.start + piece.start)..(range.start + piece.end);
            let len = char_len(&text[piece.clone()]);
            if len <= self.chunk_size {
                out.push((piece, len));
            } else {
                self.split_recursive(text, piece, finer, out);
            }
        }
    }

    fn split_chars(&self, text: &str, range: Range<usize>, out: &mut Vec<(Range<usize>, usize)>) {
        let span = &text[range.clone()];
        let mut start = 0;
        let mut count = 0;
        for (offset, _) in span.char_indices() {
            if count == self.chunk_size {
                out.push(((range.start + start)..(range.start + offset), count));
                start = offset;
                count = 0;
            }
            count += 1;
        }
        if count > 0 {
            out.push(((range.start + start)..range.end, count));
        }
    }

    /// Greedy merge of contiguous pieces, carrying `chunk_overlap`
    /// characters of trailing pieces into the next chunk.
    fn merge(&self, pieces: &[(Range<usize>, usize)]) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut window: VecDeque<(Range<usize>, usize)> = VecDeque::new();
        let mut total = 0usize;

        for (range, len) in pieces {
            if total + len > self.chunk_size {
                if let (Some(first), Some(last)) = (window.front(), window.back()) {
                    spans.push(first.0.start..last.0.end);
                }
                while total > self.chunk_overlap || (total > 0 && total + len > self.chunk_size) {
                    match window.pop_front() {
                        Some((_, popped)) => total -= popped,
                        None => break,
                    }
                }
            }
            window.push_back((range.clone(), *len));
            total += len;
        }

        if let (Some(first), Some(last)) = (window.front(), window.back()) {
            spans.push(first.0.start..last.0.end);
        }

        spans
    }
}

/// Rebuild the source text from overlapping chunk spans: the first chunk
/// in full, then the part of each later chunk past its predecessor's end.
pub fn reconstruct(text: &str, spans: &[Range<usize>]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut covered = 0;
    for span in spans {
        let from = covered.max(span.start);
        if from < span.end {
            out.push_str(&text[from..span.end]);
            covered = span.end;
        }
    }
    out
}

/// Build the stable chunk identifier `{source}-chunk-{index}-{hash}`.
///
/// The hash covers source, ordinal and content, so re-ingesting an
/// unchanged chunk overwrites the same record while any edit produces a
/// new one.
pub fn chunk_id(source: &str, index: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-chunk-{}-{}", source, index, &digest[..ID_HASH_LEN])
}

fn make_chunk(source: &str, index: u32, text: &str, span: Range<usize>) -> Chunk {
    let body = &text[span.clone()];
    Chunk {
        id: chunk_id(source, index, body),
        text: body.to_string(),
        metadata: ChunkMetadata {
            source: source.to_string(),
            chunk_index: index,
            start: span.start,
            end: span.end,
        },
    }
}

/// Cut `span` after every occurrence of `separator`. The returned ranges
/// are relative to `span` and tile it exactly.
fn split_after(span: &str, separator: &str) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (pos, matched) in span.match_indices(separator) {
        let end = pos + matched.len();
        if end > start {
            pieces.push(start..end);
            start = end;
        }
    }
    if start < span.len() {
        pieces.push(start..span.len());
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("word{:03}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let splitter = RecursiveSplitter::new(500, 50);
        let chunks: Vec<_> = splitter.chunk_document("a.txt", "Hello, world!").collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].metadata.chunk_index, 0);
    }

    #[test]
    fn test_text_at_exact_limit_is_one_chunk() {
        let text = "x".repeat(500);
        let spans = RecursiveSplitter::new(500, 50).split_spans(&text);
        assert_eq!(spans, vec![0..500]);
    }

    #[test]
    fn test_empty_text() {
        let chunks: Vec<_> = RecursiveSplitter::new(500, 50)
            .chunk_document("a.txt", "")
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "A".repeat(300), "B".repeat(300));
        let chunks: Vec<_> = RecursiveSplitter::new(500, 50)
            .chunk_document("a.txt", &text)
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, format!("{}\n\n", "A".repeat(300)));
        assert_eq!(chunks[1].text, "B".repeat(300));
    }

    #[test]
    fn test_falls_back_to_sentences() {
        let sentence = "A short sentence ends here. ";
        let text = sentence.repeat(20);
        let splitter = RecursiveSplitter::new(100, 0);
        for chunk in splitter.chunk_document("a.txt", &text) {
            assert!(chunk.text.ends_with(". "), "chunk split mid-sentence: {:?}", chunk.text);
        }
    }

    #[test]
    fn test_chunks_respect_size_and_overlap() {
        let text = words(200);
        let splitter = RecursiveSplitter::new(100, 20);
        let spans = splitter.split_spans(&text);
        assert!(spans.len() > 1);
        for span in &spans {
            assert!(text[span.clone()].chars().count() <= 100);
        }
        for pair in spans.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert!(pair[1].start < pair[0].end, "expected overlap between {:?}", pair);
        }
        assert_eq!(spans.first().unwrap().start, 0);
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn test_reconstruction_has_no_content_loss() {
        let texts = vec![
            words(500),
            format!("{}\n\n{}\n{}", words(80), words(120), words(3)),
            "Short. Sentences! Everywhere? ".repeat(60),
            format!("{}\n\n\n\n{}", "x".repeat(1234), " ".repeat(700)),
        ];
        for (size, overlap) in [(100, 0), (100, 30), (500, 50), (37, 36)] {
            let splitter = RecursiveSplitter::new(size, overlap);
            for text in &texts {
                let spans = splitter.split_spans(text);
                assert_eq!(&reconstruct(text, &spans), text);
            }
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "é".repeat(1200);
        let chunks: Vec<_> = RecursiveSplitter::new(500, 50)
            .chunk_document("a.txt", &text)
            .collect();
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.text.chars().count() <= 500);
            assert_eq!(&text[c.metadata.start..c.metadata.end], c.text);
        }
    }

    #[test]
    fn test_without_char_fallback_still_bounded() {
        let splitter = RecursiveSplitter::with_separators(50, 5, vec!["\n\n".to_string()]);
        let text = "z".repeat(175);
        for span in splitter.split_spans(&text) {
            assert!(span.len() <= 50);
        }
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = words(400);
        let chunks: Vec<_> = RecursiveSplitter::new(64, 8)
            .chunk_document("doc.txt", &text)
            .collect();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i as u32, "Index mismatch at position {}", i);
            assert_eq!(c.metadata.source, "doc.txt");
        }
    }

    #[test]
    fn test_chunk_id_deterministic() {
        let a = chunk_id("a.txt", 3, "same text");
        let b = chunk_id("a.txt", 3, "same text");
        assert_eq!(a, b);
        assert!(a.starts_with("a.txt-chunk-3-"));
        assert_eq!(a.len(), "a.txt-chunk-3-".len() + ID_HASH_LEN);
    }

    #[test]
    fn test_chunk_id_changes_with_any_input() {
        let base = chunk_id("a.txt", 3, "same text");
        assert_ne!(base, chunk_id("b.txt", 3, "same text"));
        assert_ne!(base, chunk_id("a.txt", 4, "same text"));
        assert_ne!(base, chunk_id("a.txt", 3, "other text"));
    }

    #[test]
    fn test_deterministic() {
        let text = words(300);
        let splitter = RecursiveSplitter::new(80, 10);
        let c1: Vec<_> = splitter.chunk_document("doc1", &text).collect();
        let c2: Vec<_> = splitter.chunk_document("doc1", &text).collect();
        assert_eq!(c1, c2);
    }
}
