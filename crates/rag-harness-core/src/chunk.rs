//! Boundary-aware overlapping text chunker.
//!
//! Splits normalized document text into spans of at most `size` units,
//! where consecutive spans share an `overlap` window. Spans are exact
//! slices of the input, so the source text can always be rebuilt from
//! them.
//!
//! # Algorithm
//!
//! 1. Convert `size`, `overlap` and the boundary window to characters
//!    (tokens are approximated at 4 characters each).
//! 2. From `start`, the hard limit is `start + size` (or the end of text).
//! 3. Inside the trailing window before the hard limit, break after the
//!    last paragraph break (`\n\n`); failing that, after the last sentence
//!    end (`.`, `!` or `?` followed by whitespace, or a line break).
//! 4. With no boundary in the window, break at the hard limit.
//! 5. The next span starts `overlap` characters before the previous end.
//!
//! Empty text produces no spans. Text shorter than `size` produces one.
//!
//! # Example
//!
//! ```rust
//! use rag_harness_core::chunk::{chunk_text, ChunkParams};
//!
//! let spans = chunk_text("First sentence. Second sentence.", &ChunkParams::new(20, 5));
//! assert_eq!(spans[0].text, "First sentence. ");
//! assert_eq!(spans[1].start, spans[0].end - 5);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Anchor, Chunk};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Namespace for deterministic chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6c1d_9a3e_54f2_4b8a_9e07_d2c4_1f38_b5a6);

/// Unit that chunk size and overlap are measured in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Chars,
    Tokens,
}

impl ChunkUnit {
    fn to_chars(self, n: usize) -> usize {
        match self {
            ChunkUnit::Chars => n,
            ChunkUnit::Tokens => n * CHARS_PER_TOKEN,
        }
    }
}

/// Chunking parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    /// Target (maximum) span length.
    pub size: usize,
    /// Units shared between consecutive spans.
    pub overlap: usize,
    pub unit: ChunkUnit,
    /// Length of the trailing window searched for a natural break.
    /// Defaults to a fifth of `size`.
    pub boundary_window: Option<usize>,
}

impl ChunkParams {
    pub fn new(size: usize, overlap: usize) -> Self {
        ChunkParams {
            size,
            overlap,
            unit: ChunkUnit::Chars,
            boundary_window: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(RagError::invalid("chunk size must be > 0"));
        }
        if self.overlap >= self.size {
            return Err(RagError::invalid(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap, self.size
            )));
        }
        Ok(())
    }

    /// `(size, overlap, window)` in characters, clamped so that every
    /// span advances.
    fn char_limits(&self) -> (usize, usize, usize) {
        let size = self.unit.to_chars(self.size).max(1);
        let overlap = self.unit.to_chars(self.overlap).min(size - 1);
        let window = self
            .boundary_window
            .map(|w| self.unit.to_chars(w))
            .unwrap_or(size / 5)
            .min(size);
        (size, overlap, window)
    }
}

/// One chunk-sized slice of the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub index: usize,
    /// Character offset (inclusive).
    pub start: usize,
    /// Character offset (exclusive).
    pub end: usize,
    pub text: String,
}

/// Split `text` into overlapping spans.
///
/// # Guarantees
///
/// - Indices are contiguous: `0, 1, …, N-1`.
/// - Every span after the first starts exactly `overlap` characters before
///   the previous span's end.
/// - The spans cover the input with no gaps.
/// - Output depends only on `text` and `params`.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<TextSpan> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    if n == 0 {
        return Vec::new();
    }

    let (size, overlap, window) = params.char_limits();

    // Byte position of every char index, plus one past the end.
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + size).min(n);
        let end = if hard_end == n {
            n
        } else {
            let lowest = hard_end.saturating_sub(window).max(start + overlap + 1);
            find_break(&chars, lowest, hard_end).unwrap_or(hard_end)
        };

        spans.push(TextSpan {
            index: spans.len(),
            start,
            end,
            text: text[byte_at[start]..byte_at[end]].to_string(),
        });

        if end == n {
            break;
        }
        start = end - overlap;
    }

    spans
}

/// Last break position in `[lo, hi]`, preferring paragraph breaks over
/// sentence ends. A position `e` means "break between `e-1` and `e`".
fn find_break(chars: &[char], lo: usize, hi: usize) -> Option<usize> {
    if lo > hi {
        return None;
    }
    let lo = lo.max(2);

    let paragraph = (lo..=hi)
        .rev()
        .find(|&e| chars[e - 1] == '\n' && chars[e - 2] == '\n');
    if paragraph.is_some() {
        return paragraph;
    }

    (lo..=hi).rev().find(|&e| {
        let last = chars[e - 1];
        last == '\n' || (last.is_whitespace() && matches!(chars[e - 2], '.' | '!' | '?'))
    })
}

/// Rebuild the source text from spans by dropping each span's overlap
/// with its predecessor.
pub fn reassemble(spans: &[TextSpan]) -> String {
    let mut out = String::new();
    let mut prev_end = 0usize;
    for span in spans {
        let skip = prev_end.saturating_sub(span.start);
        out.extend(span.text.chars().skip(skip));
        prev_end = span.end;
    }
    out
}

/// Anchor in effect at `offset`: the last one starting at or before it.
pub fn anchor_at(anchors: &[Anchor], offset: usize) -> Option<&Anchor> {
    let idx = anchors.partition_point(|a| a.offset <= offset);
    if idx == 0 {
        None
    } else {
        anchors.get(idx - 1)
    }
}

/// Build a [`Chunk`] for `span` with a deterministic id and content hash.
///
/// The id is derived from the document id and span index, so re-ingesting
/// a document replaces its chunks instead of duplicating them.
pub fn make_chunk(
    document_id: &str,
    span: &TextSpan,
    metadata: serde_json::Value,
    embedding: Vec<f32>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(span.text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{}:{}", document_id, span.index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: span.index as i64,
        text: span.text.clone(),
        start_offset: span.start as i64,
        end_offset: span.end as i64,
        metadata,
        hash,
        embedding,
        created_at: chrono::Utc::now().timestamp_millis(),
    }
}
