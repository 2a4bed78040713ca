use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::section::{Section, SectionKind};

static CHUNK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A bounded span of one section, the unit of retrieval and citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Chunk {
    /// `{doc_id}_{SECTION}_{sequence}_{suffix}`.
    pub id: String,
    pub text: String,
    pub section: SectionKind,
    pub doc_id: u64,
    /// Position among chunks of the same section kind in this document.
    pub sequence: usize,
    /// Byte offset of `text` inside the note.
    pub start: usize,
    /// Byte offset one past the end of `text` inside the note.
    pub end: usize,
}

/// Cut every section into chunks of at most `max_chars` characters.
///
/// Chunks never cross a section boundary. Within a section the cut prefers a paragraph
/// break, then a sentence end, then a line break, then any whitespace, and only then a
/// hard cut. A break is only taken if it keeps at least a quarter of the window, so no
/// slivers are produced. Pieces are trimmed and whitespace-only pieces are dropped.
pub fn chunk_sections(sections: &[Section], doc_id: u64, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut sequences: HashMap<SectionKind, usize> = HashMap::new();
    let mut chunks = Vec::new();

    for section in sections {
        for (offset, piece) in split_bounded(&section.text, max_chars) {
            let sequence = sequences.entry(section.kind).or_insert(0);
            let start = section.start + offset;
            chunks.push(Chunk {
                id: new_chunk_id(doc_id, section.kind, *sequence),
                text: piece.to_string(),
                section: section.kind,
                doc_id,
                sequence: *sequence,
                start,
                end: start + piece.len(),
            });
            *sequence += 1;
        }
    }
    chunks
}

/// Trimmed, non-empty pieces of `text` with their byte offsets.
fn split_bounded(text: &str, max_chars: usize) -> Vec<(usize, &str)> {
    let mut pieces = Vec::new();
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        let cut = match rest.char_indices().nth(max_chars) {
            None => rest.len(),
            Some((window_end, _)) => preferred_cut(&rest[..window_end], max_chars),
        };
        let raw = &rest[..cut];
        let leading = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            pieces.push((pos + leading, trimmed));
        }
        pos += cut;
    }
    pieces
}

/// Byte length of the next piece taken from `window` (which holds exactly `max_chars`
/// characters and is followed by more text).
fn preferred_cut(window: &str, max_chars: usize) -> usize {
    let min_chars = (max_chars / 4).max(1);
    let min_cut = window
        .char_indices()
        .nth(min_chars)
        .map_or(window.len(), |(i, _)| i);
    let acceptable = |cut: usize| cut >= min_cut && cut > 0;

    if let Some(i) = window.rfind("\n\n").map(|i| i + 2).filter(|c| acceptable(*c)) {
        return i;
    }
    if let Some(i) = last_sentence_end(window).filter(|c| acceptable(*c)) {
        return i;
    }
    if let Some(i) = window.rfind('\n').map(|i| i + 1).filter(|c| acceptable(*c)) {
        return i;
    }
    if let Some(i) = window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .filter(|c| acceptable(*c))
    {
        return i;
    }
    window.len()
}

/// Offset just past the last `.`, `!` or `?` that is followed by whitespace.
fn last_sentence_end(window: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = window.char_indices().collect();
    chars.windows(2).rev().find_map(|pair| {
        let (i, c) = pair[0];
        let (_, next) = pair[1];
        (matches!(c, '.' | '!' | '?') && next.is_whitespace()).then_some(i + c.len_utf8())
    })
}

fn new_chunk_id(doc_id: u64, section: SectionKind, sequence: usize) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = CHUNK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let digest = Sha256::digest(
        format!("{nanos}:{pid}:{counter}:{doc_id}:{}:{sequence}", section.code()).as_bytes(),
    );
    let suffix = hex_lower(&digest[..4]);
    format!("{doc_id}_{}_{sequence}_{suffix}", section.code())
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
