//! Overlapping fixed-size text chunker.
//!
//! Splits extracted segments into windows of at most `chunk_size`
//! characters, each sharing `chunk_overlap` characters with its
//! predecessor. A window that would end mid-word is pulled back to the last
//! whitespace inside it, as long as that still moves the next window
//! forward. Every chunk keeps its segment's source and page and records its
//! starting character offset within that segment.
//!
//! Empty or whitespace-only input produces no chunks; a scanned page with
//! no text layer is a normal outcome, not an error.

use sha2::{Digest, Sha256};

use crate::models::{Position, Segment};

/// Chunk every segment in order. Output order follows input order.
pub fn chunk_segments(segments: &[Segment], chunk_size: usize, chunk_overlap: usize) -> Vec<Segment> {
    let mut chunks = Vec::new();

    for segment in segments {
        for (offset, text) in split_text(&segment.text, chunk_size, chunk_overlap) {
            chunks.push(Segment {
                text,
                source_id: segment.source_id.clone(),
                position: Position {
                    page: segment.position.page,
                    start_offset: Some(segment.position.start_offset.unwrap_or(0) + offset),
                },
            });
        }
    }

    chunks
}

/// Split `text` into `(char_offset, chunk_text)` windows.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<(usize, String)> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let overlap = chunk_overlap.min(chunk_size - 1);
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    let mut out = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = (start + chunk_size).min(len);

        if end < len {
            // Only break after `start + overlap` so the next window advances.
            let floor = start + overlap + 1;
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws + 1;
            }
        }

        let window = &chars[start..end];
        let lead = window.iter().take_while(|c| c.is_whitespace()).count();
        let trail = window[lead..]
            .iter()
            .rev()
            .take_while(|c| c.is_whitespace())
            .count();
        if lead < window.len() {
            let piece: String = window[lead..window.len() - trail].iter().collect();
            out.push((start + lead, piece));
        }

        if end == len {
            break;
        }
        start = end - overlap;
    }

    out
}

/// SHA-256 hex digest of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
