//! Line-window chunker.
//!
//! Splits file content into overlapping windows of whole lines. Windows
//! advance by `max_lines - overlap` lines and the last window always ends
//! on the final line, so every line is covered at least once.
//!
//! Chunk ids are derived from the file path and line span, and content
//! hashes are a SHA-256 of the window text. Both are pure functions of
//! the input, which lets the indexer and embedding queue detect unchanged
//! chunks by comparison alone.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

pub const DEFAULT_MAX_LINES: usize = 200;
pub const DEFAULT_OVERLAP: usize = 20;

/// Split `content` into line windows for `file_path`.
///
/// Returns no chunks for empty content. `max_lines == 0` is treated as 1.
pub fn chunk_file(file_path: &str, content: &str, max_lines: usize, overlap: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if total == 0 {
        return Vec::new();
    }

    let max_lines = max_lines.max(1);
    let step = max_lines.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 1usize;
    loop {
        let end = (start + max_lines - 1).min(total);
        chunks.push(make_chunk(file_path, start, end, &lines[start - 1..end]));
        if end == total {
            break;
        }
        start += step;
    }
    chunks
}

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize) -> String {
    format!("{}:{}-{}", file_path, start_line, end_line)
}

fn make_chunk(file_path: &str, start: usize, end: usize, lines: &[&str]) -> Chunk {
    let content = lines.join("\n");
    Chunk {
        file_path: file_path.to_string(),
        chunk_id: chunk_id(file_path, start, end),
        start_line: start,
        end_line: end,
        content_hash: hash_text(&content),
        content,
    }
}
