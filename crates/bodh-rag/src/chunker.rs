//! Token-window chunker: slide a window of `max_token_size` tokens with
//! stride `max - overlap` over the token stream, decoding each window back
//! to trimmed text. Deterministic for identical inputs.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tokenize::Tokenizer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPiece {
    /// Real token count of the window (the last window may be shorter).
    pub tokens: usize,
    pub content: String,
    pub chunk_order_index: usize,
}

pub fn chunk_by_token_size(
    tokenizer: &dyn Tokenizer,
    content: &str,
    overlap_token_size: usize,
    max_token_size: usize,
) -> Result<Vec<ChunkPiece>> {
    let tokens = tokenizer.encode(content);
    let stride = max_token_size.saturating_sub(overlap_token_size).max(1);

    let mut results = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    while start < tokens.len() {
        let end = (start + max_token_size).min(tokens.len());
        let window = &tokens[start..end];
        let text = tokenizer.decode(window)?;
        results.push(ChunkPiece {
            tokens: window.len(),
            content: text.trim().to_string(),
            chunk_order_index: index,
        });
        index += 1;
        start += stride;
    }
    Ok(results)
}
