//! Tokenizer collaborator. The chunker and the token-budget truncation both
//! count real model tokens; the default implementation wraps the cl100k BPE.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::{RagError, Result};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// BPE tokenizer selected by model name. Model names containing "gpt-4o"
/// map to the o200k vocabulary, everything else to cl100k.
pub struct BpeTokenizer {
    bpe: &'static CoreBPE,
}

impl BpeTokenizer {
    pub fn for_model(model_name: &str) -> Result<Self> {
        let bpe = if model_name.contains("gpt-4o") {
            static O200K: OnceLock<CoreBPE> = OnceLock::new();
            match o200k_base() {
                Ok(b) => O200K.get_or_init(|| b),
                Err(e) => return Err(RagError::storage_fatal(format!("tokenizer init: {e}"))),
            }
        } else {
            static CL100K: OnceLock<CoreBPE> = OnceLock::new();
            match cl100k_base() {
                Ok(b) => CL100K.get_or_init(|| b),
                Err(e) => return Err(RagError::storage_fatal(format!("tokenizer init: {e}"))),
            }
        };
        Ok(Self { bpe })
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| RagError::Parse(format!("token decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let tok = BpeTokenizer::for_model("gpt-4o-mini").unwrap();
        let text = "The quick brown fox jumps over the lazy dog.";
        let tokens = tok.encode(text);
        assert!(!tokens.is_empty());
        assert_eq!(tok.decode(&tokens).unwrap(), text);
    }

    #[test]
    fn test_count_tokens_matches_encode() {
        let tok = BpeTokenizer::for_model("default").unwrap();
        assert_eq!(tok.count_tokens("hello world"), tok.encode("hello world").len());
    }
}
