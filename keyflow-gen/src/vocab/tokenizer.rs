//! Word-level tokenizer
//!
//! Reads the `model.vocab` table of a word-level tokenizer JSON file:
//!
//! ```json
//! { "model": { "type": "WordLevel", "vocab": { "<pad>": 0, "<start>": 1, "<end>": 2, "t1": 3 } } }
//! ```
//!
//! Text is a space-separated sequence of token strings.

use crate::error::{Error, Result};
use crate::types::TokenId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Deserialize)]
struct TokenizerFile {
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct TokenizerModel {
    vocab: HashMap<String, TokenId>,
}

/// Bidirectional token string ↔ id mapping
#[derive(Debug, Clone, Default)]
pub struct WordLevelTokenizer {
    encoder: HashMap<String, TokenId>,
    decoder: HashMap<TokenId, String>,
}

impl WordLevelTokenizer {
    /// Create an empty (unloaded) tokenizer
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vocab(vocab: HashMap<String, TokenId>) -> Self {
        let decoder = vocab.iter().map(|(k, &v)| (v, k.clone())).collect();
        Self {
            encoder: vocab,
            decoder,
        }
    }

    /// Parse a tokenizer JSON document
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_slice(data)?;
        if file.model.vocab.is_empty() {
            return Err(Error::Tokenizer("vocabulary is empty".to_string()));
        }
        Ok(Self::from_vocab(file.model.vocab))
    }

    /// Load a tokenizer JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            Error::Tokenizer(format!("Failed to read tokenizer {}: {}", path.display(), e))
        })?;
        let tokenizer = Self::from_json(&data)?;
        debug!(
            "Loaded tokenizer {} ({} tokens)",
            path.display(),
            tokenizer.encoder.len()
        );
        Ok(tokenizer)
    }

    pub fn is_loaded(&self) -> bool {
        !self.encoder.is_empty()
    }

    /// One past the largest id
    pub fn vocab_size(&self) -> usize {
        self.decoder
            .keys()
            .max()
            .map(|&id| id as usize + 1)
            .unwrap_or(0)
    }

    /// Split text into token strings
    pub fn tokenize<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.split_whitespace().collect()
    }

    /// Encode text to ids; unknown words are errors
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if !self.is_loaded() {
            return Err(Error::NotLoaded("tokenizer is not loaded"));
        }
        self.tokenize(text)
            .into_iter()
            .map(|word| {
                self.encoder
                    .get(word)
                    .copied()
                    .ok_or_else(|| Error::Tokenizer(format!("unknown token '{}'", word)))
            })
            .collect()
    }

    /// Token string for one id
    pub fn decode(&self, id: TokenId) -> Result<&str> {
        if !self.is_loaded() {
            return Err(Error::NotLoaded("tokenizer is not loaded"));
        }
        self.decoder
            .get(&id)
            .map(String::as_str)
            .ok_or_else(|| Error::Tokenizer(format!("unknown token id {}", id)))
    }

    /// Space-joined token strings for a sequence of ids
    pub fn decode_all(&self, ids: &[TokenId]) -> Result<String> {
        let words = ids
            .iter()
            .map(|&id| self.decode(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(words.join(" "))
    }
}
