//! Vocabulary: token strings, their ids, and their musical meaning

pub mod config;
pub mod decoder;
pub mod tokenizer;

pub use config::VocabConfig;
pub use decoder::VocabDecoder;
pub use tokenizer::WordLevelTokenizer;
