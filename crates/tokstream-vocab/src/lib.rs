//! # tokstream-vocab
//!
//! Vocabulary handling for tokstream.
//!
//! This crate provides:
//! - [`Vocabulary`], the immutable id ↔ text table shared by every session
//! - [`BpeTokenizer`] for turning prompts into token ids
//! - [`PieceDecoder`] for turning sampled ids back into displayable text
//! - [`TokenizerFile`], a reader for the llama2.c `tokenizer.bin` layout

pub mod bpe;
pub mod piece;
pub mod tokenizer_bin;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use bpe::BpeTokenizer;
pub use piece::PieceDecoder;
pub use tokenizer_bin::TokenizerFile;

/// Token id type. Ids index directly into the [`Vocabulary`].
pub type TokenId = u32;

/// Padding / unknown token.
pub const PAD_ID: TokenId = 0;

/// Beginning-of-sequence sentinel.
pub const BOS_ID: TokenId = 1;

/// End-of-sequence sentinel.
pub const EOS_ID: TokenId = 2;

/// Display text of the synthetic BOS entry placed at the head of every history.
pub const BOS_TEXT: &str = "<s>";

/// Whether `id` is one of the BOS/EOS sentinels.
pub fn is_boundary(id: TokenId) -> bool {
    id == BOS_ID || id == EOS_ID
}

/// Error type for vocabulary operations.
#[derive(Debug, thiserror::Error)]
pub enum VocabError {
    #[error("model backend is not ready")]
    BackendUnavailable,
    #[error("token id {id} out of range (vocabulary size {size})")]
    OutOfRange { id: TokenId, size: usize },
    #[error("unknown token: {0:?}")]
    UnknownToken(String),
    #[error("malformed tokenizer data: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VocabResult<T> = std::result::Result<T, VocabError>;

/// One generated (or forced) unit of text with its selection probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub text: String,
    pub probability: f32,
}

impl Token {
    pub fn new(id: TokenId, text: impl Into<String>, probability: f32) -> Self {
        Self {
            id,
            text: text.into(),
            probability,
        }
    }

    /// The synthetic BOS entry that starts every run's history.
    pub fn bos() -> Self {
        Self::new(BOS_ID, BOS_TEXT, 1.0)
    }

    pub fn is_boundary(&self) -> bool {
        is_boundary(self.id)
    }
}

/// Anything that can enumerate vocabulary entries by id.
///
/// Model backends implement this so the table can be read once after
/// initialization without this crate knowing about backends.
pub trait VocabularySource {
    /// Whether the source has finished initializing.
    fn is_ready(&self) -> bool;

    /// Number of entries.
    fn vocab_size(&self) -> usize;

    /// Text for `id`, `None` when out of range.
    fn vocab_entry(&self, id: TokenId) -> Option<String>;
}

/// Immutable mapping between token ids and their display strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    entries: Vec<String>,
    index: HashMap<String, TokenId>,
}

impl Vocabulary {
    /// Build a table from entries ordered by id.
    ///
    /// When the same text appears under several ids, reverse lookup resolves
    /// to the lowest one.
    pub fn new(entries: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (id, text) in entries.iter().enumerate() {
            index.entry(text.clone()).or_insert(id as TokenId);
        }
        Self { entries, index }
    }

    /// Read every entry from `source`.
    pub fn load<S: VocabularySource + ?Sized>(source: &S) -> VocabResult<Self> {
        if !source.is_ready() {
            return Err(VocabError::BackendUnavailable);
        }

        let size = source.vocab_size();
        let mut entries = Vec::with_capacity(size);
        for id in 0..size as TokenId {
            let text = source
                .vocab_entry(id)
                .ok_or(VocabError::OutOfRange { id, size })?;
            entries.push(text);
        }
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: TokenId) -> bool {
        (id as usize) < self.entries.len()
    }

    pub fn id_to_text(&self, id: TokenId) -> VocabResult<&str> {
        self.entries
            .get(id as usize)
            .map(String::as_str)
            .ok_or(VocabError::OutOfRange {
                id,
                size: self.entries.len(),
            })
    }

    /// Exact-match reverse lookup.
    pub fn text_to_id(&self, text: &str) -> VocabResult<TokenId> {
        self.index
            .get(text)
            .copied()
            .ok_or_else(|| VocabError::UnknownToken(text.to_string()))
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// `(id, text)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (TokenId, &str)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, text)| (id as TokenId, text.as_str()))
    }
}

impl VocabularySource for Vocabulary {
    fn is_ready(&self) -> bool {
        true
    }

    fn vocab_size(&self) -> usize {
        self.len()
    }

    fn vocab_entry(&self, id: TokenId) -> Option<String> {
        self.entries.get(id as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vocabulary {
        Vocabulary::new(
            ["<pad>", "<s>", "</s>", "a", "b"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    struct Unready;

    impl VocabularySource for Unready {
        fn is_ready(&self) -> bool {
            false
        }
        fn vocab_size(&self) -> usize {
            3
        }
        fn vocab_entry(&self, _id: TokenId) -> Option<String> {
            Some(String::new())
        }
    }

    #[test]
    fn id_to_text_in_range() {
        let vocab = table();
        assert_eq!(vocab.id_to_text(3).unwrap(), "a");
        assert_eq!(vocab.id_to_text(BOS_ID).unwrap(), "<s>");
    }

    #[test]
    fn id_to_text_out_of_range() {
        let vocab = table();
        assert!(matches!(
            vocab.id_to_text(5),
            Err(VocabError::OutOfRange { id: 5, size: 5 })
        ));
    }

    #[test]
    fn text_to_id_exact_match_only() {
        let vocab = table();
        assert_eq!(vocab.text_to_id("b").unwrap(), 4);
        assert!(matches!(
            vocab.text_to_id("B"),
            Err(VocabError::UnknownToken(t)) if t == "B"
        ));
    }

    #[test]
    fn duplicate_entries_resolve_to_lowest_id() {
        let vocab = Vocabulary::new(vec!["x".into(), "y".into(), "x".into()]);
        assert_eq!(vocab.text_to_id("x").unwrap(), 0);
    }

    #[test]
    fn load_requires_ready_source() {
        assert!(matches!(
            Vocabulary::load(&Unready),
            Err(VocabError::BackendUnavailable)
        ));
    }

    #[test]
    fn load_copies_all_entries() {
        let source = table();
        let loaded = Vocabulary::load(&source).unwrap();
        assert_eq!(loaded, source);
    }

    #[test]
    fn boundary_ids() {
        assert!(is_boundary(BOS_ID));
        assert!(is_boundary(EOS_ID));
        assert!(!is_boundary(PAD_ID));
        assert!(Token::bos().is_boundary());
    }
}
