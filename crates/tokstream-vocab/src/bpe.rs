//! Score-driven byte-pair encoding for prompts.
//!
//! Prompts are split into per-character pieces (falling back to raw byte
//! pieces `<0xXX>` for characters missing from the vocabulary), then adjacent
//! pairs are merged greedily, always taking the merge whose result has the
//! highest score, until no adjacent pair forms a known entry.

use crate::{TokenId, VocabError, VocabResult, Vocabulary};

/// Byte pieces `<0x00>..<0xFF>` start right after the three reserved ids.
pub const BYTE_PIECE_OFFSET: TokenId = 3;

/// Piece prepended to every non-empty prompt when the vocabulary has one.
const DUMMY_PREFIX: &str = " ";

/// Prompt tokenizer over a [`Vocabulary`] with per-entry merge scores.
#[derive(Debug, Clone)]
pub struct BpeTokenizer {
    vocab: Vocabulary,
    scores: Vec<f32>,
}

impl BpeTokenizer {
    /// Pair a vocabulary with merge scores (one per entry).
    pub fn new(vocab: Vocabulary, scores: Vec<f32>) -> VocabResult<Self> {
        if scores.len() != vocab.len() {
            return Err(VocabError::Malformed(format!(
                "{} scores for {} vocabulary entries",
                scores.len(),
                vocab.len()
            )));
        }
        Ok(Self { vocab, scores })
    }

    /// Tokenizer with uniform scores; merges then happen left to right.
    pub fn from_entries(entries: Vec<String>) -> Self {
        let scores = vec![0.0; entries.len()];
        Self {
            vocab: Vocabulary::new(entries),
            scores,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn into_vocabulary(self) -> Vocabulary {
        self.vocab
    }

    pub fn score(&self, id: TokenId) -> Option<f32> {
        self.scores.get(id as usize).copied()
    }

    /// Encode `text` without BOS/EOS; callers add sentinels themselves.
    pub fn encode(&self, text: &str) -> VocabResult<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if text.is_empty() {
            return Ok(tokens);
        }

        if let Ok(id) = self.vocab.text_to_id(DUMMY_PREFIX) {
            tokens.push(id);
        }

        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let piece = ch.encode_utf8(&mut buf);
            match self.vocab.text_to_id(piece) {
                Ok(id) => tokens.push(id),
                Err(_) => {
                    for &byte in piece.as_bytes() {
                        tokens.push(self.byte_piece(byte, ch)?);
                    }
                }
            }
        }

        while let Some((at, merged)) = self.best_merge(&tokens) {
            tokens[at] = merged;
            tokens.remove(at + 1);
        }

        Ok(tokens)
    }

    fn byte_piece(&self, byte: u8, ch: char) -> VocabResult<TokenId> {
        let id = byte as TokenId + BYTE_PIECE_OFFSET;
        match self.vocab.id_to_text(id) {
            Ok(text) if text == byte_piece_text(byte) => Ok(id),
            _ => Err(VocabError::UnknownToken(ch.to_string())),
        }
    }

    /// Position and id of the highest-scoring adjacent merge. Ties go to
    /// the leftmost pair.
    fn best_merge(&self, tokens: &[TokenId]) -> Option<(usize, TokenId)> {
        let mut best: Option<(f32, usize, TokenId)> = None;
        let mut joined = String::new();

        for (at, pair) in tokens.windows(2).enumerate() {
            joined.clear();
            joined.push_str(self.vocab.id_to_text(pair[0]).ok()?);
            joined.push_str(self.vocab.id_to_text(pair[1]).ok()?);

            if let Ok(id) = self.vocab.text_to_id(&joined) {
                let score = self.scores[id as usize];
                if best.map_or(true, |(s, _, _)| score > s) {
                    best = Some((score, at, id));
                }
            }
        }

        best.map(|(_, at, id)| (at, id))
    }
}

/// `<0xAB>` style text of a raw byte piece.
pub fn byte_piece_text(byte: u8) -> String {
    format!("<0x{byte:02X}>")
}

/// Parse a `<0xAB>` byte piece.
pub fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
