//! Streaming piece decoding.
//!
//! Turns one token id at a time into printable text. Byte pieces (`<0xAB>`)
//! are buffered until they form complete UTF-8, so the text of a token that
//! carries only part of a multi-byte character is empty and the full
//! character appears with the token that completes it.

use crate::bpe::parse_byte_piece;
use crate::{TokenId, VocabResult, Vocabulary, BOS_ID};

/// Longest UTF-8 sequence; anything still pending beyond this is garbage.
const MAX_UTF8_LEN: usize = 4;

/// Per-run decoding state.
#[derive(Debug, Clone, Default)]
pub struct PieceDecoder {
    previous: Option<TokenId>,
    pending_utf8: Vec<u8>,
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over, remembering the id that precedes the next decoded token.
    pub fn reset(&mut self, previous: Option<TokenId>) {
        self.previous = previous;
        self.pending_utf8.clear();
    }

    /// Whether part of a multi-byte character is still buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending_utf8.is_empty()
    }

    /// Decode `id` to the text it contributes.
    pub fn decode(&mut self, vocab: &Vocabulary, id: TokenId) -> VocabResult<String> {
        let piece = vocab.id_to_text(id)?;
        let piece = if self.previous == Some(BOS_ID) {
            piece.strip_prefix(' ').unwrap_or(piece)
        } else {
            piece
        };
        self.previous = Some(id);

        match parse_byte_piece(piece) {
            Some(byte) => {
                self.pending_utf8.push(byte);
                Ok(self.drain_pending(false))
            }
            None => {
                let mut out = self.drain_pending(true);
                out.push_str(piece);
                Ok(out)
            }
        }
    }

    /// Emit buffered bytes once they decode. With `force`, or once the buffer
    /// cannot be a valid prefix any more, emit them lossily.
    fn drain_pending(&mut self, force: bool) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }

        match std::str::from_utf8(&self.pending_utf8) {
            Ok(text) => {
                let text = text.to_string();
                self.pending_utf8.clear();
                text
            }
            Err(err)
                if !force
                    && err.error_len().is_none()
                    && self.pending_utf8.len() < MAX_UTF8_LEN =>
            {
                String::new()
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending_utf8).into_owned();
                self.pending_utf8.clear();
                text
            }
        }
    }
}
