//! Reader and writer for the llama2.c `tokenizer.bin` layout.
//!
//! Little-endian throughout:
//!
//! ```text
//! u32 max_token_length
//! repeated until EOF:
//!     f32 score
//!     u32 len
//!     [u8; len] piece (UTF-8)
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{BpeTokenizer, VocabError, VocabResult, Vocabulary};

/// Parsed contents of a `tokenizer.bin` file.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerFile {
    pub max_token_length: u32,
    pub entries: Vec<String>,
    pub scores: Vec<f32>,
}

impl TokenizerFile {
    pub fn from_bytes(bytes: &[u8]) -> VocabResult<Self> {
        Self::read(bytes)
    }

    pub fn read<R: Read>(mut reader: R) -> VocabResult<Self> {
        let max_token_length = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated(e, "header"))?;

        let mut entries = Vec::new();
        let mut scores = Vec::new();

        loop {
            let score = match reader.read_f32::<LittleEndian>() {
                Ok(score) => score,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let len = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated(e, "piece length"))?;
            if len > max_token_length.max(1).saturating_mul(4) {
                return Err(VocabError::Malformed(format!(
                    "piece {} is {len} bytes, max token length is {max_token_length}",
                    entries.len()
                )));
            }

            // Bounded by the bytes actually present, whatever the header claims.
            let mut bytes = Vec::new();
            reader.by_ref().take(u64::from(len)).read_to_end(&mut bytes)?;
            if bytes.len() != len as usize {
                return Err(VocabError::Malformed("truncated piece bytes".into()));
            }
            let piece = String::from_utf8(bytes).map_err(|_| {
                VocabError::Malformed(format!("piece {} is not valid UTF-8", entries.len()))
            })?;

            scores.push(score);
            entries.push(piece);
        }

        if entries.is_empty() {
            return Err(VocabError::Malformed("tokenizer has no entries".into()));
        }

        Ok(Self {
            max_token_length,
            entries,
            scores,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.max_token_length)?;
        for (piece, &score) in self.entries.iter().zip(&self.scores) {
            writer.write_f32::<LittleEndian>(score)?;
            writer.write_u32::<LittleEndian>(piece.len() as u32)?;
            writer.write_all(piece.as_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut out);
        out
    }

    pub fn into_tokenizer(self) -> VocabResult<BpeTokenizer> {
        BpeTokenizer::new(Vocabulary::new(self.entries), self.scores)
    }
}

fn truncated(err: io::Error, what: &str) -> VocabError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        VocabError::Malformed(format!("truncated {what}"))
    } else {
        VocabError::Io(err)
    }
}
