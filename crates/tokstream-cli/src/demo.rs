//! Deterministic demo backend.
//!
//! Stands in for a real model so the CLI can be driven end to end. Scores are
//! pseudo-random but a pure function of the model card's seed and the last
//! two context tokens, so the same prompt always continues the same way.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use tokstream_backend::{
    BackendFailure, ModelBackend, ModelSource, Result, StepOutput, StepParams, TokenId,
    VocabularySource,
};
use tokstream_vocab::bpe::{byte_piece_text, BYTE_PIECE_OFFSET};
use tokstream_vocab::{
    BpeTokenizer, TokenizerFile, VocabResult, Vocabulary, BOS_ID, EOS_ID, PAD_ID,
};

/// Words the built-in vocabulary can produce as single tokens.
const BUILTIN_WORDS: &[&str] = &[
    " the", " a", " and", " was", " to", " she", " he", " it", " of", " in", " day", " one",
    " big", " little", " girl", " boy", " dog", " cat", " sun", " tree", " park", " play",
    " happy", " saw", " said", " went", " time", " upon", " there", " named", " Lily", " Tom",
    " friends", " together", "Once", "The", "They",
];

/// Single-character pieces beyond those the words already need.
const BUILTIN_CHARS: &[&str] = &[".", ",", "!", "?", "\n"];

/// Scores below this never win a greedy pick.
const MASKED: f32 = -1.0e9;

/// Model description read at initialization.
///
/// ```json
/// { "seed": 42, "seq_len": 256, "eos_bias": 0.05 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelCard {
    /// Seed mixed into every score.
    pub seed: u64,
    /// Context length used when the step budget is 0.
    pub seq_len: usize,
    /// Added to the EOS score per context position, so runs end eventually.
    pub eos_bias: f32,
}

impl Default for ModelCard {
    fn default() -> Self {
        Self {
            seed: 42,
            seq_len: 256,
            eos_bias: 0.05,
        }
    }
}

/// Non-reserved, non-byte pieces of the built-in vocabulary.
///
/// Every prefix of every word is included, so BPE merges can grow a word one
/// character at a time.
pub fn builtin_pieces() -> Vec<String> {
    let mut seen = HashSet::new();
    let mut pieces = Vec::new();
    let mut push = |piece: String| {
        if seen.insert(piece.clone()) {
            pieces.push(piece);
        }
    };

    for ch in BUILTIN_CHARS {
        push(ch.to_string());
    }
    for word in BUILTIN_WORDS {
        for ch in word.chars() {
            push(ch.to_string());
        }
    }
    for word in BUILTIN_WORDS {
        let ends = word.char_indices().map(|(i, _)| i).skip(2).chain([word.len()]);
        for end in ends {
            push(word[..end].to_string());
        }
    }
    pieces
}

/// Tokenizer over the reserved ids, every byte piece and
/// [`builtin_pieces`]. Longer pieces merge first.
pub fn builtin_tokenizer() -> VocabResult<BpeTokenizer> {
    let mut entries: Vec<String> = vec!["<unk>".into(), "<s>".into(), "</s>".into()];
    entries.extend((0..=255u8).map(byte_piece_text));
    let specials = entries.len();
    entries.extend(builtin_pieces());

    let scores = entries
        .iter()
        .enumerate()
        .map(|(id, piece)| {
            if id < specials {
                0.0
            } else {
                piece.chars().count() as f32
            }
        })
        .collect();
    BpeTokenizer::new(Vocabulary::new(entries), scores)
}

/// A backend that needs no weights.
#[derive(Debug)]
pub struct DemoBackend {
    card: ModelCard,
    tokenizer: BpeTokenizer,
}

impl DemoBackend {
    pub fn new(card: ModelCard, tokenizer: BpeTokenizer) -> Self {
        Self { card, tokenizer }
    }

    /// Load the model card and tokenizer. Missing sources fall back to the
    /// defaults; unreadable or malformed ones fail with
    /// [`BackendFailure::Init`].
    pub async fn initialize(
        model: Option<&ModelSource>,
        tokenizer: Option<&ModelSource>,
    ) -> Result<Self> {
        let card: ModelCard = match model {
            Some(source) => {
                let bytes = source.read().await?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| BackendFailure::Init(format!("model card: {e}")))?
            }
            None => ModelCard::default(),
        };

        let tokenizer = match tokenizer {
            Some(source) => {
                let bytes = source.read().await?;
                TokenizerFile::from_bytes(&bytes)
                    .and_then(TokenizerFile::into_tokenizer)
                    .map_err(|e| BackendFailure::Init(format!("tokenizer: {e}")))?
            }
            None => builtin_tokenizer()?,
        };

        tracing::info!(
            seed = card.seed,
            seq_len = card.seq_len,
            vocab_size = tokenizer.vocabulary().len(),
            "demo backend initialized"
        );
        Ok(Self::new(card, tokenizer))
    }

    pub fn card(&self) -> &ModelCard {
        &self.card
    }

    /// Raw scores for the token after `context`.
    fn logits(&self, context: &[TokenId]) -> Vec<f32> {
        let size = self.vocab_size();
        let tail = &context[context.len().saturating_sub(2)..];
        let mut rng = ScoreRng::new(mix(self.card.seed, tail));

        let mut logits: Vec<f32> = (0..size).map(|_| rng.next_score()).collect();
        for (id, logit) in logits.iter_mut().enumerate() {
            let id = id as TokenId;
            if id == PAD_ID || id == BOS_ID {
                *logit = MASKED;
            } else if (BYTE_PIECE_OFFSET..BYTE_PIECE_OFFSET + 256).contains(&id) {
                // Keep output readable.
                *logit -= 4.0;
            }
        }
        if let Some(eos) = logits.get_mut(EOS_ID as usize) {
            *eos += self.card.eos_bias * context.len() as f32 - 2.0;
        }
        logits
    }
}

impl VocabularySource for DemoBackend {
    fn is_ready(&self) -> bool {
        true
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocabulary().len()
    }

    fn vocab_entry(&self, id: TokenId) -> Option<String> {
        self.tokenizer
            .vocabulary()
            .id_to_text(id)
            .ok()
            .map(str::to_string)
    }
}

#[async_trait]
impl ModelBackend for DemoBackend {
    fn configure(&self, temperature: f32, max_steps: usize) -> StepParams {
        StepParams::resolve(temperature, max_steps, self.card.seq_len)
    }

    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(self.tokenizer.encode(text)?)
    }

    async fn step_distribution(
        &self,
        context: &[TokenId],
        params: &StepParams,
    ) -> Result<StepOutput> {
        let logits = self.logits(context);
        let distribution = if params.temperature == 0.0 {
            logits
        } else {
            softmax(&logits, params.temperature)
        };

        Ok(StepOutput {
            distribution,
            budget_exhausted: params.budget_exhausted(context.len()),
        })
    }
}

/// Temperature-scaled softmax.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// FNV-1a over the seed and context tail.
fn mix(seed: u64, tail: &[TokenId]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
    for &id in tail {
        for byte in id.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// xorshift64 producing scores in [-2, 2).
struct ScoreRng {
    state: u64,
}

impl ScoreRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_score(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        ((self.state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 4.0
    }
}
