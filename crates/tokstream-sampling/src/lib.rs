//! # tokstream-sampling
//!
//! Token selection for tokstream.
//!
//! Backends hand over distributions that are already temperature-scaled and
//! normalized, so the policy here is a thin selection step:
//! - Greedy (argmax, ties to the lowest id) when temperature is zero
//! - Categorical draw otherwise, optionally restricted to the top-p nucleus
//! - Deterministic seeded RNG for reproducible generation
//!
//! [`rank`] turns a full distribution into the sorted candidate list handed to
//! callers that pick tokens themselves.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use tokstream_vocab::{Token, TokenId, Vocabulary, PAD_ID};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("empty distribution")]
    EmptyDistribution,
    #[error("distribution has no usable probability mass")]
    InvalidDistribution,
    #[error("temperature must be finite and >= 0 (got {0})")]
    InvalidTemperature(f32),
    #[error("top-p must be in (0, 1] (got {0})")]
    InvalidTopP(f32),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Source of uniform floats in `[0, 1)`.
pub trait RandomSource {
    fn next_f32(&mut self) -> f32;
}

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Seed from the wall clock, for runs that did not ask for reproducibility.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        Self::new(nanos)
    }
}

impl RandomSource for SeededRng {
    fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Selection strategy for one decode step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    /// 0.0 selects greedily; anything above draws from the distribution.
    pub temperature: f32,

    /// Nucleus cutoff. 1.0 disables it.
    pub top_p: f32,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

impl SamplingPolicy {
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }

    /// Argmax selection.
    pub fn greedy() -> Self {
        Self::new(0.0)
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature(self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidTopP(self.top_p));
        }
        Ok(())
    }

    /// Pick one token id from `distribution`.
    pub fn select<R: RandomSource + ?Sized>(
        &self,
        distribution: &[f32],
        rng: &mut R,
    ) -> SamplingResult<TokenId> {
        self.validate()?;
        if distribution.is_empty() {
            return Err(SamplingError::EmptyDistribution);
        }
        if distribution.iter().any(|p| p.is_nan()) {
            return Err(SamplingError::InvalidDistribution);
        }

        if self.temperature == 0.0 {
            return argmax(distribution)
                .map(|i| i as TokenId)
                .ok_or(SamplingError::InvalidDistribution);
        }

        if distribution.iter().any(|&p| p < 0.0 || p.is_infinite()) {
            return Err(SamplingError::InvalidDistribution);
        }

        if self.top_p < 1.0 {
            let nucleus = nucleus(distribution, self.top_p);
            draw(nucleus.iter().copied(), rng)
        } else {
            draw(distribution.iter().copied().enumerate(), rng)
        }
    }
}

/// Index of the strictly highest score; the first occurrence wins ties.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

/// Descending by score, ascending by id on ties.
fn by_score_then_id(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Smallest high-probability prefix whose mass reaches `p` of the total.
fn nucleus(probs: &[f32], p: f32) -> Vec<(usize, f32)> {
    let total: f32 = probs.iter().sum();
    let mut indexed: Vec<(usize, f32)> = probs
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, pr)| pr > 0.0)
        .collect();
    indexed.sort_by(by_score_then_id);

    let cutoff = p * total;
    let mut cumsum = 0.0;
    let mut keep = indexed.len();
    for (n, &(_, prob)) in indexed.iter().enumerate() {
        cumsum += prob;
        if cumsum >= cutoff {
            keep = n + 1;
            break;
        }
    }
    indexed.truncate(keep);
    indexed
}

/// Categorical draw over `(id, weight)` candidates. The uniform sample is
/// scaled by the total weight, so inputs need not sum to exactly one.
fn draw<I, R>(candidates: I, rng: &mut R) -> SamplingResult<TokenId>
where
    I: Iterator<Item = (usize, f32)> + Clone,
    R: RandomSource + ?Sized,
{
    let total: f32 = candidates.clone().map(|(_, p)| p).sum();
    if !(total > 0.0) || !total.is_finite() {
        return Err(SamplingError::InvalidDistribution);
    }

    let r = rng.next_f32() * total;
    let mut cumsum = 0.0;
    let mut last_nonzero = None;
    for (i, prob) in candidates {
        if prob <= 0.0 {
            continue;
        }
        cumsum += prob;
        last_nonzero = Some(i);
        if r < cumsum {
            return Ok(i as TokenId);
        }
    }

    // Rounding can leave r just above the final cumulative sum.
    last_nonzero
        .map(|i| i as TokenId)
        .ok_or(SamplingError::InvalidDistribution)
}

/// Every candidate except padding, most probable first, ties by ascending id.
///
/// Ids missing from `vocab` are skipped, so a distribution longer than the
/// vocabulary cannot produce tokens without text.
pub fn rank(distribution: &[f32], vocab: &Vocabulary) -> Vec<Token> {
    let mut indexed: Vec<(usize, f32)> = distribution
        .iter()
        .copied()
        .enumerate()
        .filter(|&(i, _)| i as TokenId != PAD_ID && i < vocab.len())
        .collect();
    indexed.sort_by(by_score_then_id);

    indexed
        .into_iter()
        .filter_map(|(i, probability)| {
            vocab
                .id_to_text(i as TokenId)
                .ok()
                .map(|text| Token::new(i as TokenId, text, probability))
        })
        .collect()
}
