//! # tokstream-backend
//!
//! The "narrow waist" between tokstream and whatever actually runs the model.
//! Defines the [`ModelBackend`] trait the decode state machine talks to;
//! implementations can wrap a native engine, a foreign runtime or a test
//! script without changing anything above them.
//!
//! ## Design Notes
//!
//! ### Shared Backends
//! `ModelBackend` methods take `&self` (not `&mut self`) so one backend can be
//! shared by several sessions behind an `Arc`. Run parameters never live in
//! the backend: `configure` resolves them into a [`StepParams`] that the
//! caller keeps for its run and passes back with every step, so concurrent
//! runs cannot see each other's temperature or budget.
//!
//! ### Budget Signal
//! A backend reports step-budget exhaustion out of band, next to the
//! distribution that produced the final token, rather than by failing.

pub mod scripted;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

pub use scripted::ScriptedBackend;
pub use tokstream_vocab::{TokenId, VocabError, VocabularySource};

pub type Result<T> = std::result::Result<T, BackendFailure>;

/// Top-level error type for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendFailure {
    #[error("backend is not initialized")]
    Unavailable,
    #[error("backend initialization failed: {0}")]
    Init(String),
    #[error("backend step failed: {0}")]
    Step(String),
    #[error("prompt encoding failed: {0}")]
    Encode(#[from] VocabError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters of one run, resolved by [`ModelBackend::configure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub temperature: f32,
    /// Context positions available to the run, BOS and prompt included.
    /// Already resolved, so never 0.
    pub max_steps: usize,
}

impl StepParams {
    /// `max_steps == 0` selects `seq_len`.
    pub fn resolve(temperature: f32, max_steps: usize, seq_len: usize) -> Self {
        Self {
            temperature,
            max_steps: match max_steps {
                0 => seq_len.max(1),
                n => n,
            },
        }
    }

    /// Whether the token chosen after `context_len` positions is the run's
    /// last: it occupies position `context_len`.
    pub fn budget_exhausted(&self, context_len: usize) -> bool {
        context_len + 1 >= self.max_steps
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// One score per vocabulary id, already temperature-scaled and normalized.
    pub distribution: Vec<f32>,

    /// The configured step budget ends with the token chosen from this
    /// distribution.
    pub budget_exhausted: bool,
}

impl StepOutput {
    pub fn new(distribution: Vec<f32>) -> Self {
        Self {
            distribution,
            budget_exhausted: false,
        }
    }

    pub fn exhausted(distribution: Vec<f32>) -> Self {
        Self {
            distribution,
            budget_exhausted: true,
        }
    }
}

/// Where model weights or tokenizer data come from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Bytes compiled into (or otherwise already held by) the program.
    Embedded(Arc<[u8]>),
    /// A file on disk.
    Path(PathBuf),
}

impl ModelSource {
    pub fn embedded(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        ModelSource::Embedded(Arc::from(bytes))
    }

    pub fn path(path: impl AsRef<Path>) -> Self {
        ModelSource::Path(path.as_ref().to_path_buf())
    }

    /// Load the full contents.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            ModelSource::Embedded(bytes) => Ok(bytes.to_vec()),
            ModelSource::Path(path) => {
                tracing::debug!(path = %path.display(), "reading model source");
                Ok(tokio::fs::read(path).await?)
            }
        }
    }
}

/// The operations tokstream needs from a model.
///
/// Vocabulary enumeration comes from the [`VocabularySource`] supertrait.
#[async_trait]
pub trait ModelBackend: VocabularySource + Send + Sync {
    /// Resolve sampling temperature and step budget for a run. The result
    /// applies to every step the run passes it to. `max_steps == 0` selects
    /// the model's maximum.
    fn configure(&self, temperature: f32, max_steps: usize) -> StepParams;

    /// Tokenize a prompt (no BOS/EOS).
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Forward pass over `context` (BOS, prompt tokens, then everything
    /// generated so far), returning the next-token distribution under the
    /// run's `params`.
    async fn step_distribution(
        &self,
        context: &[TokenId],
        params: &StepParams,
    ) -> Result<StepOutput>;
}

/// Dense distribution putting all mass on `id`.
pub fn one_hot(size: usize, id: TokenId) -> Vec<f32> {
    let mut dist = vec![0.0; size];
    if let Some(slot) = dist.get_mut(id as usize) {
        *slot = 1.0;
    }
    dist
}
