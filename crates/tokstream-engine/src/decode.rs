//! The decode state machine.
//!
//! Owns one run's context and advances it a token at a time:
//!
//! ```text
//! Idle ──reset──▶ Running ──step──▶ Running
//!                    │
//!                    ├── boundary token / budget ──▶ Finished
//!                    └── interrupt / backend error ──▶ Interrupted
//! ```
//!
//! `Finished` and `Interrupted` stay put until the next reset. At most one
//! reset/step runs at a time; a second concurrent call fails with
//! [`GenerateError::BackendBusy`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokstream_backend::{ModelBackend, StepParams};
use tokstream_sampling::{SamplingPolicy, SeededRng};
use tokstream_vocab::{is_boundary, PieceDecoder, Token, TokenId, Vocabulary, BOS_ID};

use crate::error::{GenerateError, Result};
use crate::options::GenerationOptions;
use crate::words::WordSegmenter;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Finished,
    Interrupted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Interrupted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Finished => "finished",
            Phase::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Snapshot of the decoder's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeState {
    pub phase: Phase,
    pub history: Vec<Token>,
    pub finished: bool,
    pub accumulated_text: String,
    pub prompt_tokens: Vec<TokenId>,
}

/// What one step (sampled or forced) produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub token: Token,
    /// Index of the token in the run's history (BOS is 0).
    pub position: usize,
    /// Words completed by this token, in order.
    pub words: Vec<String>,
    /// The run reached `Finished` with this token.
    pub finished: bool,
}

struct Inner {
    phase: Phase,
    manual: bool,
    history: Vec<Token>,
    accumulated_text: String,
    prompt_tokens: Vec<TokenId>,
    /// What the backend sees: BOS, prompt, then every appended id.
    context: Vec<TokenId>,
    decoder: PieceDecoder,
    words: WordSegmenter,
    options: GenerationOptions,
    /// Resolved by the backend at reset; owned by this run alone.
    params: Option<StepParams>,
    policy: SamplingPolicy,
    rng: SeededRng,
    last_distribution: Option<Vec<f32>>,
}

/// A validated, encoded and configured run that has not started yet.
struct Prepared {
    options: GenerationOptions,
    params: StepParams,
    prompt_tokens: Vec<TokenId>,
}

impl Inner {
    fn new() -> Self {
        let options = GenerationOptions::default();
        Self {
            phase: Phase::Idle,
            manual: false,
            history: Vec::new(),
            accumulated_text: String::new(),
            prompt_tokens: Vec::new(),
            context: Vec::new(),
            decoder: PieceDecoder::new(),
            words: WordSegmenter::new(),
            policy: options.sampling_policy(),
            options,
            params: None,
            rng: SeededRng::new(0),
            last_distribution: None,
        }
    }

    fn start(&mut self, run: Prepared, manual: bool) {
        let Prepared {
            options,
            params,
            prompt_tokens,
        } = run;
        self.phase = Phase::Running;
        self.manual = manual;
        self.history.clear();
        self.history.push(Token::bos());
        self.accumulated_text.clear();
        self.context.clear();
        self.context.push(BOS_ID);
        self.context.extend_from_slice(&prompt_tokens);
        self.prompt_tokens = prompt_tokens;
        self.words.reset();
        self.policy = options.sampling_policy();
        self.params = Some(params);
        self.rng = match options.seed {
            Some(seed) => SeededRng::new(seed),
            None => SeededRng::from_clock(),
        };
        self.last_distribution = None;
        self.options = options;

        let previous = self.context.last().copied();
        self.decoder.reset(previous);
    }

    /// Context and parameters for the next backend call.
    fn step_input(&self) -> Result<(Vec<TokenId>, StepParams)> {
        let params = self.params.ok_or(GenerateError::InvalidState {
            expected: Phase::Running,
            actual: self.phase,
        })?;
        Ok((self.context.clone(), params))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.phase != Phase::Running {
            return Err(GenerateError::InvalidState {
                expected: Phase::Running,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn ensure_manual(&self) -> Result<()> {
        if !self.manual || self.phase == Phase::Idle {
            return Err(GenerateError::ManualNotStarted);
        }
        self.ensure_running()
    }

    /// End the run on a failure, keeping the text produced so far.
    fn fail(&mut self, message: impl ToString) -> GenerateError {
        let message = message.to_string();
        tracing::warn!(error = %message, "decode step failed; run interrupted");
        self.phase = Phase::Interrupted;
        GenerateError::backend(message, self.accumulated_text.clone())
    }

    /// Append `id` to the run.
    fn accept(
        &mut self,
        vocab: &Vocabulary,
        id: TokenId,
        probability: f32,
        budget_exhausted: bool,
    ) -> Result<StepOutcome> {
        let suppressed = !self.manual && self.options.stop_on_boundary_token && is_boundary(id);

        let text = if suppressed {
            vocab.id_to_text(id).map(str::to_string)
        } else {
            self.decoder.decode(vocab, id)
        };
        let text = match text {
            Ok(text) => text,
            Err(err) => return Err(self.fail(err)),
        };

        self.context.push(id);
        if !suppressed {
            self.accumulated_text.push_str(&text);
        }
        let token = Token::new(id, text, probability);
        self.history.push(token.clone());
        let position = self.history.len() - 1;

        let finished = !self.manual && (suppressed || budget_exhausted);
        if finished {
            self.phase = Phase::Finished;
        }
        let words = self.words.update(&self.accumulated_text, finished);

        Ok(StepOutcome {
            token,
            position,
            words,
            finished,
        })
    }

    fn snapshot(&self) -> DecodeState {
        DecodeState {
            phase: self.phase,
            history: self.history.clone(),
            finished: self.phase == Phase::Finished,
            accumulated_text: self.accumulated_text.clone(),
            prompt_tokens: self.prompt_tokens.clone(),
        }
    }
}

/// Clears the busy flag when the operation ends, including when its future
/// is dropped mid-await.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Advances one run's decode state against a model backend.
pub struct DecodeStateMachine<B: ModelBackend + ?Sized> {
    backend: Arc<B>,
    vocab: Arc<Vocabulary>,
    inner: Mutex<Inner>,
    busy: AtomicBool,
}

impl<B: ModelBackend + ?Sized> DecodeStateMachine<B> {
    pub fn new(backend: Arc<B>, vocab: Arc<Vocabulary>) -> Self {
        Self {
            backend,
            vocab,
            inner: Mutex::new(Inner::new()),
            busy: AtomicBool::new(false),
        }
    }

    /// Load the vocabulary from `backend` and build a machine over it.
    pub fn from_backend(backend: Arc<B>) -> Result<Self> {
        let vocab = Vocabulary::load(backend.as_ref())?;
        Ok(Self::new(backend, Arc::new(vocab)))
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GenerateError::BackendBusy)?;
        Ok(BusyGuard(&self.busy))
    }

    /// Whether a reset or step is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start a streaming run: encode `prompt`, resolve the run's backend
    /// parameters and leave history holding only BOS.
    pub fn reset(&self, prompt: &str, options: &GenerationOptions) -> Result<()> {
        let _busy = self.acquire()?;
        let run = self.prepare(prompt, options)?;
        tracing::debug!(prompt_tokens = run.prompt_tokens.len(), "decoder reset");
        self.lock().start(run, false);
        Ok(())
    }

    /// Start a manual run. History holds BOS followed by the prompt's
    /// tokens; the prompt text is not part of the accumulated text.
    ///
    /// Fails without touching the current run when the prompt cannot be
    /// encoded or decoded.
    pub fn reset_manual(&self, prompt: &str, options: &GenerationOptions) -> Result<()> {
        let _busy = self.acquire()?;
        let run = self.prepare(prompt, options)?;

        let mut decoder = PieceDecoder::new();
        decoder.reset(Some(BOS_ID));
        let mut prompt_history = Vec::with_capacity(run.prompt_tokens.len());
        for &id in &run.prompt_tokens {
            let text = decoder.decode(&self.vocab, id)?;
            prompt_history.push(Token::new(id, text, 1.0));
        }

        let mut inner = self.lock();
        inner.start(run, true);
        inner.decoder = decoder;
        inner.history.extend(prompt_history);
        tracing::debug!(history = inner.history.len(), "decoder reset for manual stepping");
        Ok(())
    }

    fn prepare(&self, prompt: &str, options: &GenerationOptions) -> Result<Prepared> {
        options.validate()?;
        if !self.backend.is_ready() {
            return Err(GenerateError::BackendUnavailable);
        }
        let prompt_tokens = self.backend.encode(prompt)?;
        let params = self.backend.configure(options.temperature, options.max_steps);
        Ok(Prepared {
            options: options.clone(),
            params,
            prompt_tokens,
        })
    }

    /// Sample and append the next token. Only valid while `Running`.
    pub async fn step(&self) -> Result<Token> {
        self.advance().await.map(|outcome| outcome.token)
    }

    /// [`step`](Self::step), also reporting completed words and whether the
    /// run finished.
    pub async fn advance(&self) -> Result<StepOutcome> {
        let _busy = self.acquire()?;
        let (context, params) = {
            let inner = self.lock();
            inner.ensure_running()?;
            inner.step_input()?
        };

        let result = self.backend.step_distribution(&context, &params).await;

        let mut inner = self.lock();
        // Interrupted while the backend was working: drop the result.
        inner.ensure_running()?;

        let output = match result {
            Ok(output) => output,
            Err(err) => return Err(inner.fail(err)),
        };
        if output.distribution.len() != self.vocab.len() {
            let message = format!(
                "distribution has {} entries for a vocabulary of {}",
                output.distribution.len(),
                self.vocab.len()
            );
            return Err(inner.fail(message));
        }

        let policy = inner.policy;
        let id = match policy.select(&output.distribution, &mut inner.rng) {
            Ok(id) => id,
            Err(err) => return Err(inner.fail(err)),
        };
        let probability = output.distribution[id as usize];

        let outcome = inner.accept(&self.vocab, id, probability, output.budget_exhausted)?;
        tracing::debug!(
            id,
            probability,
            position = inner.context.len(),
            finished = outcome.finished,
            "decode step"
        );
        Ok(outcome)
    }

    /// Stop the current run, keeping its text. Returns whether a running run
    /// was actually stopped.
    pub fn interrupt(&self) -> bool {
        let mut inner = self.lock();
        if inner.phase == Phase::Running {
            inner.phase = Phase::Interrupted;
            tracing::debug!(text_len = inner.accumulated_text.len(), "decoder interrupted");
            true
        } else {
            false
        }
    }

    /// Fetch the next-token distribution of a manual run without sampling.
    /// It is remembered so a following [`force`](Self::force) can report the
    /// chosen token's probability.
    pub async fn distribution(&self) -> Result<Vec<f32>> {
        let _busy = self.acquire()?;
        let (context, params) = {
            let inner = self.lock();
            inner.ensure_manual()?;
            inner.step_input()?
        };

        let result = self.backend.step_distribution(&context, &params).await;

        let mut inner = self.lock();
        inner.ensure_manual()?;
        let output = match result {
            Ok(output) => output,
            Err(err) => return Err(inner.fail(err)),
        };
        if output.distribution.len() != self.vocab.len() {
            let message = format!(
                "distribution has {} entries for a vocabulary of {}",
                output.distribution.len(),
                self.vocab.len()
            );
            return Err(inner.fail(message));
        }

        inner.last_distribution = Some(output.distribution.clone());
        Ok(output.distribution)
    }

    /// Append a caller-chosen token to a manual run as if it had been
    /// sampled. Fails without touching state when `id` is not in the
    /// vocabulary.
    pub fn force(&self, id: TokenId) -> Result<StepOutcome> {
        let _busy = self.acquire()?;
        let mut inner = self.lock();
        inner.ensure_manual()?;
        if !self.vocab.contains_id(id) {
            return Err(GenerateError::InvalidToken(format!(
                "token id {id} out of range (vocabulary size {})",
                self.vocab.len()
            )));
        }

        let probability = inner
            .last_distribution
            .take()
            .and_then(|dist| dist.get(id as usize).copied())
            .unwrap_or(0.0);
        let outcome = inner.accept(&self.vocab, id, probability, false)?;
        tracing::debug!(id, probability, "forced token");
        Ok(outcome)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Finished
    }

    pub fn is_manual(&self) -> bool {
        self.lock().manual
    }

    pub fn history(&self) -> Vec<Token> {
        self.lock().history.clone()
    }

    pub fn accumulated_text(&self) -> String {
        self.lock().accumulated_text.clone()
    }

    /// Every word completed so far in this run.
    pub fn words(&self) -> Vec<String> {
        self.lock().words.words().to_vec()
    }

    pub fn state(&self) -> DecodeState {
        self.lock().snapshot()
    }
}

impl<B: ModelBackend + ?Sized> fmt::Debug for DecodeStateMachine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeStateMachine")
            .field("phase", &self.phase())
            .field("busy", &self.is_busy())
            .field("vocab_size", &self.vocab.len())
            .finish()
    }
}
