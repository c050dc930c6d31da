//! A backend that replays scripted distributions.
//!
//! Used as the deterministic reference backend in tests and demos: every
//! `step_distribution` call pops the next queued distribution (falling back to
//! a fixed one once the queue is empty), records the context and parameters it
//! was given and applies the run's step budget the way llama2.c does, counting
//! every context position including BOS and the prompt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokstream_vocab::{BpeTokenizer, EOS_ID};

use crate::{
    one_hot, BackendFailure, ModelBackend, Result, StepOutput, StepParams, TokenId,
    VocabularySource,
};

/// Context length used when `configure` asks for the model maximum.
pub const DEFAULT_SEQ_LEN: usize = 256;

#[derive(Debug)]
struct Script {
    queue: VecDeque<Vec<f32>>,
    fallback: Vec<f32>,
    contexts: Vec<Vec<TokenId>>,
    step_params: Vec<StepParams>,
}

/// Deterministic backend driven by a queue of distributions.
#[derive(Debug)]
pub struct ScriptedBackend {
    tokenizer: BpeTokenizer,
    script: Mutex<Script>,
    configured: Mutex<Option<StepParams>>,
    ready: AtomicBool,
    calls: AtomicUsize,
    fail_at: Option<usize>,
    delay: Option<Duration>,
    seq_len: usize,
}

impl ScriptedBackend {
    /// Backend over `entries` (ordered by id). Until told otherwise every step
    /// puts all mass on EOS.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokenizer = BpeTokenizer::from_entries(entries.into_iter().map(Into::into).collect());
        Self::with_tokenizer(tokenizer)
    }

    pub fn with_tokenizer(tokenizer: BpeTokenizer) -> Self {
        let size = tokenizer.vocabulary().len();
        Self {
            tokenizer,
            script: Mutex::new(Script {
                queue: VecDeque::new(),
                fallback: one_hot(size, EOS_ID),
                contexts: Vec::new(),
                step_params: Vec::new(),
            }),
            configured: Mutex::new(None),
            ready: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            fail_at: None,
            delay: None,
            seq_len: DEFAULT_SEQ_LEN,
        }
    }

    /// Queue distributions to hand out in order.
    pub fn with_distributions(self, distributions: impl IntoIterator<Item = Vec<f32>>) -> Self {
        lock(&self.script).queue.extend(distributions);
        self
    }

    /// Distribution used once the queue runs dry.
    pub fn always(self, distribution: Vec<f32>) -> Self {
        lock(&self.script).fallback = distribution;
        self
    }

    /// Once the queue runs dry, always put all mass on `id`.
    pub fn always_token(self, id: TokenId) -> Self {
        let size = self.vocab_size();
        self.always(one_hot(size, id))
    }

    /// Queue one-hot distributions for each id in turn.
    pub fn with_token_sequence(self, ids: impl IntoIterator<Item = TokenId>) -> Self {
        let size = self.vocab_size();
        self.with_distributions(ids.into_iter().map(|id| one_hot(size, id)).collect::<Vec<_>>())
    }

    /// Fail the `call`-th (1-based) `step_distribution` call.
    pub fn with_failure_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Sleep this long inside every step, to exercise suspension.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Context length used when the configured budget is 0.
    pub fn with_seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    /// Report "not initialized" until [`mark_ready`](Self::mark_ready).
    pub fn unready(self) -> Self {
        self.ready.store(false, Ordering::Release);
        self
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn push_distribution(&self, distribution: Vec<f32>) {
        lock(&self.script).queue.push_back(distribution);
    }

    /// Number of `step_distribution` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Every context passed to `step_distribution`, oldest first.
    pub fn contexts(&self) -> Vec<Vec<TokenId>> {
        lock(&self.script).contexts.clone()
    }

    /// Result of the most recent `configure` call. Steps never read this;
    /// they use the parameters they are handed.
    pub fn configured(&self) -> Option<StepParams> {
        *lock(&self.configured)
    }

    /// Parameters passed to every `step_distribution` call, oldest first.
    pub fn step_params(&self) -> Vec<StepParams> {
        lock(&self.script).step_params.clone()
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VocabularySource for ScriptedBackend {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
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
impl ModelBackend for ScriptedBackend {
    fn configure(&self, temperature: f32, max_steps: usize) -> StepParams {
        let params = StepParams::resolve(temperature, max_steps, self.seq_len);
        *lock(&self.configured) = Some(params);
        params
    }

    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(self.tokenizer.encode(text)?)
    }

    async fn step_distribution(
        &self,
        context: &[TokenId],
        params: &StepParams,
    ) -> Result<StepOutput> {
        if !self.is_ready() {
            return Err(BackendFailure::Unavailable);
        }

        let call = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_at == Some(call) {
            tracing::debug!(call, "scripted failure");
            return Err(BackendFailure::Step(format!("scripted failure at call {call}")));
        }

        let distribution = {
            let mut script = lock(&self.script);
            script.contexts.push(context.to_vec());
            script.step_params.push(*params);
            match script.queue.pop_front() {
                Some(dist) => dist,
                None => script.fallback.clone(),
            }
        };

        // The token picked from this distribution occupies position
        // `context.len()`; the run ends once that is the last position.
        let budget_exhausted = params.budget_exhausted(context.len());

        Ok(StepOutput {
            distribution,
            budget_exhausted,
        })
    }
}
