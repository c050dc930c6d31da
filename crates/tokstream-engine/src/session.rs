//! Generation sessions.
//!
//! A [`GenerationSession`] drives one [`DecodeStateMachine`] in two modes:
//!
//! - **Streaming** ([`generate`](GenerationSession::generate)): the step loop
//!   runs on a spawned task, emitting token, word and finish notifications,
//!   and resolves a [`CompletionHandle`] with the final text.
//! - **Manual** ([`manual_start`](GenerationSession::manual_start) /
//!   [`manual_next`](GenerationSession::manual_next)): the caller picks each
//!   token from the ranked distribution.
//!
//! Any new run supersedes the previous one. A superseded (or interrupted)
//! run's completion resolves with the text it had produced so far; it never
//! fails.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokstream_backend::ModelBackend;
use tokstream_sampling::rank;
use tokstream_vocab::{Token, TokenId, Vocabulary};
use tracing::Instrument;
use uuid::Uuid;

use crate::decode::{DecodeState, DecodeStateMachine, Phase, StepOutcome};
use crate::error::{GenerateError, Result};
use crate::events::{
    DistributionEvent, EventHub, FinishEvent, FinishReason, SubscriptionId, TokenEvent,
    TokenStream, WordEvent,
};
use crate::options::GenerationOptions;
use crate::telemetry::{LogTelemetry, RunMetrics, RunTimer, TelemetryHook};

/// What `manual_next` accepts as the caller's choice.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenInput {
    Id(TokenId),
    Token(Token),
    /// Exact vocabulary text.
    Text(String),
}

impl From<TokenId> for TokenInput {
    fn from(id: TokenId) -> Self {
        TokenInput::Id(id)
    }
}

impl From<Token> for TokenInput {
    fn from(token: Token) -> Self {
        TokenInput::Token(token)
    }
}

impl From<&Token> for TokenInput {
    fn from(token: &Token) -> Self {
        TokenInput::Token(token.clone())
    }
}

impl From<&str> for TokenInput {
    fn from(text: &str) -> Self {
        TokenInput::Text(text.to_string())
    }
}

impl From<String> for TokenInput {
    fn from(text: String) -> Self {
        TokenInput::Text(text)
    }
}

/// The one outstanding completion of a streaming run. Resolved at most once.
struct PendingSlot {
    sender: Mutex<Option<oneshot::Sender<Result<String>>>>,
}

impl PendingSlot {
    fn new(sender: oneshot::Sender<Result<String>>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns false when the slot was already resolved.
    fn resolve(&self, result: Result<String>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                // The caller may have dropped its handle; that is fine.
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }
}

/// Resolves with the run's final text, or the partial text if the run was
/// superseded or interrupted. Fails only when the backend failed mid-run.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<String>>,
}

impl Future for CompletionHandle {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(GenerateError::SessionClosed)))
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    pending: Arc<PendingSlot>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    active: Option<ActiveRun>,
}

/// One caller's generation context over a shared backend.
pub struct GenerationSession<B: ModelBackend + ?Sized + 'static> {
    id: Uuid,
    machine: Arc<DecodeStateMachine<B>>,
    events: Arc<EventHub>,
    control: tokio::sync::Mutex<Control>,
    metrics: LogTelemetry,
    hooks: Vec<Arc<dyn TelemetryHook>>,
}

impl<B: ModelBackend + ?Sized + 'static> GenerationSession<B> {
    pub fn new(backend: Arc<B>, vocab: Arc<Vocabulary>) -> Self {
        let metrics = LogTelemetry::new();
        Self {
            id: Uuid::new_v4(),
            machine: Arc::new(DecodeStateMachine::new(backend, vocab)),
            events: Arc::new(EventHub::new()),
            control: tokio::sync::Mutex::new(Control::default()),
            hooks: vec![Arc::new(metrics.clone())],
            metrics,
        }
    }

    /// Add a telemetry hook for every following streaming run.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.id
    }

    pub fn vocabulary(&self) -> Arc<Vocabulary> {
        Arc::clone(self.machine.vocabulary())
    }

    /// Start a streaming run, superseding whatever was running.
    ///
    /// Lookup and option errors are returned here; failures during the run
    /// come back through the returned handle.
    pub async fn generate(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<CompletionHandle> {
        options.validate()?;
        let mut control = self.control.lock().await;
        self.supersede(&mut control, FinishReason::Superseded).await;

        self.machine.reset(prompt, &options)?;
        let prompt_tokens = self.machine.state().prompt_tokens.len();

        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingSlot::new(tx));
        let cancel = CancellationToken::new();
        let timer = RunTimer::new(prompt_tokens, self.hooks.clone());

        tracing::info!(
            session = %self.id,
            prompt_tokens,
            max_steps = options.max_steps,
            temperature = options.temperature,
            "generation started"
        );

        let span = tracing::info_span!("run", session = %self.id);
        let task = tokio::spawn(
            drive(
                Arc::clone(&self.machine),
                Arc::clone(&self.events),
                Arc::clone(&pending),
                cancel.clone(),
                timer,
            )
            .instrument(span),
        );

        control.active = Some(ActiveRun {
            cancel,
            pending,
            task,
        });
        Ok(CompletionHandle { rx })
    }

    /// Start manual stepping: history becomes BOS plus the prompt's tokens
    /// and the ranked candidates for the next token are returned.
    pub async fn manual_start(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<Vec<Token>> {
        options.validate()?;
        let mut control = self.control.lock().await;
        self.supersede(&mut control, FinishReason::Superseded).await;

        self.machine.reset_manual(prompt, &options)?;
        tracing::info!(session = %self.id, "manual stepping started");
        self.ranked().await
    }

    /// Append the caller's chosen token and return the ranked candidates for
    /// the one after it.
    ///
    /// An id outside the vocabulary or text without an exact match fails
    /// with [`GenerateError::InvalidToken`] and changes nothing.
    pub async fn manual_next(&self, input: impl Into<TokenInput>) -> Result<Vec<Token>> {
        let _control = self.control.lock().await;
        if !self.machine.is_manual() || self.machine.phase() == Phase::Idle {
            return Err(GenerateError::ManualNotStarted);
        }

        let id = self.resolve(input.into())?;
        let outcome = self.machine.force(id)?;
        self.publish(&outcome);
        self.ranked().await
    }

    fn resolve(&self, input: TokenInput) -> Result<TokenId> {
        let vocab = self.machine.vocabulary();
        let id = match input {
            TokenInput::Id(id) => id,
            TokenInput::Token(token) => token.id,
            TokenInput::Text(text) => vocab
                .text_to_id(&text)
                .map_err(|_| GenerateError::InvalidToken(format!("no vocabulary entry {text:?}")))?,
        };
        if !vocab.contains_id(id) {
            return Err(GenerateError::InvalidToken(format!(
                "token id {id} out of range (vocabulary size {})",
                vocab.len()
            )));
        }
        Ok(id)
    }

    async fn ranked(&self) -> Result<Vec<Token>> {
        let distribution = self.machine.distribution().await?;
        let tokens = rank(&distribution, self.machine.vocabulary());
        self.events.emit_distribution(&DistributionEvent {
            tokens: tokens.clone(),
        });
        Ok(tokens)
    }

    fn publish(&self, outcome: &StepOutcome) {
        publish(&self.events, &self.machine, outcome);
    }

    /// Stop the active run. Its completion resolves with the partial text.
    /// Returns whether anything was running.
    pub async fn interrupt(&self) -> bool {
        let mut control = self.control.lock().await;
        self.supersede(&mut control, FinishReason::Interrupted).await
    }

    /// Stop the previous run (if any) so that only one run's steps are ever
    /// in flight, then resolve its completion with the text it had.
    async fn supersede(&self, control: &mut Control, reason: FinishReason) -> bool {
        let Some(run) = control.active.take() else {
            return self.machine.interrupt();
        };

        run.cancel.cancel();
        if let Err(err) = run.task.await {
            tracing::warn!(session = %self.id, error = %err, "step loop ended abnormally");
        }
        let stopped = self.machine.interrupt();

        let text = self.machine.accumulated_text();
        if run.pending.resolve(Ok(text.clone())) {
            tracing::warn!(session = %self.id, ?reason, text_len = text.len(), "run stopped early");
            self.events.emit_finish(&FinishEvent {
                reason,
                text,
                error: None,
            });
            true
        } else {
            stopped
        }
    }

    pub fn on_token<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.events.on_token(f)
    }

    pub fn on_word<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&WordEvent) + Send + Sync + 'static,
    {
        self.events.on_word(f)
    }

    pub fn on_finish<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&FinishEvent) + Send + Sync + 'static,
    {
        self.events.on_finish(f)
    }

    pub fn on_distribution<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&DistributionEvent) + Send + Sync + 'static,
    {
        self.events.on_distribution(f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Token notifications of the next streaming run as a stream.
    pub fn token_stream(&self) -> TokenStream {
        self.events.token_stream()
    }

    pub fn history(&self) -> Vec<Token> {
        self.machine.history()
    }

    pub fn accumulated_text(&self) -> String {
        self.machine.accumulated_text()
    }

    pub fn words(&self) -> Vec<String> {
        self.machine.words()
    }

    pub fn is_finished(&self) -> bool {
        self.machine.is_finished()
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn state(&self) -> DecodeState {
        self.machine.state()
    }

    /// Metrics of the most recent streaming run that completed. Superseded,
    /// interrupted and failed runs leave this unchanged.
    pub fn last_metrics(&self) -> Option<RunMetrics> {
        self.metrics.last_metrics()
    }
}

impl<B: ModelBackend + ?Sized + 'static> Drop for GenerationSession<B> {
    fn drop(&mut self) {
        if let Some(run) = self.control.get_mut().active.take() {
            run.cancel.cancel();
            run.pending.resolve(Ok(self.machine.accumulated_text()));
        }
    }
}

impl<B: ModelBackend + ?Sized + 'static> std::fmt::Debug for GenerationSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("id", &self.id)
            .field("machine", &self.machine)
            .field("events", &self.events)
            .finish()
    }
}

fn publish<B: ModelBackend + ?Sized>(
    events: &EventHub,
    machine: &DecodeStateMachine<B>,
    outcome: &StepOutcome,
) {
    events.emit_token(&TokenEvent {
        position: outcome.position,
        token: outcome.token.clone(),
    });
    if outcome.words.is_empty() {
        return;
    }
    let first_index = machine.words().len() - outcome.words.len();
    for (offset, word) in outcome.words.iter().enumerate() {
        events.emit_word(&WordEvent {
            index: first_index + offset,
            word: word.clone(),
        });
    }
}

/// The streaming step loop.
async fn drive<B: ModelBackend + ?Sized + 'static>(
    machine: Arc<DecodeStateMachine<B>>,
    events: Arc<EventHub>,
    pending: Arc<PendingSlot>,
    cancel: CancellationToken,
    mut timer: RunTimer,
) {
    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("step loop cancelled");
                return;
            }
            step = machine.advance() => step,
        };

        match step {
            Ok(outcome) => {
                timer.mark_token();
                publish(&events, &machine, &outcome);
                if outcome.finished {
                    let text = machine.accumulated_text();
                    let metrics = timer.finish();
                    tracing::info!(
                        generated = metrics.generated_tokens,
                        text_len = text.len(),
                        "generation finished"
                    );
                    if pending.resolve(Ok(text.clone())) {
                        events.emit_finish(&FinishEvent {
                            reason: FinishReason::Completed,
                            text,
                            error: None,
                        });
                    }
                    return;
                }
            }
            Err(GenerateError::InvalidState { .. }) => {
                // Stopped from outside without going through the session.
                let text = machine.accumulated_text();
                if pending.resolve(Ok(text.clone())) {
                    events.emit_finish(&FinishEvent {
                        reason: FinishReason::Interrupted,
                        text,
                        error: None,
                    });
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "generation failed");
                let text = err.partial_text().unwrap_or_default().to_string();
                let message = err.to_string();
                // Failed runs report no metrics.
                drop(timer);
                if pending.resolve(Err(err)) {
                    events.emit_finish(&FinishEvent {
                        reason: FinishReason::Failed,
                        text,
                        error: Some(message),
                    });
                }
                return;
            }
        }
    }
}
