//! Shared backend handle that hands out sessions.

use std::sync::{Arc, OnceLock};

use tokstream_backend::ModelBackend;
use tokstream_vocab::Vocabulary;

use crate::error::Result;
use crate::options::GenerationOptions;
use crate::session::GenerationSession;
use crate::telemetry::TelemetryHook;

/// Owns the backend and its vocabulary. The vocabulary is read from the
/// backend on first use and shared by every session afterwards.
pub struct Engine<B: ModelBackend + ?Sized + 'static> {
    backend: Arc<B>,
    vocab: OnceLock<Arc<Vocabulary>>,
    defaults: GenerationOptions,
    hooks: Vec<Arc<dyn TelemetryHook>>,
}

impl<B: ModelBackend + ?Sized + 'static> Engine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            vocab: OnceLock::new(),
            defaults: GenerationOptions::default(),
            hooks: Vec::new(),
        }
    }

    /// Options used by callers that do not bring their own.
    pub fn with_defaults(mut self, defaults: GenerationOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Attach a telemetry hook to every session created afterwards.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn defaults(&self) -> &GenerationOptions {
        &self.defaults
    }

    /// The backend's vocabulary, loaded once.
    ///
    /// Fails with `BackendUnavailable` while the backend is still
    /// initializing; a later call retries.
    pub fn vocabulary(&self) -> Result<Arc<Vocabulary>> {
        if let Some(vocab) = self.vocab.get() {
            return Ok(Arc::clone(vocab));
        }
        let loaded = Arc::new(Vocabulary::load(self.backend.as_ref())?);
        tracing::info!(vocab_size = loaded.len(), "vocabulary loaded");
        Ok(Arc::clone(self.vocab.get_or_init(|| loaded)))
    }

    /// A fresh session over the shared backend and vocabulary.
    pub fn session(&self) -> Result<GenerationSession<B>> {
        let vocab = self.vocabulary()?;
        let session = self
            .hooks
            .iter()
            .cloned()
            .fold(GenerationSession::new(Arc::clone(&self.backend), vocab), |s, hook| {
                s.with_telemetry(hook)
            });
        tracing::debug!(session = %session.session_id(), "session created");
        Ok(session)
    }
}

impl<B: ModelBackend + ?Sized + 'static> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("vocab_loaded", &self.vocab.get().is_some())
            .field("defaults", &self.defaults)
            .finish()
    }
}
