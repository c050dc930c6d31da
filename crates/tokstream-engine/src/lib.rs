//! # tokstream-engine
//!
//! Streaming autoregressive generation over a [`ModelBackend`].
//!
//! This crate provides:
//! - [`DecodeStateMachine`]: one run's history, advanced a token at a time
//! - [`GenerationSession`]: streaming runs with completion handles, and
//!   manual stepping over ranked distributions
//! - [`WordSegmenter`]: incremental word boundaries of the generated text
//! - [`Engine`]: shared backend and vocabulary handing out sessions
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokstream_backend::ScriptedBackend;
//! use tokstream_engine::{Engine, GenerationOptions};
//!
//! # async fn demo() -> tokstream_engine::Result<()> {
//! let backend = Arc::new(ScriptedBackend::new(["<pad>", "<s>", "</s>", "a"]));
//! let session = Engine::new(backend).session()?;
//! session.on_word(|event| print!("{}", event.word));
//! let text = session.generate("a", GenerationOptions::greedy()).await?.await?;
//! println!("\n{text}");
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod options;
pub mod session;
pub mod telemetry;
pub mod words;

pub use decode::{DecodeState, DecodeStateMachine, Phase, StepOutcome};
pub use engine::Engine;
pub use error::{GenerateError, Result};
pub use events::{
    DistributionEvent, EventHub, FinishEvent, FinishReason, SubscriptionId, TokenEvent,
    TokenStream, WordEvent,
};
pub use options::{EngineConfig, GenerationOptions};
pub use session::{CompletionHandle, GenerationSession, TokenInput};
pub use telemetry::{LogTelemetry, NoopTelemetry, RunMetrics, RunTimer, TelemetryHook};
pub use words::{split_words, WordSegmenter, WORD_DELIMITERS};

pub use tokstream_backend::ModelBackend;
