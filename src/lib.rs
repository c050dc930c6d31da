//! Streaming autoregressive token generation.
//!
//! This crate re-exports the tokstream workspace behind one dependency:
//! vocabulary handling, sampling, the model-backend trait and the generation
//! engine (decode state machine, sessions, word segmentation).

pub use tokstream_backend as backend;
pub use tokstream_engine as engine;
pub use tokstream_sampling as sampling;
pub use tokstream_vocab as vocab;

pub use tokstream_backend::{
    BackendFailure, ModelBackend, ModelSource, ScriptedBackend, StepOutput, StepParams,
};
pub use tokstream_engine::{
    CompletionHandle, DecodeState, DecodeStateMachine, Engine, EngineConfig, FinishEvent,
    FinishReason, GenerateError, GenerationOptions, GenerationSession, Phase, TokenEvent,
    TokenInput, WordEvent, WordSegmenter,
};
pub use tokstream_sampling::{rank, SamplingPolicy, SeededRng};
pub use tokstream_vocab::{BpeTokenizer, Token, TokenId, Vocabulary, BOS_ID, EOS_ID, PAD_ID};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
