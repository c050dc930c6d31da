//! Error types for the tokstream engine.

use tokstream_backend::BackendFailure;
use tokstream_sampling::SamplingError;
use tokstream_vocab::{TokenId, VocabError};

use crate::decode::Phase;

/// Top-level error type for decode and session operations.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("model backend is not ready")]
    BackendUnavailable,

    #[error("model backend failed to initialize: {0}")]
    BackendInitError(String),

    #[error("another operation is already in flight on this decoder")]
    BackendBusy,

    /// A step failed mid-run. Carries the text produced before the failure.
    #[error("backend error: {message}")]
    BackendError { message: String, partial: String },

    #[error("token id {id} out of range (vocabulary size {size})")]
    OutOfRange { id: TokenId, size: usize },

    #[error("unknown token: {0:?}")]
    UnknownToken(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: Phase, actual: Phase },

    #[error("manual stepping has not been started")]
    ManualNotStarted,

    #[error("invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("session closed before the run completed")]
    SessionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GenerateError>;

impl GenerateError {
    /// Wrap a mid-run failure together with the text produced so far.
    pub fn backend(message: impl ToString, partial: impl Into<String>) -> Self {
        GenerateError::BackendError {
            message: message.to_string(),
            partial: partial.into(),
        }
    }

    /// Text produced before the failure, if this error carries any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            GenerateError::BackendError { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

impl From<VocabError> for GenerateError {
    fn from(err: VocabError) -> Self {
        match err {
            VocabError::BackendUnavailable => GenerateError::BackendUnavailable,
            VocabError::OutOfRange { id, size } => GenerateError::OutOfRange { id, size },
            VocabError::UnknownToken(text) => GenerateError::UnknownToken(text),
            VocabError::Malformed(msg) => GenerateError::BackendInitError(msg),
            VocabError::Io(e) => GenerateError::Io(e),
        }
    }
}

impl From<BackendFailure> for GenerateError {
    fn from(err: BackendFailure) -> Self {
        match err {
            BackendFailure::Unavailable => GenerateError::BackendUnavailable,
            BackendFailure::Init(msg) => GenerateError::BackendInitError(msg),
            BackendFailure::Encode(e) => e.into(),
            BackendFailure::Io(e) => GenerateError::Io(e),
            BackendFailure::Step(msg) => GenerateError::backend(msg, String::new()),
        }
    }
}

impl From<SamplingError> for GenerateError {
    fn from(err: SamplingError) -> Self {
        match err {
            SamplingError::InvalidTemperature(_) | SamplingError::InvalidTopP(_) => {
                GenerateError::InvalidOptions(err.to_string())
            }
            _ => GenerateError::backend(err, String::new()),
        }
    }
}
