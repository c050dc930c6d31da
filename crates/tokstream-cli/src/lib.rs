//! # tokstream-cli
//!
//! Command-line driver for tokstream.
//!
//! Wires: config file + flags → demo backend → engine session → stdout.

pub mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use tokstream_backend::{BackendFailure, ModelSource};
use tokstream_engine::{Engine, EngineConfig, GenerateError, GenerationOptions, TokenInput};
use tokstream_vocab::{Token, TokenId};

pub use demo::{builtin_tokenizer, DemoBackend, ModelCard};

/// Errors surfaced by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("generation error: {0}")]
    Generate(#[from] GenerateError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendFailure),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Flags shared by every subcommand. Each one overrides the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub model: Option<PathBuf>,
}

/// Read the config file (if any) and apply path overrides.
pub fn load_config(overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = match &overrides.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(path) = &overrides.tokenizer {
        config.tokenizer_path = Some(path.clone());
    }
    if let Some(path) = &overrides.model {
        config.model_path = Some(path.clone());
    }
    Ok(config)
}

/// Initialize the demo backend from `config` and wrap it in an engine.
pub async fn build_engine(config: &EngineConfig) -> Result<Engine<DemoBackend>> {
    let model = config.model_path.as_ref().map(ModelSource::path);
    let tokenizer = config.tokenizer_path.as_ref().map(ModelSource::path);
    let backend = DemoBackend::initialize(model.as_ref(), tokenizer.as_ref()).await?;
    Ok(Engine::new(Arc::new(backend)).with_defaults(config.generation.clone()))
}

/// Generation flags as parsed from the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateFlags {
    pub steps: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub no_stop_on_boundary: bool,
}

impl GenerateFlags {
    /// Layer the flags over `defaults`.
    pub fn apply(&self, defaults: &GenerationOptions) -> GenerationOptions {
        let mut options = defaults.clone();
        if let Some(steps) = self.steps {
            options.max_steps = steps;
        }
        if let Some(t) = self.temperature {
            options.temperature = t;
        }
        if let Some(p) = self.top_p {
            options.top_p = p;
        }
        if let Some(seed) = self.seed {
            options.seed = Some(seed);
        }
        if self.no_stop_on_boundary {
            options.stop_on_boundary_token = false;
        }
        options
    }
}

/// Interpret one line typed during manual stepping: a number is a token
/// id, anything else is vocabulary text.
pub fn parse_token_input(line: &str) -> TokenInput {
    match line.trim().parse::<TokenId>() {
        Ok(id) => TokenInput::Id(id),
        Err(_) => TokenInput::Text(line.to_string()),
    }
}

/// One line per candidate: id, probability and quoted text.
pub fn format_ranked(tokens: &[Token], top: usize) -> String {
    let mut out = String::new();
    for token in tokens.iter().take(top) {
        out.push_str(&format!(
            "{:>6}  {:>8.4}  {:?}\n",
            token.id, token.probability, token.text
        ));
    }
    out
}
