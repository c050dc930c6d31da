//! Generation options and engine configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokstream_sampling::SamplingPolicy;

use crate::error::{GenerateError, Result};

/// Per-call generation options. Copied into the decoder when a run starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Step budget handed to the backend. 0 = model default/maximum.
    #[serde(alias = "steps")]
    pub max_steps: usize,

    /// Sampling temperature.
    /// - 0.0: deterministic argmax
    /// - 1.0: baseline
    pub temperature: f32,

    /// Finish the run when BOS or EOS is sampled (streaming mode only).
    #[serde(alias = "stopOnBosOrEos", alias = "stop_on_bos_or_eos")]
    pub stop_on_boundary_token: bool,

    /// Nucleus cutoff. 1.0 disables it.
    #[serde(alias = "topp")]
    pub top_p: f32,

    /// Random-source seed. `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_steps: 0,
            temperature: 0.9,
            stop_on_boundary_token: true,
            top_p: 1.0,
            seed: None,
        }
    }
}

impl GenerationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn with_max_steps(mut self, n: usize) -> Self {
        self.max_steps = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_stop_on_boundary_token(mut self, stop: bool) -> Self {
        self.stop_on_boundary_token = stop;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn sampling_policy(&self) -> SamplingPolicy {
        SamplingPolicy::new(self.temperature).with_top_p(self.top_p)
    }

    pub fn validate(&self) -> Result<()> {
        self.sampling_policy()
            .validate()
            .map_err(|e| GenerateError::InvalidOptions(e.to_string()))
    }
}

/// Engine-wide configuration, loadable from a JSON file.
///
/// ```json
/// {
///   "tokenizer_path": "tokenizer.bin",
///   "model_path": "model.json",
///   "generation": { "temperature": 0.0, "max_steps": 64 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tokenizer data; `None` lets the backend use its built-in one.
    pub tokenizer_path: Option<PathBuf>,

    /// Model description; `None` lets the backend use its built-in one.
    pub model_path: Option<PathBuf>,

    /// Defaults for calls that do not supply their own options.
    pub generation: GenerationOptions,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.generation.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn with_generation(mut self, options: GenerationOptions) -> Self {
        self.generation = options;
        self
    }

    pub fn with_tokenizer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_path = Some(path.into());
        self
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }
}
