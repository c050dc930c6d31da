//! Telemetry hooks for generation runs.
//!
//! Provides:
//! - [`RunMetrics`]: time to first token, tokens/sec and a run summary
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`RunTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Aggregate metrics from one streaming run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    /// Time from run start to the first generated token, in milliseconds.
    pub ttft_ms: f64,
    /// Tokens per second after the first one.
    pub tokens_per_sec: f64,
    /// Number of prompt tokens fed before generation.
    pub prompt_tokens: usize,
    /// Number of tokens generated.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the first token of a run is ready.
    fn on_first_token(&self, _ttft_ms: f64) {}

    /// Called after each step produces a token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when a run finishes with the full metrics summary.
    fn on_run_complete(&self, _metrics: &RunMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the most recent run's metrics.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<RunMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<RunMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_run_complete(&self, metrics: &RunMetrics) {
        tracing::debug!(
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            generated = metrics.generated_tokens,
            "run metrics"
        );
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
    }
}

/// Records timestamps during a run to compute [`RunMetrics`].
///
/// Usage:
/// 1. [`RunTimer::new`] when the run starts
/// 2. [`RunTimer::mark_token`] after each step
/// 3. [`RunTimer::finish`] to compute the final metrics
pub struct RunTimer {
    prompt_tokens: usize,
    start: Instant,
    first_token: Option<Instant>,
    token_count: usize,
    hooks: Vec<Arc<dyn TelemetryHook>>,
}

impl RunTimer {
    pub fn new(prompt_tokens: usize, hooks: Vec<Arc<dyn TelemetryHook>>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            first_token: None,
            token_count: 0,
            hooks,
        }
    }

    /// Mark one generated token. The first call also fires `on_first_token`.
    pub fn mark_token(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        if self.first_token.is_none() {
            self.first_token = Some(now);
            for hook in &self.hooks {
                hook.on_first_token(elapsed_ms);
            }
        }
        self.token_count += 1;
        for hook in &self.hooks {
            hook.on_token_generated(self.token_count, elapsed_ms);
        }
    }

    /// Finalize and return metrics. Fires `on_run_complete`.
    pub fn finish(self) -> RunMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .first_token
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let decoded = self.token_count.saturating_sub(1);
        let tokens_per_sec = if decode_time_ms > 0.0 && decoded > 0 {
            decoded as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = RunMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };

        for hook in &self.hooks {
            hook.on_run_complete(&metrics);
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        first: AtomicUsize,
        tokens: AtomicUsize,
    }

    impl TelemetryHook for Counting {
        fn on_first_token(&self, _ttft_ms: f64) {
            self.first.fetch_add(1, Ordering::Relaxed);
        }
        fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {
            self.tokens.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn log_telemetry_captures_metrics() {
        let hook = LogTelemetry::new();
        assert!(hook.last_metrics().is_none());

        let metrics = RunMetrics {
            ttft_ms: 12.5,
            tokens_per_sec: 80.0,
            prompt_tokens: 4,
            generated_tokens: 8,
            total_time_ms: 112.5,
        };
        hook.on_run_complete(&metrics);
        assert_eq!(hook.last_metrics(), Some(metrics));
    }

    #[test]
    fn timer_fires_hooks() {
        let log = LogTelemetry::new();
        let counting = Arc::new(Counting::default());

        let hooks: Vec<Arc<dyn TelemetryHook>> = vec![Arc::new(log.clone()), counting.clone()];
        let mut timer = RunTimer::new(2, hooks);
        timer.mark_token();
        timer.mark_token();
        timer.mark_token();
        let metrics = timer.finish();

        assert_eq!(metrics.generated_tokens, 3);
        assert_eq!(metrics.prompt_tokens, 2);
        assert!(metrics.total_time_ms >= metrics.ttft_ms);
        assert_eq!(counting.first.load(Ordering::Relaxed), 1);
        assert_eq!(counting.tokens.load(Ordering::Relaxed), 3);
        assert_eq!(log.last_metrics().unwrap().generated_tokens, 3);
    }

    #[test]
    fn timer_without_tokens() {
        let metrics = RunTimer::new(1, vec![Arc::new(NoopTelemetry)]).finish();
        assert_eq!(metrics.ttft_ms, 0.0);
        assert_eq!(metrics.generated_tokens, 0);
        assert_eq!(metrics.tokens_per_sec, 0.0);
    }
}
