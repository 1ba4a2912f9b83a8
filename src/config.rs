//! Ambient configuration for the compiler and executor, deserializable from
//! the same plan document that carries the IR.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Configuration consumed by [`crate::compiler::compile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Maximum number of scheduled nodes whose intervals may overlap.
    pub concurrency_limit: usize,
    /// The compile-time deadline in milliseconds; scheduling fails if it can't be met.
    pub deadline_ms: f64,
    /// Per-resource rate limit in invocations per second.
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,
    /// Per-resource burst capacity. Resources absent here default to their per-second rate.
    #[serde(default)]
    pub rate_bursts: HashMap<String, f64>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            concurrency_limit: 4,
            deadline_ms: f64::INFINITY,
            rate_limits: HashMap::new(),
            rate_bursts: HashMap::new(),
        }
    }
}

impl CompilerConfig {
    /// The burst capacity for `resource`, defaulting to its per-second rate.
    pub fn burst_for(&self, resource: &str) -> Option<f64> {
        let rate = *self.rate_limits.get(resource)?;
        Some(self.rate_bursts.get(resource).copied().unwrap_or(rate))
    }
}

/// Configuration consumed by [`crate::executor::Executor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker pool size.
    pub concurrency_limit: usize,
    /// Per-lock acquisition timeout, in seconds.
    pub lock_timeout_s: f64,
    /// Base retry backoff, in seconds.
    pub backoff_base_s: f64,
    /// Retry backoff ceiling, in seconds.
    pub max_backoff_s: f64,
    /// Fractional jitter applied to backoff delays, in `[0, 1]`.
    pub jitter: f64,
    /// Rolling window size for circuit breakers.
    pub circuit_breaker_window: usize,
    /// Failure-rate threshold at which a breaker opens, once its window is full.
    pub circuit_breaker_threshold: f64,
    /// Seed for the pseudorandom jitter source, so runs are reproducible.
    pub jitter_seed: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            concurrency_limit: 4,
            lock_timeout_s: 2.0,
            backoff_base_s: 0.1,
            max_backoff_s: 2.0,
            jitter: 0.0,
            circuit_breaker_window: 10,
            circuit_breaker_threshold: 0.5,
            jitter_seed: 0,
        }
    }
}
