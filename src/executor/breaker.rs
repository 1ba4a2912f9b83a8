//! Per-tool circuit breakers: a rolling window of the last `W` outcomes,
//! opening once the window is full and the failure rate reaches `threshold`.
//! No half-open probing; recovery requires an external reset.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;

struct Window {
    window: usize,
    threshold: f64,
    outcomes: VecDeque<bool>,
}

/// One tool's rolling outcome window.
pub struct CircuitBreaker {
    state: Mutex<Window>,
}

impl CircuitBreaker {
    fn new(window: usize, threshold: f64) -> Self {
        CircuitBreaker {
            state: Mutex::new(Window {
                window,
                threshold,
                outcomes: VecDeque::with_capacity(window),
            }),
        }
    }

    /// Whether the breaker currently rejects new invocations.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().expect("breaker mutex poisoned");
        if state.outcomes.len() < state.window {
            return false;
        }
        let failures = state.outcomes.iter().filter(|ok| !**ok).count() as f64;
        (failures / state.outcomes.len() as f64) >= state.threshold
    }

    /// Record a successful invocation.
    pub fn record_success(&self) {
        self.push(true);
    }

    /// Record a failed invocation (including rate-limit and lock-timeout rejections).
    pub fn record_failure(&self) {
        self.push(false);
    }

    fn push(&self, outcome: bool) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        let window = state.window;
        state.outcomes.push_back(outcome);
        if state.outcomes.len() > window {
            state.outcomes.pop_front();
        }
    }
}

/// Per-tool breaker registry, created lazily on first reference.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
    window: usize,
    threshold: f64,
}

impl BreakerRegistry {
    /// Create a registry whose breakers all share `window`/`threshold`.
    pub fn new(window: usize, threshold: f64) -> Self {
        BreakerRegistry {
            breakers: DashMap::new(),
            window,
            threshold,
        }
    }

    /// The breaker for `tool`, creating it on first reference.
    pub fn get(&self, tool: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(tool.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.window, self.threshold)))
            .clone()
    }
}
