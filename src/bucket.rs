//! C3: Token bucket — the rate primitive shared by compiler feasibility
//! checks (on a simulated timeline) and executor enforcement (on wall-clock).

use std::sync::Mutex;

/// A classic token bucket with lazy refill. `rate_per_ms` and `capacity` are
/// fixed at construction; `tokens`/`last_time_ms` are the only mutable state.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_ms: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_time_ms: f64,
}

impl TokenBucket {
    /// Create a full bucket (`tokens == capacity`) with the given refill rate.
    pub fn new(rate_per_ms: f64, capacity: f64) -> Self {
        TokenBucket {
            rate_per_ms,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_time_ms: 0.0,
            }),
        }
    }

    /// Refill up to `t`, ignoring observations in the past (monotone clock).
    fn refill(&self, state: &mut BucketState, t: f64) {
        if t > state.last_time_ms {
            let elapsed = t - state.last_time_ms;
            state.tokens = (state.tokens + self.rate_per_ms * elapsed).min(self.capacity);
            state.last_time_ms = t;
        }
    }

    /// Refill to `t`, then report whether a token is available, without consuming it.
    pub fn has_token_at(&self, t: f64) -> bool {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        self.refill(&mut state, t);
        state.tokens >= 1.0
    }

    /// Refill to `t`; if a token is available, consume it and return `true`.
    pub fn consume_at(&self, t: f64) -> bool {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        self.refill(&mut state, t);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full() {
        let b = TokenBucket::new(0.001, 2.0);
        assert!(b.has_token_at(0.0));
        assert!(b.consume_at(0.0));
        assert!(b.consume_at(0.0));
        assert!(!b.consume_at(0.0));
    }

    #[test]
    fn refills_over_time() {
        let b = TokenBucket::new(1.0, 1.0);
        assert!(b.consume_at(0.0));
        assert!(!b.consume_at(0.5));
        assert!(b.consume_at(1.0));
    }

    #[test]
    fn ignores_past_observations() {
        let b = TokenBucket::new(1.0, 5.0);
        assert!(b.has_token_at(10.0));
        // Observing an earlier time must not roll the clock or tokens back.
        assert!(b.consume_at(1.0));
        assert!(b.has_token_at(10.0));
    }

    #[test]
    fn has_token_at_is_stable_across_repeated_calls() {
        let b = TokenBucket::new(0.0, 1.0);
        assert_eq!(b.has_token_at(5.0), b.has_token_at(5.0));
    }

    #[test]
    fn consume_respects_rate_limit_of_two_per_second() {
        // rate_limits={api:2.0} per-second => 0.002 per-ms, burst=2.
        let b = TokenBucket::new(2.0 / 1000.0, 2.0);
        assert!(b.consume_at(0.0));
        assert!(b.consume_at(0.0));
        assert!(!b.consume_at(0.0));
        assert!(!b.consume_at(499.0));
        assert!(b.consume_at(500.0));
    }
}
