//! Exponential backoff with seeded pseudorandom jitter for the executor's retry loop.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

/// `delay(k) = min(max_backoff_s, backoff_base_s * gamma^(k-1))`, scaled by
/// `1 + jitter*u` with `u` drawn uniformly from `[-1, 1]`, clamped at zero.
/// `attempt` is the 1-indexed retry number (the first retry is `attempt = 1`).
pub fn backoff_delay(
    attempt: u32,
    backoff_base_s: f64,
    max_backoff_s: f64,
    backoff_gamma: f64,
    jitter: f64,
    rng: &mut StdRng,
) -> Duration {
    let raw = backoff_base_s * backoff_gamma.powi(attempt.saturating_sub(1) as i32);
    let capped = raw.min(max_backoff_s);
    let u: f64 = rng.gen_range(-1.0..=1.0);
    let jittered = (capped * (1.0 + jitter * u)).max(0.0);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn delay_is_capped_at_max_backoff() {
        let mut rng = StdRng::seed_from_u64(0);
        let d = backoff_delay(10, 0.1, 2.0, 2.0, 0.0, &mut rng);
        assert_eq!(d, Duration::from_secs_f64(2.0));
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let mut rng = StdRng::seed_from_u64(0);
        let d1 = backoff_delay(1, 0.01, 10.0, 2.0, 0.0, &mut rng);
        let d2 = backoff_delay(2, 0.01, 10.0, 2.0, 0.0, &mut rng);
        let d3 = backoff_delay(3, 0.01, 10.0, 2.0, 0.0, &mut rng);
        assert_eq!(d1, Duration::from_secs_f64(0.01));
        assert_eq!(d2, Duration::from_secs_f64(0.02));
        assert_eq!(d3, Duration::from_secs_f64(0.04));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = backoff_delay(1, 1.0, 10.0, 1.0, 0.5, &mut rng);
            assert!(d.as_secs_f64() >= 0.5 && d.as_secs_f64() <= 1.5);
        }
    }

    #[test]
    fn same_seed_is_reproducible() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let da = backoff_delay(2, 0.1, 5.0, 2.0, 0.3, &mut a);
        let db = backoff_delay(2, 0.1, 5.0, 2.0, 0.3, &mut b);
        assert_eq!(da, db);
    }
}
