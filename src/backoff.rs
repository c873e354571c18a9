//! Exponential backoff with jitter for lease acquisition retries.
//!
//! Formula: `min(base * multiplier^attempt, max) + jitter` where jitter is
//! a fraction of the computed backoff.

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff in milliseconds.
    pub base_ms: u64,
    /// Maximum backoff cap in milliseconds.
    pub max_ms: u64,
    /// Exponential growth multiplier per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed backoff (0.0–1.0).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

/// Calculate the next backoff duration for `attempt` (0-indexed).
///
/// Returns `min(base_ms * multiplier^attempt, max_ms)` plus a jitter spread
/// of up to `jitter_fraction` of the computed value — always non-negative.
pub fn next_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let base = config.base_ms as f64;
    let raw = base * config.multiplier.powi(attempt as i32);
    let capped = raw.min(config.max_ms as f64);

    // Deterministic pseudo-jitter derived from the attempt number; spreads
    // concurrent retriers without pulling in a rand dependency.
    let jitter_range = capped * config.jitter_fraction;
    let with_jitter = (capped + pseudo_rand(attempt) * jitter_range).max(0.0);

    Duration::from_millis(with_jitter as u64)
}

/// Async sleep for the computed backoff duration.
pub async fn backoff_sleep(attempt: u32, config: &BackoffConfig) {
    tokio::time::sleep(next_backoff(attempt, config)).await;
}

/// Produce a float in [-0.5, 0.5) using an LCG step seeded by `attempt`.
fn pseudo_rand(attempt: u32) -> f64 {
    // LCG parameters (Numerical Recipes)
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt as u64).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempt() {
        let cfg = BackoffConfig::default();
        let b0 = next_backoff(0, &cfg);
        let b4 = next_backoff(4, &cfg);
        assert!(b4 >= b0, "later attempt should generally back off longer");
    }

    #[test]
    fn backoff_capped_at_max() {
        let cfg = BackoffConfig::default();
        let b = next_backoff(60, &cfg);
        let max_with_jitter = cfg.max_ms + (cfg.max_ms as f64 * cfg.jitter_fraction) as u64;
        assert!(b.as_millis() as u64 <= max_with_jitter);
    }

    #[test]
    fn backoff_never_negative() {
        let cfg = BackoffConfig {
            base_ms: 1,
            max_ms: 10,
            multiplier: 1.0,
            jitter_fraction: 1.0,
        };
        for attempt in 0..50 {
            let _ = next_backoff(attempt, &cfg); // would panic on negative millis
        }
    }

    #[test]
    fn jitter_spreads_attempts() {
        let cfg = BackoffConfig {
            base_ms: 1_000,
            max_ms: 1_000,
            multiplier: 1.0,
            jitter_fraction: 0.5,
        };
        let durations: Vec<u64> = (0..8)
            .map(|a| next_backoff(a, &cfg).as_millis() as u64)
            .collect();
        let all_same = durations.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should vary across attempts: {:?}", durations);
    }
}
