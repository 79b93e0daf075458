//! Utilities module for httptap
//!
//! This module contains common utilities for logging, metrics, clocks, and
//! connection sampling.

pub mod logger;
pub mod metrics;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// Monotonic millisecond clock.
///
/// Connection bookkeeping (`created_at_ms`, `last_activity_ms`) uses this
/// clock; the wall clock is only used for emitted message timestamps.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide whether a connection is tracked under the configured sample rate.
///
/// The canonical connection id is hashed with the standard fixed-key hasher
/// and the 64-bit result is compared against `rate * 2^64`, so the decision
/// is deterministic for a given id and stable for the connection's lifetime.
/// A rate of 1 or more tracks everything.
pub fn is_sampled(connection_id: &str, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let mut hasher: DefaultHasher = DefaultHasher::new();
    connection_id.hash(&mut hasher);
    (hasher.finish() as f64) < rate * (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_is_deterministic() {
        let id = "10.0.0.1:34567-10.0.0.2:8080";
        let first = is_sampled(id, 0.5);
        for _ in 0..100 {
            assert_eq!(is_sampled(id, 0.5), first);
        }
    }

    #[test]
    fn test_sampling_extremes() {
        assert!(is_sampled("anything", 1.0));
        assert!(is_sampled("anything", 1.5));
        assert!(!is_sampled("anything", 0.0));
    }

    #[test]
    fn test_sampling_rate_roughly_honored() {
        let tracked = (0..1000)
            .filter(|i| is_sampled(&format!("10.0.0.{}:1234-10.0.1.1:80", i), 0.5))
            .count();
        // Loose bounds; we only care that the gate is neither all nor nothing.
        assert!(tracked > 300 && tracked < 700, "tracked = {}", tracked);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
