//! spindle-runtime: building blocks for the per-component cooperative loops.
//!
//! Each component runs as a single task owning all of its state, serving a
//! `select!` over its command queue, its sockets, and a [`TimerWheel`]. The
//! helpers here are the pieces those loops share: timers, backoff, RTT step
//! detection, and rate control.

pub mod backoff;
pub mod rate_limit;
pub mod step_detector;
pub mod timer;
pub mod token_bucket;

pub use backoff::ExponentialBackoff;
pub use rate_limit::BucketedRateLimit;
pub use step_detector::StepDetector;
pub use timer::{TimerId, TimerWheel};
pub use token_bucket::TokenBucket;

use rand::Rng;
use tokio::time::Duration;

/// Apply uniform ±`pct` jitter to a duration. Discovery timers use this so
/// that nodes sharing a link do not synchronize their hello bursts.
pub fn jitter(base: Duration, pct: f64) -> Duration {
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * pct;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base_ms + offset).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let j = jitter(base, 0.2);
            assert!(j >= Duration::from_millis(800), "got {:?}", j);
            assert!(j <= Duration::from_millis(1200), "got {:?}", j);
        }
    }

    #[test]
    fn test_jitter_never_zero() {
        let j = jitter(Duration::from_millis(1), 0.9);
        assert!(j >= Duration::from_millis(1));
    }
}
