//! Token bucket for outbound flood rate control.

use tokio::time::{Duration, Instant};

/// Classic token bucket: `burst` capacity, refilled at `rate_per_sec`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(burst: u32, rate_per_sec: u32) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_sec),
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token will be available.
    pub fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_empty() {
        let mut bucket = TokenBucket::new(3, 10);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume(), "burst exhausted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_at_rate() {
        let mut bucket = TokenBucket::new(1, 10); // one token per 100ms
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        advance(Duration::from_millis(100)).await;
        assert!(bucket.try_consume());

        advance(Duration::from_millis(50)).await;
        assert!(!bucket.try_consume());
        let wait = bucket.time_until_available();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(51));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_burst() {
        let mut bucket = TokenBucket::new(2, 1000);
        advance(Duration::from_secs(60)).await;
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }
}
