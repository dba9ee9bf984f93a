//! Sliding-window packet rate limiting for the discovery socket.
//!
//! Inbound packets are bucketed by a caller-supplied hash (of interface and
//! source address); each bucket tracks arrivals over the last second and
//! rejects once the configured packets-per-second cap is hit. This runs
//! before parsing, so a flood of garbage costs only a hash and a deque
//! probe.

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct BucketedRateLimit {
    buckets: Vec<VecDeque<Instant>>,
    max_pps: u32,
}

impl BucketedRateLimit {
    pub fn new(num_buckets: usize, max_pps: u32) -> Self {
        assert!(num_buckets > 0);
        Self {
            buckets: (0..num_buckets).map(|_| VecDeque::new()).collect(),
            max_pps,
        }
    }

    /// Record an arrival for `key` and report whether it is within the rate.
    pub fn allow(&mut self, key: u64) -> bool {
        let now = Instant::now();
        let idx = (key % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[idx];

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max_pps as usize {
            return false;
        }
        bucket.push_back(now);
        true
    }
}
