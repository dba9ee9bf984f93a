//! Step detection over a noisy sample stream.
//!
//! Maintains a fast and a slow sliding window over the same samples. A step
//! is declared when the fast average diverges from the slow average by more
//! than a relative threshold AND an absolute threshold, at which point both
//! windows restart from the new level. Used to turn jittery per-packet RTT
//! samples into meaningful RTT-change events.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct StepDetector {
    fast: VecDeque<i64>,
    slow: VecDeque<i64>,
    fast_window: usize,
    slow_window: usize,
    /// Relative divergence required, percent of the slow average.
    threshold_pct: u32,
    /// Absolute divergence required, same unit as the samples.
    abs_threshold: i64,
}

impl StepDetector {
    pub fn new(
        fast_window: usize,
        slow_window: usize,
        threshold_pct: u32,
        abs_threshold: i64,
    ) -> Self {
        assert!(fast_window > 0 && slow_window >= fast_window);
        Self {
            fast: VecDeque::with_capacity(fast_window),
            slow: VecDeque::with_capacity(slow_window),
            fast_window,
            slow_window,
            threshold_pct,
            abs_threshold,
        }
    }

    fn avg(window: &VecDeque<i64>) -> i64 {
        if window.is_empty() {
            return 0;
        }
        window.iter().sum::<i64>() / window.len() as i64
    }

    /// Feed one sample. Returns the new level when a step is detected.
    pub fn add_value(&mut self, value: i64) -> Option<i64> {
        if self.fast.len() == self.fast_window {
            self.fast.pop_front();
        }
        self.fast.push_back(value);

        if self.slow.len() == self.slow_window {
            self.slow.pop_front();
        }
        self.slow.push_back(value);

        // Need the fast window full and the slow window carrying history
        // beyond it, otherwise the averages track each other trivially.
        if self.fast.len() < self.fast_window || self.slow.len() <= self.fast_window {
            return None;
        }

        let fast_avg = Self::avg(&self.fast);
        let slow_avg = Self::avg(&self.slow);
        let diff = (fast_avg - slow_avg).abs();

        if slow_avg != 0
            && diff > self.abs_threshold
            && diff * 100 > i64::from(self.threshold_pct) * slow_avg.abs()
        {
            self.fast.clear();
            self.slow.clear();
            self.fast.push_back(fast_avg);
            self.slow.push_back(fast_avg);
            return Some(fast_avg);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> StepDetector {
        // The production parameters: 10/60 windows, 5%, 500 µs.
        StepDetector::new(10, 60, 5, 500)
    }

    #[test]
    fn test_stable_stream_no_steps() {
        let mut d = detector();
        for _ in 0..200 {
            assert_eq!(d.add_value(10_000), None);
        }
    }

    #[test]
    fn test_small_jitter_no_steps() {
        let mut d = detector();
        for i in 0..200 {
            // ±200 µs of jitter around 10 ms: below the absolute threshold.
            let sample = 10_000 + if i % 2 == 0 { 200 } else { -200 };
            assert_eq!(d.add_value(sample), None);
        }
    }

    #[test]
    fn test_level_shift_detected() {
        let mut d = detector();
        for _ in 0..60 {
            assert_eq!(d.add_value(10_000), None);
        }
        // RTT jumps from 10 ms to 20 ms.
        let mut detected = None;
        for _ in 0..20 {
            if let Some(level) = d.add_value(20_000) {
                detected = Some(level);
                break;
            }
        }
        let level = detected.expect("step must be detected");
        assert!(level > 15_000, "new level {} should be near 20ms", level);
    }

    #[test]
    fn test_large_relative_small_absolute_ignored() {
        // 100 µs -> 300 µs is a 200% change but under the 500 µs absolute
        // threshold, so it must not fire.
        let mut d = detector();
        for _ in 0..60 {
            d.add_value(100);
        }
        for _ in 0..30 {
            assert_eq!(d.add_value(300), None);
        }
    }

    #[test]
    fn test_detector_rearms_after_step() {
        let mut d = detector();
        for _ in 0..60 {
            d.add_value(10_000);
        }
        let mut steps = 0;
        for _ in 0..80 {
            if d.add_value(20_000).is_some() {
                steps += 1;
            }
        }
        for _ in 0..80 {
            if d.add_value(10_000).is_some() {
                steps += 1;
            }
        }
        assert_eq!(steps, 2, "one step up, one step back down");
    }
}
