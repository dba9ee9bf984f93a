//! Exponential backoff with explicit error/success reporting.

use tokio::time::{Duration, Instant};

/// Tracks how long a caller must wait before retrying an operation.
///
/// `report_error` starts (or extends) a wait and doubles the next one, up to
/// the cap; `report_success` resets. The same type also paces periodic work:
/// constructing with `initial == max` gives a fixed-period gate.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    /// The wait applied by the next `report_error`.
    current: Duration,
    wait_until: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            wait_until: None,
        }
    }

    /// Whether the caller may try now.
    pub fn can_try_now(&self) -> bool {
        self.time_remaining_until_retry().is_zero()
    }

    /// Time left before the next attempt is allowed.
    pub fn time_remaining_until_retry(&self) -> Duration {
        match self.wait_until {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Record a failed (or just completed) attempt: wait `current`, then
    /// double it up to the cap.
    pub fn report_error(&mut self) {
        self.wait_until = Some(Instant::now() + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset to the initial state.
    pub fn report_success(&mut self) {
        self.current = self.initial;
        self.wait_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_to_cap() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert!(b.can_try_now());

        b.report_error();
        assert!(!b.can_try_now());
        assert_eq!(b.time_remaining_until_retry(), Duration::from_millis(100));

        advance(Duration::from_millis(100)).await;
        assert!(b.can_try_now());

        b.report_error(); // waits 200
        advance(Duration::from_millis(150)).await;
        assert!(!b.can_try_now());
        advance(Duration::from_millis(50)).await;
        assert!(b.can_try_now());

        b.report_error(); // waits 350 (capped)
        assert_eq!(b.time_remaining_until_retry(), Duration::from_millis(350));

        b.report_error(); // still capped
        assert_eq!(b.time_remaining_until_retry(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        b.report_error();
        b.report_error();
        b.report_success();
        assert!(b.can_try_now());
        b.report_error();
        assert_eq!(b.time_remaining_until_retry(), Duration::from_millis(100));
    }
}
