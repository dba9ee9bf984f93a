//! A deadline queue for component loops.
//!
//! Millisecond-resolution timers over a binary heap: O(log n) insertion,
//! unbounded entries, id-based cancellation. Timer tokens carry plain
//! identifiers (interface names, node names) rather than closures, so a
//! timer firing after its subject is gone resolves to a no-op in the
//! handler instead of keeping the subject alive.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::{sleep_until, Duration, Instant};

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    id: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The timer queue. `T` is the token delivered when a timer fires.
#[derive(Debug)]
pub struct TimerWheel<T> {
    heap: BinaryHeap<Reverse<Entry>>,
    tokens: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tokens: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `token` to fire after `delay`.
    pub fn schedule(&mut self, delay: Duration, token: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            id,
        }));
        self.tokens.insert(id, token);
        TimerId(id)
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.tokens.remove(&id.0).is_some()
    }

    /// Number of pending (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Drop all pending timers.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.tokens.clear();
    }

    /// Wait for the next timer to fire and return its token. Pends forever
    /// while the wheel is empty; cancel-safe, so it can sit in a `select!`
    /// arm.
    pub async fn expired(&mut self) -> T {
        loop {
            // Drop heap entries whose timers were cancelled.
            while let Some(Reverse(head)) = self.heap.peek() {
                if self.tokens.contains_key(&head.id) {
                    break;
                }
                self.heap.pop();
            }

            let Some(Reverse(head)) = self.heap.peek() else {
                return std::future::pending().await;
            };

            sleep_until(head.deadline).await;
            let Reverse(entry) = self.heap.pop().expect("peeked entry present");
            if let Some(token) = self.tokens.remove(&entry.id) {
                return token;
            }
            // Cancelled while sleeping; try the next entry.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(Duration::from_millis(300), "late");
        wheel.schedule(Duration::from_millis(100), "early");
        wheel.schedule(Duration::from_millis(200), "middle");

        assert_eq!(wheel.expired().await, "early");
        assert_eq!(wheel.expired().await, "middle");
        assert_eq!(wheel.expired().await, "late");
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let mut wheel = TimerWheel::new();
        let id = wheel.schedule(Duration::from_millis(50), "cancelled");
        wheel.schedule(Duration::from_millis(100), "kept");

        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id), "double cancel must report false");
        assert_eq!(wheel.expired().await, "kept");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_deadline_fifo() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(Duration::from_millis(10), 1);
        wheel.schedule(Duration::from_millis(10), 2);
        assert_eq!(wheel.expired().await, 1);
        assert_eq!(wheel.expired().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_wheel_pends() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        let fired = tokio::time::timeout(Duration::from_secs(3600), wheel.expired()).await;
        assert!(fired.is_err(), "empty wheel must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_len_tracks_cancellation() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(Duration::from_secs(1), ());
        wheel.schedule(Duration::from_secs(2), ());
        assert_eq!(wheel.len(), 2);
        wheel.cancel(a);
        assert_eq!(wheel.len(), 1);
        wheel.clear();
        assert!(wheel.is_empty());
    }
}
