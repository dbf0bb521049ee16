//! Per-endpoint login attempt history with a sliding failure window.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoginAttempt {
    pub timestamp: u64,
    pub success: bool,
}

#[derive(Debug)]
pub struct AttemptTracker {
    history: HashMap<String, VecDeque<LoginAttempt>>,
    window_ms: u64,
    max_failed: usize,
    per_endpoint: usize,
}

impl AttemptTracker {
    pub fn new(window_ms: u64, max_failed: usize, per_endpoint: usize) -> Self {
        Self {
            history: HashMap::new(),
            window_ms,
            max_failed,
            per_endpoint: per_endpoint.max(max_failed).max(1),
        }
    }

    fn in_window(&self, attempt: &LoginAttempt, now: u64) -> bool {
        now.saturating_sub(attempt.timestamp) < self.window_ms
    }

    /// Successful logins are remembered too; they never clear failures.
    pub fn record(&mut self, endpoint: &str, now: u64, success: bool) {
        let cap = self.per_endpoint;
        let attempts = self.history.entry(endpoint.to_string()).or_default();
        attempts.push_back(LoginAttempt {
            timestamp: now,
            success,
        });
        while attempts.len() > cap {
            attempts.pop_front();
        }
    }

    pub fn failures_in_window(&self, endpoint: &str, now: u64) -> usize {
        self.history.get(endpoint).map_or(0, |attempts| {
            attempts
                .iter()
                .filter(|a| !a.success && self.in_window(a, now))
                .count()
        })
    }

    pub fn is_limited(&self, endpoint: &str, now: u64) -> bool {
        self.failures_in_window(endpoint, now) >= self.max_failed
    }

    /// Forgets attempts that left the window; drops empty endpoints.
    pub fn prune(&mut self, now: u64) -> usize {
        let window = self.window_ms;
        let mut removed = 0;
        self.history.retain(|_, attempts| {
            let before = attempts.len();
            attempts.retain(|a| now.saturating_sub(a.timestamp) < window);
            removed += before - attempts.len();
            !attempts.is_empty()
        });
        removed
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 15 * 60 * 1000;

    #[test]
    fn test_limit_counts_only_failures_in_window() {
        let mut tracker = AttemptTracker::new(WINDOW, 3, 32);
        tracker.record("1.2.3.4", 0, false);
        tracker.record("1.2.3.4", 10, true);
        tracker.record("1.2.3.4", 20, false);
        assert!(!tracker.is_limited("1.2.3.4", 30));

        tracker.record("1.2.3.4", 30, false);
        assert!(tracker.is_limited("1.2.3.4", 30));
        assert!(!tracker.is_limited("5.6.7.8", 30));

        // The failure at t=0 leaves the window.
        assert_eq!(tracker.failures_in_window("1.2.3.4", WINDOW + 1), 2);
        assert!(!tracker.is_limited("1.2.3.4", WINDOW + 1));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = AttemptTracker::new(WINDOW, 2, 4);
        for t in 0..10 {
            tracker.record("ep", t, false);
        }
        assert_eq!(tracker.failures_in_window("ep", 10), 4);
    }

    #[test]
    fn test_prune_drops_aged_endpoints() {
        let mut tracker = AttemptTracker::new(WINDOW, 5, 32);
        tracker.record("old", 0, false);
        tracker.record("new", WINDOW, false);

        assert_eq!(tracker.prune(WINDOW + 5), 1);
        assert_eq!(tracker.tracked_endpoints(), 1);
    }
}
