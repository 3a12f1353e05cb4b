//! Per-source timeout circuit breaker
//!
//! Failures are timestamped into a window. When `t_count` failures accumulate
//! within `t_duration`, the breaker opens and the source is skipped. Once
//! `t_duration` has passed since the first failure in the window, the window
//! is cleared and the source is tried again. A success clears it as well.

use crate::audit;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub t_count: usize,
    pub t_duration: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            t_count: 3,
            t_duration: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct Window {
    failures: VecDeque<Instant>,
    open: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            window: Mutex::new(Window::default()),
        }
    }

    /// Whether the source may be dispatched right now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.expire(&mut window, now);
        !window.open
    }

    pub fn record_success(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let was_open = window.open;
        window.failures.clear();
        window.open = false;
        if was_open {
            audit::breaker_closed(&self.name);
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.expire(&mut window, now);
        window.failures.push_back(now);
        if !window.open && window.failures.len() >= self.policy.t_count {
            window.open = true;
            audit::breaker_opened(
                &self.name,
                window.failures.len(),
                self.policy.t_duration.as_secs_f64(),
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> BreakerState {
        if self.allow_at(now) {
            BreakerState::Closed
        } else {
            BreakerState::Open
        }
    }

    /// Clear the window once `t_duration` has elapsed since its first failure.
    fn expire(&self, window: &mut Window, now: Instant) {
        let Some(&first) = window.failures.front() else {
            return;
        };
        if now.saturating_duration_since(first) >= self.policy.t_duration {
            let was_open = window.open;
            window.failures.clear();
            window.open = false;
            if was_open {
                audit::breaker_closed(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(t_count: usize, secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerPolicy {
                t_count,
                t_duration: Duration::from_secs(secs),
            },
        )
    }

    #[test]
    fn test_opens_after_t_count_failures_in_window() {
        let b = breaker(2, 10);
        let t0 = Instant::now();
        assert!(b.allow_at(t0));
        b.record_failure_at(t0);
        assert!(b.allow_at(t0 + Duration::from_secs(1)));
        b.record_failure_at(t0 + Duration::from_secs(2));
        assert!(!b.allow_at(t0 + Duration::from_secs(3)));
        assert_eq!(b.state_at(t0 + Duration::from_secs(3)), BreakerState::Open);
    }

    #[test]
    fn test_closes_after_window() {
        let b = breaker(2, 10);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        b.record_failure_at(t0 + Duration::from_secs(1));
        assert!(!b.allow_at(t0 + Duration::from_secs(9)));
        assert!(b.allow_at(t0 + Duration::from_secs(10)));
        // the window restarted: a single new failure does not reopen
        b.record_failure_at(t0 + Duration::from_secs(11));
        assert!(b.allow_at(t0 + Duration::from_secs(12)));
    }

    #[test]
    fn test_spread_out_failures_do_not_open() {
        let b = breaker(2, 10);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        b.record_failure_at(t0 + Duration::from_secs(15));
        assert!(b.allow_at(t0 + Duration::from_secs(16)));
    }

    #[test]
    fn test_success_resets() {
        let b = breaker(2, 10);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        b.record_success();
        b.record_failure_at(t0 + Duration::from_secs(1));
        assert!(b.allow_at(t0 + Duration::from_secs(2)));
    }
}
