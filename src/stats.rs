//! Request statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic request counters maintained on the acquisition path.
///
/// Counters use relaxed ordering: they are observability data, not
/// synchronization points.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    penalized: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_penalized(&self) {
        self.penalized.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters with derived rates.
    pub fn snapshot(&self) -> Stats {
        let total = self.total.load(Ordering::Relaxed);
        let allowed = self.allowed.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let penalized = self.penalized.load(Ordering::Relaxed);

        let rate = |n: u64| {
            if total > 0 {
                n as f64 / total as f64
            } else {
                0.0
            }
        };

        Stats {
            total,
            allowed,
            blocked,
            penalized,
            allow_rate: rate(allowed),
            block_rate: rate(blocked),
            penalty_rate: rate(penalized),
        }
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.allowed.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.penalized.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time view of the request counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    /// Requests seen by `try_request`
    pub total: u64,
    /// Requests admitted
    pub allowed: u64,
    /// Requests denied
    pub blocked: u64,
    /// Requests admitted while the key carried penalty points
    pub penalized: u64,
    /// `allowed / total`, zero when no requests were seen
    pub allow_rate: f64,
    /// `blocked / total`, zero when no requests were seen
    pub block_rate: f64,
    /// `penalized / total`, zero when no requests were seen
    pub penalty_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = Counters::new();
        let stats = counters.snapshot();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.allow_rate, 0.0);
        assert_eq!(stats.block_rate, 0.0);
    }

    #[test]
    fn test_rates_derive_from_total() {
        let counters = Counters::new();
        for _ in 0..4 {
            counters.record_request();
        }
        counters.record_allowed();
        counters.record_allowed();
        counters.record_allowed();
        counters.record_blocked();
        counters.record_penalized();

        let stats = counters.snapshot();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.penalized, 1);
        assert_eq!(stats.allow_rate, 0.75);
        assert_eq!(stats.block_rate, 0.25);
        assert_eq!(stats.penalty_rate, 0.25);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let counters = Counters::new();
        counters.record_request();
        counters.record_blocked();
        counters.reset();

        let stats = counters.snapshot();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.blocked, 0);
    }
}
