//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a turn).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    turns_completed: AtomicU64,
    turns_failed: AtomicU64,
    repairs_applied: AtomicU64,
    executions_run: AtomicU64,
    breaker_rejections: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            turns_completed: AtomicU64::new(0),
            turns_failed: AtomicU64::new(0),
            repairs_applied: AtomicU64::new(0),
            executions_run: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
        }
    }

    pub fn inc_turns_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_turns_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_repairs_applied(&self) {
        self.repairs_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions_run(&self) {
        self.executions_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_rejections(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a turn, shutdown) rather
    /// than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            turns_completed = self.turns_completed(),
            turns_failed = self.turns_failed(),
            repairs_applied = self.repairs_applied(),
            executions_run = self.executions_run(),
            breaker_rejections = self.breaker_rejections(),
        );
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed.load(Ordering::Relaxed)
    }

    pub fn turns_failed(&self) -> u64 {
        self.turns_failed.load(Ordering::Relaxed)
    }

    pub fn repairs_applied(&self) -> u64 {
        self.repairs_applied.load(Ordering::Relaxed)
    }

    pub fn executions_run(&self) -> u64 {
        self.executions_run.load(Ordering::Relaxed)
    }

    pub fn breaker_rejections(&self) -> u64 {
        self.breaker_rejections.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.turns_completed.store(0, Ordering::Relaxed);
        self.turns_failed.store(0, Ordering::Relaxed);
        self.repairs_applied.store(0, Ordering::Relaxed);
        self.executions_run.store(0, Ordering::Relaxed);
        self.breaker_rejections.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.turns_completed(), 0);
        m.inc_turns_completed();
        m.inc_turns_completed();
        assert_eq!(m.turns_completed(), 2);

        m.inc_repairs_applied();
        assert_eq!(m.repairs_applied(), 1);

        m.inc_breaker_rejections();
        assert_eq!(m.breaker_rejections(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_turns_completed();
        m.inc_turns_failed();
        m.inc_executions_run();
        m.reset();
        assert_eq!(m.turns_completed(), 0);
        assert_eq!(m.turns_failed(), 0);
        assert_eq!(m.executions_run(), 0);
    }
}
