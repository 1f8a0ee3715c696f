//! Local idle accumulator.
//!
//! The agent tracks how long the resource has been continuously idle so the
//! heartbeat can carry it. The daemon keeps its own accumulator and makes
//! every decision; this one is informational and starts fresh on every boot
//! and after the machine resumes from a suspend.

use chrono::{DateTime, Utc};

/// Continuous-idleness tracker.
#[derive(Debug, Clone)]
pub struct IdleAccumulator {
    threshold: f64,
    idle_since: Option<DateTime<Utc>>,
}

impl IdleAccumulator {
    /// A tracker that counts samples scoring below `threshold` as idle.
    /// It starts in the active state.
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self {
            threshold,
            idle_since: None,
        }
    }

    /// Record a sample and return the seconds of continuous idleness.
    pub fn observe(&mut self, score: f64, at: DateTime<Utc>) -> u64 {
        if score >= self.threshold {
            self.idle_since = None;
            return 0;
        }
        let since = *self.idle_since.get_or_insert(at);
        u64::try_from((at - since).num_seconds()).unwrap_or(0)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.idle_since = None;
    }

    /// When the current idle stretch began.
    #[must_use]
    pub const fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn counts_continuous_idleness() {
        let mut idle = IdleAccumulator::new(0.1);
        assert_eq!(idle.observe(0.02, t0()), 0);
        assert_eq!(idle.observe(0.03, t0() + Duration::minutes(5)), 300);
        assert_eq!(idle.observe(0.01, t0() + Duration::minutes(10)), 600);
    }

    #[test]
    fn activity_restarts_the_count() {
        let mut idle = IdleAccumulator::new(0.1);
        idle.observe(0.0, t0());
        assert_eq!(idle.observe(0.6, t0() + Duration::minutes(5)), 0);
        assert!(idle.idle_since().is_none());
        assert_eq!(idle.observe(0.0, t0() + Duration::minutes(6)), 0);
        assert_eq!(idle.observe(0.0, t0() + Duration::minutes(8)), 120);
    }

    #[test]
    fn reset_forgets_history() {
        let mut idle = IdleAccumulator::new(0.1);
        idle.observe(0.0, t0());
        idle.reset();
        assert_eq!(idle.observe(0.0, t0() + Duration::hours(1)), 0);
    }
}
