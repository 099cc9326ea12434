//! Store scheduling for a dirty document.
//!
//! A store fires once the document has been quiet for `delay`, or once
//! `max_delay` has passed since the first unsaved change, whichever comes
//! first. During continuous editing this bounds writes to one per
//! `max_delay`. A failed store keeps the document dirty and is retried after
//! `retry_backoff`.
//!
//! The [`Debouncer`] only does the bookkeeping. The hub owns the timer and
//! the store task.

use std::time::Duration;
use tokio::time::Instant;

/// Debounce tuning.
#[derive(Debug, Clone)]
pub struct DebouncePolicy {
    /// Quiet period before a store (default: 5s).
    pub delay: Duration,
    /// Upper bound between first unsaved change and its store (default: 60s).
    pub max_delay: Duration,
    /// Wait after a failed store before retrying (default: 2s).
    pub retry_backoff: Duration,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl DebouncePolicy {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
pub struct Debouncer {
    policy: DebouncePolicy,
    /// First change not covered by a started store.
    first_dirty: Option<Instant>,
    last_change: Option<Instant>,
    /// `first_dirty` of the store in flight, restored if it fails.
    flushing_since: Option<Instant>,
    in_flight: bool,
    retry_at: Option<Instant>,
    failures: u32,
}

impl Debouncer {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            first_dirty: None,
            last_change: None,
            flushing_since: None,
            in_flight: false,
            retry_at: None,
            failures: 0,
        }
    }

    pub fn mark_dirty(&mut self, now: Instant) {
        self.first_dirty.get_or_insert(now);
        self.last_change = Some(now);
    }

    /// Unsaved changes exist that no store has picked up yet.
    pub fn is_dirty(&self) -> bool {
        self.first_dirty.is_some()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Consecutive failed stores.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// When the next store should start; `None` while clean or while a
    /// store is already running.
    pub fn deadline(&self) -> Option<Instant> {
        if self.in_flight {
            return None;
        }
        let first = self.first_dirty?;
        let due = match self.last_change {
            Some(last) => (last + self.policy.delay).min(first + self.policy.max_delay),
            // Only a failed store left this dirty.
            None => first,
        };
        Some(self.retry_at.map_or(due, |retry| due.max(retry)))
    }

    /// A store of the current state has started.
    pub fn begin_flush(&mut self, _now: Instant) {
        self.in_flight = true;
        self.flushing_since = self.first_dirty.take();
        self.last_change = None;
        self.retry_at = None;
    }

    /// The store started by [`begin_flush`](Self::begin_flush) finished.
    pub fn finish_flush(&mut self, now: Instant, ok: bool) {
        self.in_flight = false;
        let flushed = self.flushing_since.take();
        if ok {
            self.failures = 0;
            return;
        }

        self.failures += 1;
        self.first_dirty = match (flushed, self.first_dirty) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.retry_at = Some(now + self.policy.retry_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(delay: u64, max_delay: u64) -> DebouncePolicy {
        DebouncePolicy {
            delay: Duration::from_secs(delay),
            max_delay: Duration::from_secs(max_delay),
            retry_backoff: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_clean_has_no_deadline() {
        let d = Debouncer::new(DebouncePolicy::default());
        assert!(!d.is_dirty());
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn test_quiet_period_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 60));
        d.mark_dirty(t0);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(5)));
        d.mark_dirty(t0 + Duration::from_secs(3));
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(8)));
    }

    #[test]
    fn test_max_delay_caps_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 10));
        d.mark_dirty(t0);
        d.mark_dirty(t0 + Duration::from_secs(8));
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_no_deadline_while_in_flight() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 60));
        d.mark_dirty(t0);
        d.begin_flush(t0 + Duration::from_secs(5));
        d.mark_dirty(t0 + Duration::from_secs(6));
        assert_eq!(d.deadline(), None);
        d.finish_flush(t0 + Duration::from_secs(7), true);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_failure_keeps_dirty_and_backs_off() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 60));
        d.mark_dirty(t0);
        d.begin_flush(t0 + Duration::from_secs(5));
        assert!(!d.is_dirty());
        d.finish_flush(t0 + Duration::from_secs(6), false);

        assert!(d.is_dirty());
        assert_eq!(d.failures(), 1);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(8)));

        d.begin_flush(t0 + Duration::from_secs(8));
        d.finish_flush(t0 + Duration::from_secs(9), true);
        assert!(!d.is_dirty());
        assert_eq!(d.failures(), 0);
    }

    #[test]
    fn test_edit_after_failure_restarts_quiet_period() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 60));
        d.mark_dirty(t0);
        d.begin_flush(t0 + Duration::from_secs(5));
        d.finish_flush(t0 + Duration::from_secs(6), false);
        d.mark_dirty(t0 + Duration::from_secs(7));
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(12)));

        // Changes made while the failed store ran also wait for the quiet period.
        let mut d = Debouncer::new(policy(5, 60));
        d.mark_dirty(t0);
        d.begin_flush(t0 + Duration::from_secs(5));
        d.mark_dirty(t0 + Duration::from_secs(5));
        d.finish_flush(t0 + Duration::from_secs(6), false);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_continuous_activity_bounded_by_max_delay() {
        // One change per second for 150s, d = 5s, M = 60s.
        let t0 = Instant::now();
        let mut d = Debouncer::new(policy(5, 60));
        let step = Duration::from_millis(100);
        let active_for = Duration::from_secs(150);

        let mut stores_while_active = 0;
        let mut stores_total = 0;
        for i in 0..2000u32 {
            let now = t0 + step * i;
            let elapsed = now - t0;
            if elapsed <= active_for && i % 10 == 0 {
                d.mark_dirty(now);
            }
            if d.deadline().is_some_and(|at| at <= now) {
                d.begin_flush(now);
                d.finish_flush(now, true);
                stores_total += 1;
                if elapsed <= active_for {
                    stores_while_active += 1;
                }
            }
        }

        // ceil(150 / 60) = 3
        assert!(stores_while_active <= 3);
        assert_eq!(stores_total, 3);
        assert!(!d.is_dirty());
    }
}
