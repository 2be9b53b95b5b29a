//! Exponential backoff shared by link flap dampening, peer reconnects and
//! platform retries.

use std::time::{Duration, Instant};

/// Doubling backoff between `initial` and `max`, with reset on quiescence:
/// once a full `max` interval passes without a new failure, the next
/// failure starts over at `initial`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    last_event: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            current: Duration::ZERO,
            last_event: None,
        }
    }

    /// Register a failure (or flap) and return how long to hold off.
    pub fn bump(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_event {
            if now.saturating_duration_since(last) >= self.max {
                self.current = Duration::ZERO;
            }
        }
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            (self.current * 2).min(self.max)
        };
        self.last_event = Some(now);
        self.current
    }

    /// Current hold-off without registering a new event.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Instant until which publishes should be withheld, if any.
    pub fn hold_until(&self) -> Option<Instant> {
        match (self.last_event, self.current.is_zero()) {
            (Some(last), false) => Some(last + self.current),
            _ => None,
        }
    }

    /// Whether the hold-off window has passed.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.hold_until().map(|t| now >= t).unwrap_or(true)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
        self.last_event = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_max() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(8));
        let t0 = Instant::now();
        assert_eq!(b.bump(t0), Duration::from_millis(1));
        assert_eq!(b.bump(t0), Duration::from_millis(2));
        assert_eq!(b.bump(t0), Duration::from_millis(4));
        assert_eq!(b.bump(t0), Duration::from_millis(8));
        assert_eq!(b.bump(t0), Duration::from_millis(8));
    }

    #[test]
    fn test_resets_after_quiet_max_interval() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(8));
        let t0 = Instant::now();
        b.bump(t0);
        b.bump(t0);
        b.bump(t0);
        assert_eq!(b.current(), Duration::from_millis(4));
        // quiet for a full max interval
        let later = t0 + Duration::from_millis(9);
        assert_eq!(b.bump(later), Duration::from_millis(1));
    }

    #[test]
    fn test_hold_until() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(80));
        assert!(b.hold_until().is_none());
        let t0 = Instant::now();
        b.bump(t0);
        assert_eq!(b.hold_until(), Some(t0 + Duration::from_millis(10)));
        assert!(!b.is_idle(t0));
        assert!(b.is_idle(t0 + Duration::from_millis(10)));
    }
}
