//! Monotonic clocks and fixed-cadence tick accounting

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Monotonic time source, measured from an arbitrary origin
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Tokio's clock; follows paused and advanced time in tests
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Catch-up tick accounting against a clock
///
/// `last` is the time of the last processed tick. Every tick whose deadline
/// has passed is handed out one at a time, so a late wakeup runs the missed
/// ticks back to back instead of drifting.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    last: Duration,
}

impl Ticker {
    pub fn new(period: Duration, start: Duration) -> Self {
        Self { period, last: start }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn last(&self) -> Duration {
        self.last
    }

    /// Claim the next tick if its deadline has passed
    pub fn next_due(&mut self, now: Duration) -> bool {
        let deadline = self.last + self.period;
        if deadline <= now {
            self.last = deadline;
            true
        } else {
            false
        }
    }

    /// Time since the last processed tick
    pub fn behind(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last)
    }

    /// Jump to `now`, returning how many whole ticks were skipped
    pub fn skip_to(&mut self, now: Duration) -> u64 {
        let skipped = self.behind(now).as_nanos() / self.period.as_nanos().max(1);
        self.last = now;
        u64::try_from(skipped).unwrap_or(u64::MAX)
    }

    /// Time until the next deadline
    pub fn until_next(&self, now: Duration) -> Duration {
        (self.last + self.period).saturating_sub(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn test_catch_up_runs_every_missed_tick() {
        let mut ticker = Ticker::new(TICK, Duration::ZERO);
        let mut ticks = 0;
        while ticker.next_due(Duration::from_millis(35)) {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
        assert_eq!(ticker.last(), Duration::from_millis(30));
        assert_eq!(ticker.until_next(Duration::from_millis(35)), Duration::from_millis(5));
    }

    #[test]
    fn test_skip_to() {
        let mut ticker = Ticker::new(TICK, Duration::ZERO);
        assert_eq!(ticker.skip_to(Duration::from_millis(254)), 25);
        assert!(!ticker.next_due(Duration::from_millis(260)));
        assert!(ticker.next_due(Duration::from_millis(264)));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        shared.advance(TICK);
        assert_eq!(clock.now(), TICK);
    }
}
