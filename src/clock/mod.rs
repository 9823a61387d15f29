use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Time source for the engine. All values are milliseconds.
pub trait Clock: Send + Sync {
    /// Wall clock time since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Monotonic time since the clock was created (stands in for uptime).
    fn elapsed_realtime_millis(&self) -> i64;

    /// Wall clock time at which the monotonic clock started.
    fn boot_time_millis(&self) -> i64 {
        self.now_millis() - self.elapsed_realtime_millis()
    }
}

/// System wall clock plus a monotonic clock started at construction.
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn elapsed_realtime_millis(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
    elapsed: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
            elapsed: AtomicI64::new(0),
        }
    }

    pub fn set(&self, now_millis: i64) {
        let prev = self.now.swap(now_millis, Ordering::SeqCst);
        if now_millis > prev {
            self.elapsed.fetch_add(now_millis - prev, Ordering::SeqCst);
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
        self.elapsed.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn elapsed_realtime_millis(&self) -> i64 {
        self.elapsed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        let clock = SystemClock::new();
        assert!(clock.now_millis() > 1_577_836_800_000);
        assert!(clock.elapsed_realtime_millis() >= 0);
        assert!(clock.boot_time_millis() <= clock.now_millis());
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_millis(), 61_000);
        assert_eq!(clock.elapsed_realtime_millis(), 60_000);
        assert_eq!(clock.boot_time_millis(), 1_000);
    }

    #[test]
    fn test_manual_clock_set_backwards_keeps_uptime() {
        let clock = ManualClock::new(10_000);
        clock.set(15_000);
        clock.set(5_000);
        assert_eq!(clock.now_millis(), 5_000);
        assert_eq!(clock.elapsed_realtime_millis(), 5_000);
    }
}
