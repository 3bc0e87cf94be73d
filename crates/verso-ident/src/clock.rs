use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Granularity of the sequence-exhaustion wait on the system clock.
pub const PAUSE: Duration = Duration::from_micros(50);

/// Millisecond wall clock used by the allocator and the lease registry.
///
/// `pause` is the unit of waiting while the allocator waits for the next
/// millisecond; a test clock can advance itself there instead of sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;

    fn pause(&self);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn pause(&self) {
        std::thread::sleep(PAUSE);
    }
}

/// Deterministic clock. Each `pause` advances time by `step_ms`.
pub struct ManualClock {
    millis: AtomicI64,
    step_ms: i64,
}

impl ManualClock {
    /// Clock at `millis` that moves one millisecond per pause.
    pub fn new(millis: i64) -> Self {
        ManualClock { millis: AtomicI64::new(millis), step_ms: 1 }
    }

    /// Clock at `millis` that only moves through `set`/`advance`.
    pub fn frozen(millis: i64) -> Self {
        ManualClock { millis: AtomicI64::new(millis), step_ms: 0 }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.millis.fetch_add(self.step_ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_pause() {
        let clock = ManualClock::new(100);
        clock.pause();
        clock.pause();
        assert_eq!(clock.now_millis(), 102);
        clock.set(5);
        clock.advance(-2);
        assert_eq!(clock.now_millis(), 3);
    }

    #[test]
    fn frozen_clock_ignores_pause() {
        let clock = ManualClock::frozen(7);
        clock.pause();
        assert_eq!(clock.now_millis(), 7);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
