//! Monotonic microsecond timestamps shared by every shard.

use std::time::Instant;

/// A monotonic clock anchored at process start.
///
/// All timestamps produced by this type are microseconds elapsed since the
/// clock was created, which keeps them representable as `u64` for the
/// lifetime of any realistic run while still being cheap to compare across
/// threads (no shared state, just `Instant::elapsed`).
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

/// Sentinel for "reserved but not yet sent" (see `QuerySlot::timestamp`).
pub const TIMESTAMP_PENDING: u64 = u64::MAX;

impl Clock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since this clock started.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Converts a relative `micros` offset (typically `stop_time - now`,
    /// which is `u64::MAX`-ish when no `--time-limit` was given) into an
    /// absolute deadline, saturating instead of overflowing so an unbounded
    /// run still produces a valid (if effectively unreachable) `Instant`.
    pub fn deadline_after_us(&self, micros: u64) -> std::time::Instant {
        let elapsed = self.now().saturating_add(micros);
        self.epoch + std::time::Duration::from_micros(elapsed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn now_is_monotonically_increasing() {
        let clock = Clock::start();
        let a = clock.now();
        sleep(Duration::from_millis(1));
        let b = clock.now();

        assert!(b > a);
    }
}
