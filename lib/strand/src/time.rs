use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic tick source. One tick is 10 ms; the wall clock is sampled once
/// at construction so tick counts can be converted back to wall time without
/// being disturbed by clock adjustments.
pub struct TickClock {
    origin: Instant,
    origin_secs: u64,
}

impl TickClock {
    pub const TICK_MILLIS: u64 = 10;
    pub const TICKS_PER_SEC: u64 = 1000 / Self::TICK_MILLIS;

    #[inline]
    pub fn new() -> TickClock {
        TickClock {
            origin: Instant::now(),
            origin_secs: timestamp_secs(),
        }
    }

    /// Wall-clock second the clock was started (STARTTIME).
    #[inline]
    pub fn origin_secs(&self) -> u64 {
        self.origin_secs
    }

    /// Ticks elapsed since start. Monotonic across wall-clock anomalies.
    #[inline]
    pub fn elapsed_ticks(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_millis() as u64 / Self::TICK_MILLIS
    }

    /// High-precision monotonic counter in nanoseconds.
    #[inline]
    pub fn hpc_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ticks_advance() {
        let clock = TickClock::new();
        let before = clock.elapsed_ticks();
        thread::sleep(Duration::from_millis(30));
        let after = clock.elapsed_ticks();
        assert!(after >= before + 2, "expected >= 2 ticks, got {}", after - before);
    }

    #[test]
    fn test_hpc_monotonic() {
        let clock = TickClock::new();
        let a = clock.hpc_ns();
        let b = clock.hpc_ns();
        assert!(b >= a);
    }
}
