//! Monotonic timestamps used throughout the wire protocol.
//!
//! Every timestamp in this crate is a point on a steady (monotonic) clock,
//! never wall-clock time: wall-clock only ever appears in JSON for
//! human-readable logging. A `TimeVal` survives DST transitions and NTP steps
//! because it is never derived from `SystemTime`.

use std::time::Instant;

/// A `(seconds, microseconds)` pair on the sender's steady clock.
///
/// Addition and subtraction normalize `usec` into `[0, 1_000_000)`, mirroring
/// the wire protocol's `tv` struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeVal {
    pub sec: i32,
    pub usec: i32,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    pub fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }
    }

    /// Builds a `TimeVal` from an elapsed duration relative to some epoch
    /// `Instant`, typically the process-wide steady-clock origin.
    pub fn from_instant(epoch: Instant, now: Instant) -> Self {
        let elapsed = now.saturating_duration_since(epoch);
        Self {
            sec: elapsed.as_secs() as i32,
            usec: elapsed.subsec_micros() as i32,
        }
    }

    /// Total microseconds since the epoch, as an `i64` (safe from overflow
    /// for any duration this crate deals with).
    pub fn as_micros(&self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    /// Milliseconds since the epoch, truncating towards zero.
    pub fn as_millis(&self) -> i64 {
        self.as_micros() / 1000
    }
}

impl std::ops::Add for TimeVal {
    type Output = TimeVal;

    fn add(self, other: TimeVal) -> TimeVal {
        let mut sec = self.sec + other.sec;
        let mut usec = self.usec + other.usec;
        if usec > 1_000_000 {
            sec += usec / 1_000_000;
            usec %= 1_000_000;
        }
        TimeVal { sec, usec }
    }
}

impl std::ops::Sub for TimeVal {
    type Output = TimeVal;

    fn sub(self, other: TimeVal) -> TimeVal {
        let mut sec = self.sec - other.sec;
        let mut usec = self.usec - other.usec;
        while usec < 0 {
            sec -= 1;
            usec += 1_000_000;
        }
        TimeVal { sec, usec }
    }
}

/// Process-wide steady-clock origin, so every `TimeVal` in a process shares
/// the same arbitrary epoch. Readers, sessions, and the client controller all
/// stamp timestamps relative to this.
#[derive(Debug, Clone, Copy)]
pub struct SteadyClock {
    epoch: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn now(&self) -> TimeVal {
        TimeVal::from_instant(self.epoch, Instant::now())
    }

    pub fn at(&self, instant: Instant) -> TimeVal {
        TimeVal::from_instant(self.epoch, instant)
    }
}

impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_normalizes_usec_overflow() {
        let a = TimeVal::new(1, 900_000);
        let b = TimeVal::new(0, 200_000);
        let sum = a + b;
        assert_eq!(sum, TimeVal::new(2, 100_000));
    }

    #[test]
    fn add_without_overflow_is_untouched() {
        let a = TimeVal::new(1, 400_000);
        let b = TimeVal::new(0, 400_000);
        assert_eq!(a + b, TimeVal::new(1, 800_000));
    }

    #[test]
    fn sub_normalizes_negative_usec() {
        let a = TimeVal::new(2, 100_000);
        let b = TimeVal::new(1, 900_000);
        assert_eq!(a - b, TimeVal::new(0, 200_000));
    }

    #[test]
    fn sub_loops_for_multiple_underflows() {
        // Three full seconds of negative usec should borrow three times.
        let a = TimeVal::new(5, 0);
        let b = TimeVal::new(2, 1); // difference: sec=3, usec=-1 -> borrow once
        let result = a - b;
        assert_eq!(result, TimeVal::new(2, 999_999));
    }

    #[test]
    fn as_micros_round_trips_through_millis() {
        let t = TimeVal::new(3, 500_000);
        assert_eq!(t.as_micros(), 3_500_000);
        assert_eq!(t.as_millis(), 3500);
    }
}
