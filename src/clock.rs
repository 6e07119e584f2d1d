//! Millisecond timestamps for frames submitted to a streaming detector.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A point in time, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the wall-clock time as a [`Timestamp`].
    ///
    /// A system clock set before 1970 reads as the epoch.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(since_epoch.as_millis() as u64)
    }

    /// Returns the time elapsed between `earlier` and `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Hands out strictly increasing [`Timestamp`]s derived from wall-clock time.
///
/// Streaming detectors reject repeated timestamps, but a capture loop can easily run more than
/// once per millisecond, and the wall clock may be adjusted backwards. If the wall clock has not
/// advanced past the previous timestamp, the previous timestamp plus one millisecond is used.
#[derive(Debug, Default)]
pub struct StreamClock {
    last: Option<Timestamp>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next timestamp, based on the current wall-clock time.
    pub fn next(&mut self) -> Timestamp {
        self.next_at(Timestamp::now())
    }

    /// Returns the next timestamp, treating `wall` as the current wall-clock time.
    pub fn next_at(&mut self, wall: Timestamp) -> Timestamp {
        let ts = match self.last {
            Some(last) if wall <= last => Timestamp(last.0 + 1),
            _ => wall,
        };
        self.last = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_wall_clock() {
        let mut clock = StreamClock::new();
        assert_eq!(clock.next_at(Timestamp(100)), Timestamp(100));
        assert_eq!(clock.next_at(Timestamp(133)), Timestamp(133));
    }

    #[test]
    fn strictly_increasing_when_wall_clock_stalls() {
        let mut clock = StreamClock::new();
        assert_eq!(clock.next_at(Timestamp(100)), Timestamp(100));
        assert_eq!(clock.next_at(Timestamp(100)), Timestamp(101));
        assert_eq!(clock.next_at(Timestamp(100)), Timestamp(102));
        // Clock jumped backwards.
        assert_eq!(clock.next_at(Timestamp(50)), Timestamp(103));
        assert_eq!(clock.next_at(Timestamp(200)), Timestamp(200));
    }

    #[test]
    fn duration_since() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(1_250);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(250));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }
}
