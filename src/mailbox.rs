//! A single-slot cell handing the latest value from a producer thread to a consumer.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::clock::Timestamp;
use crate::hand::DetectionResult;

/// Mailbox holding the most recent hand detection result.
pub type DetectionMailbox = Mailbox<DetectionResult>;

/// A value stored in a [`Mailbox`], together with the timestamp it belongs to.
pub struct Latest<T> {
    value: Arc<T>,
    timestamp: Timestamp,
}

impl<T> Latest<T> {
    /// Returns the stored value.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Returns the timestamp passed to [`Mailbox::set`] alongside the value.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns how old this value is at time `now`.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Latest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latest")
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Single-slot, overwrite-on-write storage for the latest value of a stream.
///
/// Every [`Mailbox::set`] replaces the stored value wholesale; there is no queue and writers never
/// wait for readers. [`Mailbox::get`] returns a snapshot that stays valid (and unchanged) while
/// newer values are written.
///
/// Cloning a [`Mailbox`] returns another handle to the same slot.
pub struct Mailbox<T> {
    slot: Arc<Mutex<Option<Latest<T>>>>,
}

impl<T> Mailbox<T> {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Stores `value`, replacing whatever was stored before.
    pub fn set(&self, value: T, timestamp: Timestamp) {
        let latest = Latest {
            value: Arc::new(value),
            timestamp,
        };
        // The previous value is dropped after the lock is released.
        let _previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(latest);
    }

    /// Returns the most recently stored value, or [`None`] if nothing was stored yet.
    pub fn get(&self) -> Option<Latest<T>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stored = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|latest| latest.timestamp);
        f.debug_struct("Mailbox").field("stored", &stored).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn empty_before_first_set() {
        let mailbox = Mailbox::<u32>::new();
        assert!(mailbox.get().is_none());
    }

    #[test]
    fn set_overwrites() {
        let mailbox = Mailbox::new();
        mailbox.set(1, Timestamp::from_millis(10));
        mailbox.set(2, Timestamp::from_millis(20));

        let latest = mailbox.get().unwrap();
        assert_eq!(*latest.value(), 2);
        assert_eq!(latest.timestamp(), Timestamp::from_millis(20));

        // `get` does not consume the value.
        assert_eq!(*mailbox.get().unwrap().value(), 2);
    }

    #[test]
    fn snapshot_survives_later_writes() {
        let mailbox = Mailbox::new();
        mailbox.set(String::from("old"), Timestamp::from_millis(1));
        let snapshot = mailbox.get().unwrap();
        mailbox.set(String::from("new"), Timestamp::from_millis(2));

        assert_eq!(snapshot.value(), "old");
        assert_eq!(mailbox.get().unwrap().value(), "new");
    }

    #[test]
    fn handles_share_slot() {
        let writer = Mailbox::new();
        let reader = writer.clone();
        thread::spawn(move || writer.set(7u8, Timestamp::from_millis(3)))
            .join()
            .unwrap();
        assert_eq!(*reader.get().unwrap().value(), 7);
    }

    #[test]
    fn age() {
        let mailbox = Mailbox::new();
        mailbox.set((), Timestamp::from_millis(1_000));
        let latest = mailbox.get().unwrap();
        assert_eq!(
            latest.age_at(Timestamp::from_millis(1_040)),
            Duration::from_millis(40)
        );
        assert_eq!(latest.age_at(Timestamp::from_millis(900)), Duration::ZERO);
    }
}
