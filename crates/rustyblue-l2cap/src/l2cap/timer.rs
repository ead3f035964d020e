//! Timeout scheduling for connections and signaling commands
//!
//! The queue never calls back into the engine. It only remembers deadlines;
//! the engine asks it which ones have passed and then looks the target up
//! again. Handles are never reused, so a target that was destroyed (or
//! re-armed) in the meantime simply no longer stores the fired handle and
//! the expiry is ignored.

use std::collections::BTreeMap;
use std::time::Instant;

use super::connection::ConnectionId;
use super::signaling::SignalId;

/// Handle to one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a timer is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Link establishment or idle disconnect of a connection
    Connection(ConnectionId),
    /// Response timeout of a signaling command
    Command(ConnectionId, SignalId),
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    target: TimerTarget,
}

/// One-shot timers keyed by handle
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    armed: BTreeMap<TimerHandle, TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `target` to fire at `deadline`
    pub fn arm(&mut self, target: TimerTarget, deadline: Instant) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        self.armed.insert(handle, TimerEntry { deadline, target });
        handle
    }

    /// Cancel a timer. Returns whether it was still armed; cancelling a
    /// fired or already cancelled timer does nothing.
    pub fn disarm(&mut self, handle: TimerHandle) -> bool {
        self.armed.remove(&handle).is_some()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().map(|entry| entry.deadline).min()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first (ties in arming order).
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerHandle, TimerTarget)> {
        let mut fired: Vec<(Instant, TimerHandle, TimerTarget)> = self
            .armed
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(handle, entry)| (entry.deadline, *handle, entry.target))
            .collect();
        fired.sort_by_key(|(deadline, handle, _)| (*deadline, *handle));

        for (_, handle, _) in &fired {
            self.armed.remove(handle);
        }

        fired
            .into_iter()
            .map(|(_, handle, target)| (handle, target))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expired_fires_once_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        let con = ConnectionId(1);

        let late = timers.arm(TimerTarget::Connection(con), start + Duration::from_secs(10));
        let early = timers.arm(TimerTarget::Command(con, 3), start + Duration::from_secs(5));

        assert!(timers.expired(start).is_empty());
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(5)));

        let fired = timers.expired(start + Duration::from_secs(10));
        assert_eq!(
            fired,
            vec![
                (early, TimerTarget::Command(con, 3)),
                (late, TimerTarget::Connection(con)),
            ]
        );
        assert!(timers.expired(start + Duration::from_secs(20)).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_disarm_is_idempotent() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        let handle = timers.arm(TimerTarget::Connection(ConnectionId(7)), start);

        assert!(timers.disarm(handle));
        assert!(!timers.disarm(handle));
        assert!(!timers.is_armed(handle));
        assert!(timers.expired(start + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_disarm_after_fire_is_noop() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        let handle = timers.arm(TimerTarget::Connection(ConnectionId(7)), start);
        assert_eq!(timers.expired(start).len(), 1);
        assert!(!timers.disarm(handle));
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        let first = timers.arm(TimerTarget::Connection(ConnectionId(1)), start);
        timers.disarm(first);
        let second = timers.arm(TimerTarget::Connection(ConnectionId(1)), start);
        assert_ne!(first, second);
    }
}
