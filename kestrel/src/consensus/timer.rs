// Copyright (c) 2025 Kestrel Foundation

//! Cooperative timers with watermark invalidation.
//!
//! Scheduling a timer for a `(slot, kind)` bumps that pair's watermark;
//! an already-queued entry fires only if its id still matches the
//! watermark, so a newer `setup` silently supersedes older ones and a
//! zero timeout cancels everything outstanding for the pair.

use kestrel_consensus_scp::SlotIndex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// The kinds of driver timers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TimerKind {
    /// Kick off (or retry) nomination for a slot.
    Nominate,
    /// Probe peers for blocks past our tip.
    Catchup,
}

struct TimerEntry {
    id: u64,
    slot: SlotIndex,
    kind: TimerKind,
    deadline: Instant,
}

/// A set of pending timers, polled from the event loop.
#[derive(Default)]
pub struct TimerSet {
    watermarks: HashMap<(SlotIndex, TimerKind), u64>,
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` for `slot`. A `None` or zero timeout cancels all
    /// outstanding timers of that `(slot, kind)` instead.
    pub fn setup(&mut self, slot: SlotIndex, kind: TimerKind, timeout: Option<Duration>) {
        self.next_id += 1;
        let id = self.next_id;
        self.watermarks.insert((slot, kind), id);
        match timeout {
            Some(t) if !t.is_zero() => {
                self.entries.push(TimerEntry {
                    id,
                    slot,
                    kind,
                    deadline: Instant::now() + t,
                });
            }
            _ => {
                // Watermark bumped; stale entries die on poll.
                self.entries.retain(|e| !(e.slot == slot && e.kind == kind));
            }
        }
    }

    /// Fire due timers whose id still matches the watermark.
    pub fn poll(&mut self, now: Instant) -> Vec<(SlotIndex, TimerKind)> {
        let mut fired = Vec::new();
        self.entries.retain(|entry| {
            let current = self.watermarks.get(&(entry.slot, entry.kind)).copied();
            if current != Some(entry.id) {
                // Superseded; drop silently.
                return false;
            }
            if now < entry.deadline {
                return true;
            }
            fired.push((entry.slot, entry.kind));
            false
        });
        fired
    }

    /// Drop everything at shutdown or when jumping slots.
    pub fn cancel_all(&mut self) {
        self.entries.clear();
        self.watermarks.clear();
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_when_due() {
        let mut timers = TimerSet::new();
        timers.setup(1, TimerKind::Nominate, Some(Duration::from_millis(10)));

        assert!(timers.poll(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.poll(later), vec![(1, TimerKind::Nominate)]);
        assert!(timers.poll(later).is_empty());
    }

    #[test]
    fn newer_timer_supersedes_older() {
        let mut timers = TimerSet::new();
        timers.setup(1, TimerKind::Nominate, Some(Duration::from_millis(10)));
        timers.setup(1, TimerKind::Nominate, Some(Duration::from_millis(50)));

        let later = Instant::now() + Duration::from_secs(1);
        // Only the newer entry fires.
        assert_eq!(timers.poll(later).len(), 1);
    }

    #[test]
    fn zero_timeout_cancels() {
        let mut timers = TimerSet::new();
        timers.setup(1, TimerKind::Catchup, Some(Duration::from_millis(10)));
        timers.setup(1, TimerKind::Catchup, None);

        let later = Instant::now() + Duration::from_secs(1);
        assert!(timers.poll(later).is_empty());
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn kinds_are_independent() {
        let mut timers = TimerSet::new();
        timers.setup(1, TimerKind::Nominate, Some(Duration::from_millis(10)));
        timers.setup(1, TimerKind::Catchup, Some(Duration::from_millis(10)));
        timers.setup(1, TimerKind::Nominate, None);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.poll(later), vec![(1, TimerKind::Catchup)]);
    }
}
