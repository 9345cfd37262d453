use alloc::vec::Vec;

use crate::layer::tcp::TcpTimer;
use crate::managed::Key;
use crate::time::Instant;
use crate::wire::Ipv4Address;

/// The purpose of an armed timer.
///
/// Each purpose is armed at most once, arming it again moves the deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Timer {
    /// Age the next-hop tables.
    ArpTick,
    /// Send a membership report for a group.
    Igmp(Ipv4Address),
    /// A per-connection timer.
    Tcp(Key, TcpTimer),
}

/// A single list of timers, sorted by deadline.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    entries: Vec<(Instant, Timer)>,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Timers::default()
    }

    /// Arm `timer` to fire at `deadline`, superseding an earlier arming.
    pub(crate) fn arm(&mut self, deadline: Instant, timer: Timer) {
        self.disarm(timer);
        // Equal deadlines fire in the order they were armed.
        let at = self.entries.partition_point(|&(other, _)| other <= deadline);
        self.entries.insert(at, (deadline, timer));
    }

    /// Disarm `timer`, returning whether it was armed.
    pub(crate) fn disarm(&mut self, timer: Timer) -> bool {
        match self.entries.iter().position(|&(_, other)| other == timer) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            },
            None => false,
        }
    }

    /// Disarm every timer matching the predicate.
    pub(crate) fn disarm_where(&mut self, mut pred: impl FnMut(&Timer) -> bool) {
        self.entries.retain(|(_, timer)| !pred(timer))
    }

    pub(crate) fn deadline(&self, timer: Timer) -> Option<Instant> {
        self.entries.iter()
            .find(|&&(_, other)| other == timer)
            .map(|&(deadline, _)| deadline)
    }

    pub(crate) fn is_armed(&self, timer: Timer) -> bool {
        self.deadline(timer).is_some()
    }

    /// Remove and return the earliest timer that is due at `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Option<Timer> {
        match self.entries.first() {
            Some(&(deadline, _)) if deadline <= now => Some(self.entries.remove(0).1),
            _ => None,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|&(deadline, _)| deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearm_supersedes() {
        let mut timers = Timers::new();
        let group = Ipv4Address::new(239, 0, 0, 1);
        timers.arm(Instant::from_millis(100), Timer::ArpTick);
        timers.arm(Instant::from_millis(50), Timer::Igmp(group));
        timers.arm(Instant::from_millis(200), Timer::Igmp(group));

        assert_eq!(timers.next_deadline(), Some(Instant::from_millis(100)));
        assert_eq!(timers.expire(Instant::from_millis(99)), None);
        assert_eq!(timers.expire(Instant::from_millis(250)), Some(Timer::ArpTick));
        assert_eq!(timers.expire(Instant::from_millis(250)), Some(Timer::Igmp(group)));
        assert_eq!(timers.expire(Instant::from_millis(250)), None);
    }

    #[test]
    fn disarm() {
        let mut timers = Timers::new();
        timers.arm(Instant::from_millis(10), Timer::ArpTick);
        assert!(timers.is_armed(Timer::ArpTick));
        assert!(timers.disarm(Timer::ArpTick));
        assert!(!timers.disarm(Timer::ArpTick));
        assert_eq!(timers.next_deadline(), None);
    }
}
