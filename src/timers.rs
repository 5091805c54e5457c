// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-interface timer set.
//!
//! All protocol timers for one interface live in a priority queue keyed
//! by deadline. Cancellation is lazy: arming or resetting a key bumps its
//! generation, and stale heap entries are discarded when they surface.
//! Equal deadlines fire in insertion order so tests are reproducible.
//!
//! The daemon loop asks for `next_deadline()` to size its sleep, then
//! calls `pop_expired(now)` after waking. Time is always passed in, never
//! read internally, so tests can drive the set with synthetic `Instant`s.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Identity of a single-fire timer on one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Periodic General Query (armed only while Role = Querier)
    GeneralQuery,
    /// Other-querier-present timeout (armed only while Role = NonQuerier)
    OtherQuerierPresent,
    /// Group membership expiry
    GroupExpiry(Ipv4Addr),
    /// Per-source membership expiry
    SourceExpiry(Ipv4Addr, Ipv4Addr),
    /// Next retransmission of a group(-and-source)-specific query
    LastMemberQuery(Ipv4Addr),
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    deadline: Instant,
    /// Insertion-order tiebreak for equal deadlines
    seq: u64,
    key: TimerKey,
    generation: u64,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// A timer set bug surfaced by consistency checks: a heap entry that
/// claims a generation the bookkeeping never issued. Double fires and
/// fires-after-cancel silently corrupt membership state, so these are
/// collected for the daemon to log loudly rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInvariantViolation {
    pub key: TimerKey,
    pub detail: &'static str,
}

impl std::fmt::Display for TimerInvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {:?}", self.detail, self.key)
    }
}

#[derive(Debug, Default)]
pub struct TimerSet {
    heap: BinaryHeap<std::cmp::Reverse<ScheduledTimer>>,
    /// Current generation and deadline per armed key
    armed: HashMap<TimerKey, (u64, Instant)>,
    next_seq: u64,
    next_generation: u64,
    violations: Vec<TimerInvariantViolation>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire at `now + duration`. Re-arming an armed key is
    /// the same as `reset`: the previous pending fire is discarded.
    pub fn arm(&mut self, key: TimerKey, now: Instant, duration: Duration) {
        let deadline = now + duration;
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(key, (generation, deadline));

        self.next_seq += 1;
        self.heap.push(std::cmp::Reverse(ScheduledTimer {
            deadline,
            seq: self.next_seq,
            key,
            generation,
        }));
    }

    /// Re-arm, discarding any pending fire for this key.
    pub fn reset(&mut self, key: TimerKey, now: Instant, duration: Duration) {
        self.arm(key, now, duration);
    }

    /// Cancel a key. Idempotent; cancelling an unarmed key is a no-op.
    pub fn cancel(&mut self, key: &TimerKey) {
        self.armed.remove(key);
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    /// Deadline of the given key, if armed.
    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.armed.get(key).map(|(_, deadline)| *deadline)
    }

    /// Earliest live deadline, skipping over stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(std::cmp::Reverse(entry)) = self.heap.peek() {
            match self.armed.get(&entry.key) {
                Some((generation, _)) if *generation == entry.generation => {
                    return Some(entry.deadline)
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every timer whose deadline has passed, in deadline order with
    /// insertion-order tiebreak. Each fired key is disarmed, so a timer
    /// fires at most once per arm/reset cycle.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        while let Some(std::cmp::Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self
                .heap
                .pop()
                .expect("peeked entry must pop")
                .0;
            match self.armed.get(&entry.key) {
                Some((generation, _)) if *generation == entry.generation => {
                    self.armed.remove(&entry.key);
                    fired.push(entry.key);
                }
                Some((generation, _)) if *generation < entry.generation => {
                    // Heap entries can only lag the bookkeeping, never lead it
                    self.violations.push(TimerInvariantViolation {
                        key: entry.key,
                        detail: "heap generation ahead of armed generation",
                    });
                }
                _ => {
                    // Superseded by a reset, or cancelled: discard silently
                }
            }
        }
        fired
    }

    /// Drain accumulated invariant violations for loud logging.
    pub fn drain_violations(&mut self) -> Vec<TimerInvariantViolation> {
        std::mem::take(&mut self.violations)
    }

    /// Disarm everything (interface shutdown).
    pub fn cancel_all(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(239, 0, 0, last)
    }

    #[test]
    fn test_fires_once_per_arm() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::GeneralQuery, t0, Duration::from_secs(5));

        assert!(timers.pop_expired(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(
            timers.pop_expired(t0 + Duration::from_secs(5)),
            vec![TimerKey::GeneralQuery]
        );
        // No second fire for the same arming
        assert!(timers.pop_expired(t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_reset_discards_pending_fire() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::GroupExpiry(group(1)), t0, Duration::from_secs(10));
        timers.reset(TimerKey::GroupExpiry(group(1)), t0, Duration::from_secs(30));

        // Old deadline passes without firing
        assert!(timers.pop_expired(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(
            timers.pop_expired(t0 + Duration::from_secs(30)),
            vec![TimerKey::GroupExpiry(group(1))]
        );
        assert!(timers.drain_violations().is_empty());
    }

    #[test]
    fn test_cancel_discards_pending_fire() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::OtherQuerierPresent, t0, Duration::from_secs(255));
        timers.cancel(&TimerKey::OtherQuerierPresent);
        assert!(!timers.is_armed(&TimerKey::OtherQuerierPresent));
        assert!(timers.pop_expired(t0 + Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::GroupExpiry(group(9)), t0, Duration::from_secs(1));
        timers.arm(TimerKey::GroupExpiry(group(1)), t0, Duration::from_secs(1));
        timers.arm(TimerKey::LastMemberQuery(group(5)), t0, Duration::from_secs(1));

        assert_eq!(
            timers.pop_expired(t0 + Duration::from_secs(1)),
            vec![
                TimerKey::GroupExpiry(group(9)),
                TimerKey::GroupExpiry(group(1)),
                TimerKey::LastMemberQuery(group(5)),
            ]
        );
    }

    #[test]
    fn test_next_deadline_skips_stale_entries() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::GeneralQuery, t0, Duration::from_secs(1));
        timers.reset(TimerKey::GeneralQuery, t0, Duration::from_secs(100));
        timers.arm(TimerKey::OtherQuerierPresent, t0, Duration::from_secs(50));

        assert_eq!(
            timers.next_deadline(),
            Some(t0 + Duration::from_secs(50))
        );
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = TimerSet::new();
        let t0 = Instant::now();
        timers.arm(TimerKey::GeneralQuery, t0, Duration::from_secs(1));
        timers.arm(TimerKey::GroupExpiry(group(3)), t0, Duration::from_secs(2));
        timers.cancel_all();
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.pop_expired(t0 + Duration::from_secs(10)).is_empty());
    }
}
