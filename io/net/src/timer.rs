//! Min-heap of deadlines with lazy cancellation.
//!
//! Entries are never removed from the middle of the heap. Each insert
//! returns a sequence number; owners remember the number of their live
//! timer and ignore popped entries that no longer match it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::query::QueryId;
use crate::types::ConnId;

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// Protocol alarm of a connection.
    Connection(ConnId),
    /// Output throttle of a rate-limited connection has refilled.
    Throttle(ConnId),
    /// Deadline of an in-flight query.
    Query(QueryId),
}

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

pub struct TimerHeap<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 1,
        }
    }
}

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `item` at `deadline`; returns the timer's sequence number.
    pub fn insert(&mut self, deadline: Instant, item: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            item,
        }));
        seq
    }

    /// Earliest pending deadline, stale entries included.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(u64, T)> {
        if self.heap.peek()?.0.deadline > now {
            return None;
        }
        self.heap.pop().map(|Reverse(e)| (e.seq, e.item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(now + Duration::from_millis(30), "c");
        heap.insert(now + Duration::from_millis(10), "a");
        heap.insert(now + Duration::from_millis(20), "b");

        assert!(heap.pop_expired(now).is_none());
        let later = now + Duration::from_millis(25);
        assert_eq!(heap.pop_expired(later).map(|(_, i)| i), Some("a"));
        assert_eq!(heap.pop_expired(later).map(|(_, i)| i), Some("b"));
        assert!(heap.pop_expired(later).is_none());
        assert_eq!(heap.next_deadline(), Some(now + Duration::from_millis(30)));
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        let a = heap.insert(now, 1);
        let b = heap.insert(now, 2);
        assert!(a < b);
        assert_eq!(heap.pop_expired(now), Some((a, 1)));
        assert_eq!(heap.pop_expired(now), Some((b, 2)));
    }
}
