//! In-flight queries tied to a connection or a target.

use std::time::Instant;

use slab::Slab;

use crate::list::{Linked, Links, ListHead};
use crate::timer::{Alarm, TimerHeap};
use crate::types::{ConnId, TargetId};

/// Query identifier, slot plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

impl QueryId {
    fn new(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    #[inline]
    fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Where a query is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOwner {
    Connection(ConnId),
    Target(TargetId),
}

/// Why a query ended without being completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The deadline passed.
    Timeout,
    /// The owning connection or target went away.
    Aborted,
}

/// One in-flight request.
#[derive(Debug)]
pub struct ConnQuery {
    pub owner: QueryOwner,
    /// Caller-defined correlation value.
    pub tag: u64,
    pub deadline: Option<Instant>,
    timer: Option<u64>,
    generation: u32,
    links: Links,
}

impl Linked for ConnQuery {
    fn links(&mut self) -> &mut Links {
        &mut self.links
    }
}

#[derive(Default)]
pub struct QueryTable {
    slots: Slab<ConnQuery>,
    next_generation: u32,
}

impl QueryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: QueryId) -> Option<&ConnQuery> {
        self.slots
            .get(id.slot())
            .filter(|q| q.generation == id.generation())
    }

    pub(crate) fn insert(
        &mut self,
        anchor: &mut ListHead,
        owner: QueryOwner,
        tag: u64,
        deadline: Option<Instant>,
        timers: &mut TimerHeap<Alarm>,
    ) -> QueryId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = self.slots.insert(ConnQuery {
            owner,
            tag,
            deadline,
            timer: None,
            generation,
            links: Links::default(),
        });
        let id = QueryId::new(slot, generation);
        if let Some(deadline) = deadline {
            self.slots[slot].timer = Some(timers.insert(deadline, Alarm::Query(id)));
        }
        anchor.push_back(&mut self.slots, slot);
        id
    }

    /// Remove a live query from its anchor list.
    pub(crate) fn remove(&mut self, anchor: &mut ListHead, id: QueryId) -> Option<ConnQuery> {
        self.get(id)?;
        anchor.remove(&mut self.slots, id.slot());
        Some(self.slots.remove(id.slot()))
    }

    /// Remove every query on `anchor`, in insertion order.
    pub(crate) fn drain(&mut self, anchor: &mut ListHead) -> Vec<ConnQuery> {
        let mut out = Vec::with_capacity(anchor.len());
        while let Some(slot) = anchor.pop_front(&mut self.slots) {
            out.push(self.slots.remove(slot));
        }
        out
    }

    /// Oldest query on `anchor` carrying `tag`.
    pub(crate) fn find_by_tag(&mut self, anchor: &ListHead, tag: u64) -> Option<QueryId> {
        anchor
            .indices(&mut self.slots)
            .into_iter()
            .find(|&slot| self.slots[slot].tag == tag)
            .map(|slot| QueryId::new(slot, self.slots[slot].generation))
    }

    /// Owner of the query if timer `seq` is still its live deadline.
    pub(crate) fn expired_owner(&self, id: QueryId, seq: u64) -> Option<QueryOwner> {
        self.get(id)
            .filter(|q| q.timer == Some(seq))
            .map(|q| q.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn insert_remove_drain() {
        let mut table = QueryTable::new();
        let mut timers = TimerHeap::new();
        let mut anchor = ListHead::default();
        let owner = QueryOwner::Connection(ConnId::with_generation(1, 0));

        let a = table.insert(&mut anchor, owner, 10, None, &mut timers);
        let b = table.insert(&mut anchor, owner, 11, None, &mut timers);
        let c = table.insert(&mut anchor, owner, 12, None, &mut timers);
        assert_eq!(anchor.len(), 3);

        assert_eq!(table.remove(&mut anchor, b).map(|q| q.tag), Some(11));
        assert!(table.remove(&mut anchor, b).is_none());
        assert!(table.get(b).is_none());

        let tags: Vec<u64> = table.drain(&mut anchor).into_iter().map(|q| q.tag).collect();
        assert_eq!(tags, vec![10, 12]);
        assert!(table.get(a).is_none() && table.get(c).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn deadline_registers_timer() {
        let mut table = QueryTable::new();
        let mut timers = TimerHeap::new();
        let mut anchor = ListHead::default();
        let owner = QueryOwner::Target(TargetId::with_generation(0, 0));
        let now = Instant::now();
        let id = table.insert(
            &mut anchor,
            owner,
            1,
            Some(now + Duration::from_millis(5)),
            &mut timers,
        );

        let (seq, alarm) = timers.pop_expired(now + Duration::from_millis(5)).unwrap();
        assert_eq!(alarm, Alarm::Query(id));
        assert_eq!(table.expired_owner(id, seq), Some(owner));
        assert_eq!(table.expired_owner(id, seq + 1), None);
    }
}
