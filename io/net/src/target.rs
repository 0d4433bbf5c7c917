//! Outbound targets: pooled connections to one destination.
//!
//! Targets live in a fixed-capacity table, reachable through a salted
//! chained hash of `(conn_type, extra, endpoint)`. Each target sits on exactly one of
//! three lists: Active (referenced), Inactive (unreferenced but still owning
//! connections or queries) or Free.

use std::hash::BuildHasher;
use std::time::{Duration, Instant};

use ahash::RandomState;
use rand::Rng;

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::list::{Linked, Links, ListHead};
use crate::metrics::{TARGETS_ACTIVE, TARGETS_FREED};
use crate::types::{ConnId, TargetId};

/// Destination requested by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub endpoint: Endpoint,
    /// Connection type name. The engine fills in its own protocol's name
    /// when unset.
    pub conn_type: Option<&'static str>,
    /// Distinguishes targets of one type sharing an endpoint.
    pub extra: u64,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Initial reconnect delay; also the delay restored after a success.
    pub reconnect_timeout: Duration,
}

impl TargetSpec {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn_type: None,
            extra: 0,
            min_connections: 1,
            max_connections: 1,
            reconnect_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Active,
    Inactive,
    Free,
}

#[derive(Debug)]
pub struct Target {
    generation: u32,
    endpoint: Endpoint,
    conn_type: &'static str,
    extra: u64,
    min_connections: usize,
    max_connections: usize,
    reconnect_timeout: Duration,
    next_reconnect: Instant,
    next_reconnect_timeout: Duration,
    refcnt: u32,
    pub(crate) conns: Vec<ConnId>,
    pub(crate) active_outbound_connections: usize,
    pub(crate) queries: ListHead,
    list: ListKind,
    links: Links,
    hash_next: Option<usize>,
}

impl Linked for Target {
    fn links(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl Target {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn conn_type(&self) -> &'static str {
        self.conn_type
    }

    pub fn extra(&self) -> u64 {
        self.extra
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Open outbound connections, in any state.
    pub fn outbound_connections(&self) -> usize {
        self.conns.len()
    }

    /// Outbound connections that became ready and are still open.
    pub fn active_outbound_connections(&self) -> usize {
        self.active_outbound_connections
    }

    pub fn next_reconnect(&self) -> Instant {
        self.next_reconnect
    }

    /// Current backoff delay.
    pub fn next_reconnect_timeout(&self) -> Duration {
        self.next_reconnect_timeout
    }

    pub fn connections(&self) -> &[ConnId] {
        &self.conns
    }

    /// True if the reconnect backoff permits opening sockets at `now`.
    pub fn may_reconnect(&self, now: Instant) -> bool {
        now >= self.next_reconnect || self.active_outbound_connections > 0
    }
}

/// Connections a target should have: `min + failed + ceil(stopped / 2)`,
/// capped at `max`.
pub fn desired_connections(min: usize, max: usize, failed: usize, stopped: usize) -> usize {
    (min + failed + stopped.div_ceil(2)).min(max)
}

/// Probability of closing an idle connection after `dt` at rate `k`.
pub fn idle_close_probability(k: f64, dt: Duration) -> f64 {
    1.0 - (-k * dt.as_secs_f64()).exp()
}

pub struct TargetTable {
    slots: Vec<Target>,
    buckets: Vec<Option<usize>>,
    hasher: RandomState,
    capacity: usize,
    max_reconnect_interval: Duration,
    active: ListHead,
    inactive: ListHead,
    free: ListHead,
}

impl TargetTable {
    pub fn new(
        capacity: usize,
        buckets: usize,
        salt: u64,
        max_reconnect_interval: Duration,
    ) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(1024)),
            buckets: vec![None; buckets.max(1)],
            hasher: RandomState::with_seeds(
                salt,
                salt.rotate_left(21),
                salt ^ 0x243f_6a88_85a3_08d3,
                !salt,
            ),
            capacity,
            max_reconnect_interval,
            active: ListHead::default(),
            inactive: ListHead::default(),
            free: ListHead::default(),
        }
    }

    fn bucket(&self, conn_type: &str, extra: u64, endpoint: &Endpoint) -> usize {
        let hash = self.hasher.hash_one((conn_type, extra, endpoint));
        (hash % self.buckets.len() as u64) as usize
    }

    fn id_of(&self, slot: usize) -> TargetId {
        TargetId::with_generation(slot, self.slots[slot].generation)
    }

    fn slot_of(&self, id: TargetId) -> Option<usize> {
        let target = self.slots.get(id.slot())?;
        (target.generation == id.generation() && target.list != ListKind::Free).then_some(id.slot())
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.slot_of(id).map(|slot| &self.slots[slot])
    }

    pub(crate) fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.slot_of(id).map(|slot| &mut self.slots[slot])
    }

    /// Find a live target by `(conn_type, extra, endpoint)`.
    pub fn lookup(&self, conn_type: &str, extra: u64, endpoint: &Endpoint) -> Option<TargetId> {
        let mut cur = self.buckets[self.bucket(conn_type, extra, endpoint)];
        while let Some(slot) = cur {
            let t = &self.slots[slot];
            if t.conn_type == conn_type && t.extra == extra && t.endpoint == *endpoint {
                return Some(self.id_of(slot));
            }
            cur = t.hash_next;
        }
        None
    }

    /// Reference a target, creating it if needed. Returns the id and whether
    /// it was newly created. An existing target takes the new limits and
    /// reconnect timeout.
    pub fn create(
        &mut self,
        spec: &TargetSpec,
        conn_type: &'static str,
        now: Instant,
    ) -> Result<(TargetId, bool), NetError> {
        let base_timeout = spec.reconnect_timeout.min(self.max_reconnect_interval);

        if let Some(id) = self.lookup(conn_type, spec.extra, &spec.endpoint) {
            let slot = id.slot();
            if self.slots[slot].refcnt == 0 {
                self.inactive.remove(&mut self.slots, slot);
                self.active.push_back(&mut self.slots, slot);
                self.slots[slot].list = ListKind::Active;
                TARGETS_ACTIVE.increment();
            }
            let t = &mut self.slots[slot];
            t.refcnt += 1;
            t.min_connections = spec.min_connections;
            t.max_connections = spec.max_connections;
            t.reconnect_timeout = base_timeout;
            t.next_reconnect_timeout = t.next_reconnect_timeout.max(base_timeout);
            tracing::debug!(target_id = %id, endpoint = %spec.endpoint, refcnt = t.refcnt, "target referenced");
            return Ok((id, false));
        }

        let slot = match self.free.pop_front(&mut self.slots) {
            Some(slot) => slot,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Target {
                    generation: 0,
                    endpoint: spec.endpoint.clone(),
                    conn_type,
                    extra: 0,
                    min_connections: 0,
                    max_connections: 0,
                    reconnect_timeout: Duration::ZERO,
                    next_reconnect: now,
                    next_reconnect_timeout: Duration::ZERO,
                    refcnt: 0,
                    conns: Vec::new(),
                    active_outbound_connections: 0,
                    queries: ListHead::default(),
                    list: ListKind::Free,
                    links: Links::default(),
                    hash_next: None,
                });
                self.slots.len() - 1
            }
            None => return Err(NetError::TargetLimitReached),
        };

        let bucket = self.bucket(conn_type, spec.extra, &spec.endpoint);
        let head = self.buckets[bucket];
        let t = &mut self.slots[slot];
        t.endpoint = spec.endpoint.clone();
        t.conn_type = conn_type;
        t.extra = spec.extra;
        t.min_connections = spec.min_connections;
        t.max_connections = spec.max_connections;
        t.reconnect_timeout = base_timeout;
        t.next_reconnect = now;
        t.next_reconnect_timeout = base_timeout;
        t.refcnt = 1;
        t.conns.clear();
        t.active_outbound_connections = 0;
        t.queries = ListHead::default();
        t.list = ListKind::Active;
        t.hash_next = head;
        self.buckets[bucket] = Some(slot);
        self.active.push_back(&mut self.slots, slot);
        TARGETS_ACTIVE.increment();

        let id = self.id_of(slot);
        tracing::info!(target_id = %id, endpoint = %spec.endpoint, "target created");
        Ok((id, true))
    }

    /// Drop one reference. At zero the target becomes inactive; it is freed
    /// once it owns no connections or queries.
    pub fn release(&mut self, id: TargetId) -> Result<u32, NetError> {
        let slot = self.slot_of(id).ok_or(NetError::StaleTarget(id))?;
        let t = &mut self.slots[slot];
        if t.refcnt == 0 {
            return Ok(0);
        }
        t.refcnt -= 1;
        let refcnt = t.refcnt;
        if refcnt == 0 {
            self.active.remove(&mut self.slots, slot);
            self.inactive.push_back(&mut self.slots, slot);
            self.slots[slot].list = ListKind::Inactive;
            TARGETS_ACTIVE.decrement();
            tracing::debug!(target_id = %id, "target inactive");
        }
        Ok(refcnt)
    }

    /// Free an unreferenced target that owns nothing. Returns true if freed.
    pub(crate) fn try_free(&mut self, id: TargetId) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        let t = &self.slots[slot];
        if t.refcnt != 0 || !t.conns.is_empty() || !t.queries.is_empty() {
            return false;
        }

        let bucket = self.bucket(t.conn_type, t.extra, &t.endpoint);
        let next = t.hash_next;
        if self.buckets[bucket] == Some(slot) {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(s) = cur {
                if self.slots[s].hash_next == Some(slot) {
                    self.slots[s].hash_next = next;
                    break;
                }
                cur = self.slots[s].hash_next;
            }
        }

        self.inactive.remove(&mut self.slots, slot);
        let t = &mut self.slots[slot];
        t.hash_next = None;
        t.list = ListKind::Free;
        t.generation = t.generation.wrapping_add(1);
        self.free.push_back(&mut self.slots, slot);
        TARGETS_FREED.increment();
        tracing::info!(target_id = %id, "target freed");
        true
    }

    pub fn active_ids(&mut self) -> Vec<TargetId> {
        let slots = self.active.indices(&mut self.slots);
        slots.into_iter().map(|s| self.id_of(s)).collect()
    }

    pub fn inactive_ids(&mut self) -> Vec<TargetId> {
        let slots = self.inactive.indices(&mut self.slots);
        slots.into_iter().map(|s| self.id_of(s)).collect()
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    fn inactive_len(&self) -> usize {
        self.inactive.len()
    }

    /// A connect attempt failed: wait, and grow the delay by 1.5x plus
    /// jitter, up to the configured maximum.
    pub(crate) fn record_failure<R: Rng>(&mut self, id: TargetId, now: Instant, rng: &mut R) {
        let max = self.max_reconnect_interval;
        let Some(t) = self.get_mut(id) else {
            return;
        };
        let current = t.next_reconnect_timeout;
        t.next_reconnect = now + current;
        let jitter = current.mul_f64(rng.random::<f64>() * 0.1);
        t.next_reconnect_timeout = (current.mul_f64(1.5) + jitter).min(max);
        tracing::debug!(
            target_id = %id,
            delay_ms = current.as_millis() as u64,
            next_delay_ms = t.next_reconnect_timeout.as_millis() as u64,
            "reconnect backoff"
        );
    }

    /// A connection became ready: restore the base delay.
    pub(crate) fn record_success(&mut self, id: TargetId) {
        if let Some(t) = self.get_mut(id) {
            t.next_reconnect_timeout = t.reconnect_timeout;
            t.active_outbound_connections += 1;
        }
    }
}
