//! The event loop.
//!
//! One [`Engine`] owns a mio poll instance, every connection and listener it
//! created, the target table, timers and queries. All protocol callbacks run
//! synchronously on the thread calling [`Engine::run_once`].
//!
//! A loop iteration:
//!
//! 1. poll for socket readiness, bounded by the earliest timer,
//! 2. accept on ready listeners and finish pending connects,
//! 3. deliver completions to suspended connections,
//! 4. fire due timers (connection alarms, throttles, query deadlines),
//! 5. maintain targets (open missing connections, close idle ones),
//! 6. service every touched connection: flush, read, parse, flush,
//! 7. close connections that failed or finished, unless held in a
//!    critical section.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use crossbeam_channel::Receiver;
use io_msgbuf::BufferAllocator;
use mio::{Events, Interest, Poll, Token, Waker};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use slab::Slab;

use crate::config::NetConfig;
use crate::conn_type::{ConnType, Context};
use crate::connection::{Connection, ERR_CONNECT, ERR_IO, ERR_NO_MEMORY, ERR_PEER_CLOSED};
use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::metrics::*;
use crate::pid::ProcessId;
use crate::query::{QueryId, QueryOutcome, QueryOwner, QueryTable};
use crate::ratelimit::RateLimiter;
use crate::socket::{Capped, Listener, Stream};
use crate::target::{Target, TargetSpec, TargetTable, desired_connections, idle_close_probability};
use crate::timer::{Alarm, TimerHeap};
use crate::types::{
    ConnFlags, ConnId, ConnKind, ConnStatus, ListenerId, ParseStatus, ReadyState, TargetId,
};

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Poll interval while reads are deferred by buffer exhaustion.
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(1);

struct Slot<S> {
    conn: Connection,
    stream: Stream,
    state: S,
}

enum Fill {
    Open,
    Eof,
    Backpressure,
}

/// A single-threaded connection engine driving one protocol.
///
/// Not `Sync`: run it on a dedicated thread. Work from other threads
/// reaches it only through [`Completer`](crate::Completer) handles.
pub struct Engine<T: ConnType> {
    proto: T,
    poll: Poll,
    events: Events,
    conns: Slab<Slot<T::State>>,
    listeners: Slab<Listener>,
    targets: TargetTable,
    cx: Context<T::Completion>,
    completions: Receiver<(ConnId, T::Completion)>,
    rng: Xoshiro256PlusPlus,
    next_generation: u32,
    /// Connections to service at the end of this iteration.
    touched: AHashSet<ConnId>,
    /// Connections whose reads were deferred by buffer exhaustion.
    read_retry: AHashSet<ConnId>,
    last_idle_sweep: Instant,
}

impl<T: ConnType> Engine<T> {
    /// Create an engine with its own poll instance.
    ///
    /// `identity` is what the protocol presents to peers. The target hash
    /// salt is taken from `config.hash_salt`, or drawn at random.
    pub fn new(
        proto: T,
        config: NetConfig,
        alloc: BufferAllocator,
        identity: ProcessId,
    ) -> Result<Self, NetError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut rng = Xoshiro256PlusPlus::from_rng(&mut rand::rng());
        let salt = config.hash_salt.unwrap_or_else(|| rng.random());
        let targets = TargetTable::new(
            config.max_targets,
            config.target_hash_buckets,
            salt,
            config.max_reconnect_interval(),
        );
        let now = Instant::now();

        tracing::debug!(protocol = proto.name(), %identity, "engine created");

        Ok(Self {
            proto,
            poll,
            events: Events::with_capacity(1024),
            conns: Slab::with_capacity(config.max_connections.min(4096)),
            listeners: Slab::with_capacity(16),
            targets,
            cx: Context {
                now,
                alloc,
                identity,
                config,
                timers: TimerHeap::new(),
                queries: QueryTable::new(),
                completions: tx,
                waker,
            },
            completions: rx,
            rng,
            next_generation: 0,
            touched: AHashSet::new(),
            read_retry: AHashSet::new(),
            last_idle_sweep: now,
        })
    }

    pub fn protocol(&self) -> &T {
        &self.proto
    }

    pub fn protocol_mut(&mut self) -> &mut T {
        &mut self.proto
    }

    pub fn config(&self) -> &NetConfig {
        &self.cx.config
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.cx.alloc
    }

    /// Identity presented to peers.
    pub fn identity(&self) -> &ProcessId {
        &self.cx.identity
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Open listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Live queries, anchored on connections or targets.
    pub fn query_count(&self) -> usize {
        self.cx.queries.len()
    }

    // === listeners ===

    /// Bind and register a listener. Accepted connections are handed to
    /// [`ConnType::init_accepted`].
    pub fn listen(&mut self, endpoint: &Endpoint) -> Result<ListenerId, NetError> {
        let mut listener =
            Listener::bind(endpoint, self.cx.config.backlog).map_err(|source| NetError::Listen {
                endpoint: endpoint.clone(),
                source,
            })?;

        let entry = self.listeners.vacant_entry();
        let id = entry.key();
        self.poll.registry().register(
            listener.source(),
            Token(id + LISTENER_TOKEN_OFFSET),
            Interest::READABLE,
        )?;
        entry.insert(listener);

        tracing::info!(%endpoint, protocol = self.proto.name(), "listening");
        Ok(ListenerId(id))
    }

    /// Bound address of a TCP listener.
    pub fn listener_addr(&self, id: ListenerId) -> Option<std::net::SocketAddr> {
        self.listeners.get(id.0).and_then(Listener::local_addr)
    }

    /// Stop accepting. Connections already accepted stay open. Unknown ids
    /// are ignored.
    pub fn close_listener(&mut self, id: ListenerId) -> Result<(), NetError> {
        if let Some(mut listener) = self.listeners.try_remove(id.0) {
            self.poll.registry().deregister(listener.source())?;
        }
        Ok(())
    }

    fn accept_pending(&mut self, listener_id: usize) {
        loop {
            let Some(listener) = self.listeners.get(listener_id) else {
                return;
            };
            match listener.accept() {
                Ok(stream) => {
                    if self.conns.len() >= self.cx.config.max_connections {
                        tracing::warn!("connection limit reached, dropping accepted socket");
                        continue;
                    }
                    match self.insert_connection(stream, ConnKind::Inbound, None) {
                        Ok(id) => {
                            CONNECTIONS_ACCEPTED.increment();
                            tracing::debug!(conn = %id, "accepted");
                        }
                        Err(e) => tracing::warn!("failed to set up accepted connection: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(listener = listener_id, "accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn insert_connection(
        &mut self,
        mut stream: Stream,
        kind: ConnKind,
        target: Option<TargetId>,
    ) -> Result<ConnId, NetError> {
        let entry = self.conns.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let id = ConnId::with_generation(slot, generation);

        let mut conn = Connection::new(id, kind, &self.cx.alloc, target, self.cx.now);
        conn.set_addrs(stream.local_addr(), stream.peer_addr().ok().flatten());
        if self.cx.config.rate_limit_bytes_per_sec > 0 {
            conn.rate_limit = Some(RateLimiter::new(
                self.cx.config.rate_limit_bytes_per_sec,
                self.cx.config.rate_limit_burst,
                self.cx.now,
            ));
        }

        self.poll.registry().register(
            stream.source(),
            Token(slot),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let state = match kind {
            ConnKind::Inbound => self.proto.init_accepted(&mut conn, &mut self.cx),
            ConnKind::Outbound => self.proto.init_outbound(&mut conn, &mut self.cx),
        };
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                let _ = self.poll.registry().deregister(stream.source());
                return Err(e);
            }
        };

        entry.insert(Slot {
            conn,
            stream,
            state,
        });
        CONNECTIONS_ACTIVE.increment();
        // Data may have arrived before registration.
        self.touched.insert(id);
        Ok(id)
    }

    // === connections ===

    fn slot_mut(&mut self, id: ConnId) -> Option<&mut Slot<T::State>> {
        self.conns
            .get_mut(id.slot())
            .filter(|s| s.conn.id() == id)
    }

    /// True while `id` names a live connection. Ids of closed connections
    /// never match a reused slot.
    pub fn contains(&self, id: ConnId) -> bool {
        self.conns
            .get(id.slot())
            .is_some_and(|s| s.conn.id() == id)
    }

    /// Run `f` against a live connection. Output it queues is flushed during
    /// the next loop iteration.
    pub fn with_connection<R>(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut T, &mut Connection, &mut T::State, &mut Context<T::Completion>) -> R,
    ) -> Result<R, NetError> {
        let slot = self
            .conns
            .get_mut(id.slot())
            .filter(|s| s.conn.id() == id)
            .ok_or(NetError::StaleConnection(id))?;
        let result = f(&mut self.proto, &mut slot.conn, &mut slot.state, &mut self.cx);
        self.touched.insert(id);
        Ok(result)
    }

    /// Mark a connection failed; it is closed on the next loop pass.
    pub fn fail_connection(&mut self, id: ConnId, code: i32) -> Result<(), NetError> {
        self.with_connection(id, |_, conn, _, _| conn.fail(code))
    }

    /// Hold a connection open across loop iterations even if it fails.
    pub fn enter_critical(&mut self, id: ConnId) -> Result<(), NetError> {
        let slot = self.slot_mut(id).ok_or(NetError::StaleConnection(id))?;
        slot.conn.set_ignored(true);
        Ok(())
    }

    /// End a critical section. A close deferred while inside it happens now.
    pub fn leave_critical(&mut self, id: ConnId) -> Result<(), NetError> {
        let slot = self.slot_mut(id).ok_or(NetError::StaleConnection(id))?;
        slot.conn.set_ignored(false);
        if slot.conn.close_deferred {
            self.close_connection(id);
        } else {
            self.touched.insert(id);
        }
        Ok(())
    }

    // === targets ===

    /// Reference a target, creating it if needed. Connections are opened by
    /// the loop.
    ///
    /// Targets are keyed by connection type, `extra` and endpoint. A spec
    /// without a connection type takes the engine protocol's name.
    pub fn create_target(&mut self, spec: &TargetSpec) -> Result<(TargetId, bool), NetError> {
        let conn_type = spec.conn_type.unwrap_or_else(|| self.proto.name());
        self.targets.create(spec, conn_type, self.cx.now)
    }

    /// Drop a reference. An unreferenced target keeps its connections until
    /// the idle sweep closes them, and is freed once it owns nothing.
    pub fn release_target(&mut self, id: TargetId) -> Result<(), NetError> {
        if self.targets.release(id)? == 0 {
            self.targets.try_free(id);
        }
        Ok(())
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    /// Find a live target. `None` for the connection type means the engine
    /// protocol's own.
    pub fn lookup_target(
        &self,
        conn_type: Option<&str>,
        extra: u64,
        endpoint: &Endpoint,
    ) -> Option<TargetId> {
        let conn_type = conn_type.unwrap_or_else(|| self.proto.name());
        self.targets.lookup(conn_type, extra, endpoint)
    }

    /// A connection of `target` that its protocol reports ready.
    pub fn ready_connection(&self, target: TargetId) -> Option<ConnId> {
        let t = self.targets.get(target)?;
        t.connections().iter().copied().find(|id| {
            self.conns
                .get(id.slot())
                .filter(|s| s.conn.id() == *id)
                .is_some_and(|s| self.proto.check_ready(&s.conn, &s.state) == ReadyState::Ok)
        })
    }

    /// Track a request routed to `target` rather than to one connection.
    pub fn create_target_query(
        &mut self,
        target: TargetId,
        tag: u64,
        timeout: Option<Duration>,
    ) -> Result<QueryId, NetError> {
        let deadline = timeout.map(|t| self.cx.now + t);
        let t = self
            .targets
            .get_mut(target)
            .ok_or(NetError::StaleTarget(target))?;
        Ok(self.cx.queries.insert(
            &mut t.queries,
            QueryOwner::Target(target),
            tag,
            deadline,
            &mut self.cx.timers,
        ))
    }

    /// Finish a target query; returns its tag if it was still live.
    pub fn finish_target_query(&mut self, target: TargetId, id: QueryId) -> Option<u64> {
        let t = self.targets.get_mut(target)?;
        let tag = self.cx.queries.remove(&mut t.queries, id).map(|q| q.tag);
        self.targets.try_free(target);
        tag
    }

    /// Open connections until `target` has as many as it should. Returns the
    /// number of sockets opened.
    pub fn create_new_connections(&mut self, target: TargetId) -> usize {
        let now = self.cx.now;
        let Some(t) = self.targets.get(target) else {
            return 0;
        };

        let (mut failed, mut stopped) = (0, 0);
        for id in t.connections() {
            let Some(slot) = self.conns.get(id.slot()).filter(|s| s.conn.id() == *id) else {
                continue;
            };
            match self.proto.check_ready(&slot.conn, &slot.state) {
                ReadyState::Failed => failed += 1,
                ReadyState::Stopped => stopped += 1,
                _ => {}
            }
        }

        let need = desired_connections(t.min_connections(), t.max_connections(), failed, stopped);
        let have = t.outbound_connections();
        if have >= need || !t.may_reconnect(now) {
            return 0;
        }

        let mut opened = 0;
        for _ in have..need {
            match self.open_outbound(target) {
                Ok(id) => {
                    opened += 1;
                    tracing::debug!(conn = %id, target_id = %target, "connecting");
                }
                Err(e) => {
                    CONNECT_ERRORS.increment();
                    tracing::warn!(target_id = %target, "connect failed: {e}");
                    self.targets.record_failure(target, now, &mut self.rng);
                    break;
                }
            }
        }
        opened
    }

    fn open_outbound(&mut self, target: TargetId) -> Result<ConnId, NetError> {
        if self.conns.len() >= self.cx.config.max_connections {
            return Err(NetError::ConnectionLimitReached);
        }
        let endpoint = self
            .targets
            .get(target)
            .ok_or(NetError::StaleTarget(target))?
            .endpoint()
            .clone();
        let stream = Stream::connect(&endpoint)?;
        let id = self.insert_connection(stream, ConnKind::Outbound, Some(target))?;
        if let Some(t) = self.targets.get_mut(target) {
            t.conns.push(id);
        }
        CONNECTIONS_OPENED.increment();
        Ok(id)
    }

    /// Randomly close idle connections of unreferenced targets. The chance
    /// grows with the time since the previous sweep.
    pub fn close_some_unneeded_connections(&mut self, elapsed: Duration) -> usize {
        let p = idle_close_probability(self.cx.config.idle_close_rate, elapsed);
        let mut closed = 0;
        for tid in self.targets.inactive_ids() {
            let conns = match self.targets.get(tid) {
                Some(t) => t.connections().to_vec(),
                None => continue,
            };
            if conns.is_empty() {
                self.targets.try_free(tid);
                continue;
            }
            for id in conns {
                let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id)
                else {
                    continue;
                };
                let conn = &mut slot.conn;
                let idle = conn.input.is_empty()
                    && !conn.has_wire_output()
                    && conn.queries.is_empty()
                    && conn.pending_queries() == 0
                    && !conn.status.is_suspended();
                if idle && self.rng.random::<f64>() < p {
                    conn.close_after_flush();
                    self.touched.insert(id);
                    IDLE_CLOSED.increment();
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            tracing::debug!(closed, "closed idle connections of inactive targets");
        }
        closed
    }

    fn maintain_targets(&mut self) {
        for tid in self.targets.active_ids() {
            self.create_new_connections(tid);
        }
        let elapsed = self.cx.now.saturating_duration_since(self.last_idle_sweep);
        if elapsed >= self.cx.config.idle_sweep_interval() {
            self.last_idle_sweep = self.cx.now;
            self.close_some_unneeded_connections(elapsed);
        }
    }

    // === event loop ===

    fn poll_timeout(&self) -> Duration {
        if !self.touched.is_empty() || !self.completions.is_empty() {
            return Duration::ZERO;
        }
        let mut timeout = self.cx.config.poll_timeout();
        if !self.read_retry.is_empty() {
            timeout = timeout.min(BACKPRESSURE_RETRY);
        }
        if let Some(deadline) = self.cx.timers.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        timeout
    }

    /// Run one loop iteration. Returns the number of readiness events.
    pub fn run_once(&mut self) -> Result<usize, NetError> {
        let timeout = self.poll_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
        self.cx.now = Instant::now();

        let events: Vec<_> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed(),
                    e.is_writable(),
                    e.is_error(),
                )
            })
            .collect();

        for &(token, readable, writable, error) in &events {
            if token == WAKER_TOKEN {
                continue;
            }
            if token.0 >= LISTENER_TOKEN_OFFSET {
                self.accept_pending(token.0 - LISTENER_TOKEN_OFFSET);
                continue;
            }
            let Some(slot) = self.conns.get_mut(token.0) else {
                continue;
            };
            let id = slot.conn.id();
            if readable {
                slot.conn.flags.remove(ConnFlags::NORD);
            }
            if writable && slot.conn.throttle_timer.is_none() {
                slot.conn.flags.remove(ConnFlags::NOWR);
            }
            if slot.conn.status == ConnStatus::Connecting {
                if writable || error {
                    self.finish_connect(id);
                }
            } else if error {
                if let Ok(Some(e)) | Err(e) = slot.stream.take_error() {
                    tracing::debug!(conn = %id, "socket error: {e}");
                    slot.conn.fail(ERR_IO);
                }
            }
            self.touched.insert(id);
        }

        let retry: Vec<ConnId> = self.read_retry.drain().collect();
        self.touched.extend(retry);

        self.deliver_completions();
        self.fire_timers();
        self.maintain_targets();

        let touched: Vec<ConnId> = self.touched.drain().collect();
        for id in touched {
            self.service(id);
            self.close_if_done(id);
        }

        Ok(events.len())
    }

    /// Run until `shutdown` is set, then close everything.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), NetError> {
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once()?;
        }
        self.close_all();
        Ok(())
    }

    /// Close every connection and listener.
    pub fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.conns.iter().map(|(_, s)| s.conn.id()).collect();
        for id in ids {
            if let Some(slot) = self.slot_mut(id) {
                slot.conn.set_ignored(false);
            }
            self.close_connection(id);
        }
        let listeners: Vec<usize> = self.listeners.iter().map(|(k, _)| k).collect();
        for id in listeners {
            let _ = self.close_listener(ListenerId(id));
        }
    }

    fn finish_connect(&mut self, id: ConnId) {
        let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id) else {
            return;
        };
        let Slot { conn, stream, state } = slot;

        let failure = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => {
                    conn.set_addrs(stream.local_addr(), peer);
                    None
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotConnected
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return;
                }
                Err(e) => Some(e),
            },
        };

        if let Some(e) = failure {
            CONNECT_ERRORS.increment();
            tracing::debug!(conn = %id, "connect failed: {e}");
            conn.fail(ERR_CONNECT);
            return;
        }

        conn.status = resting_status(conn);
        conn.touch(self.cx.now);
        tracing::debug!(conn = %id, remote = ?conn.remote_addr(), "connected");
        self.proto.connected(conn, state, &mut self.cx);
    }

    fn deliver_completions(&mut self) {
        while let Ok((id, completion)) = self.completions.try_recv() {
            let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id) else {
                tracing::trace!(conn = %id, "completion for closed connection dropped");
                continue;
            };
            let Slot { conn, state, .. } = slot;
            let last = conn.complete_pending();
            self.proto.wakeup(conn, state, completion, &mut self.cx);
            if last && matches!(conn.status, ConnStatus::WaitAio | ConnStatus::WaitNet) {
                resume(conn);
            }
            self.touched.insert(id);
        }
    }

    fn fire_timers(&mut self) {
        let now = self.cx.now;
        while let Some((seq, alarm)) = self.cx.timers.pop_expired(now) {
            match alarm {
                Alarm::Connection(id) => {
                    let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id)
                    else {
                        continue;
                    };
                    if slot.conn.alarm != Some(seq) {
                        continue;
                    }
                    let Slot { conn, state, .. } = slot;
                    conn.alarm = None;
                    self.proto.alarm(conn, state, &mut self.cx);
                    if conn.status == ConnStatus::WaitTimeout {
                        resume(conn);
                    }
                    self.touched.insert(id);
                }
                Alarm::Throttle(id) => {
                    let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id)
                    else {
                        continue;
                    };
                    if slot.conn.throttle_timer == Some(seq) {
                        slot.conn.throttle_timer = None;
                        slot.conn.flags.remove(ConnFlags::NOWR);
                        self.touched.insert(id);
                    }
                }
                Alarm::Query(qid) => {
                    let Some(owner) = self.cx.queries.expired_owner(qid, seq) else {
                        continue;
                    };
                    QUERIES_EXPIRED.increment();
                    self.expire_query(qid, owner);
                }
            }
        }
    }

    fn expire_query(&mut self, qid: QueryId, owner: QueryOwner) {
        match owner {
            QueryOwner::Connection(id) => {
                let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id) else {
                    return;
                };
                let Slot { conn, state, .. } = slot;
                let Some(query) = self.cx.queries.remove(&mut conn.queries, qid) else {
                    return;
                };
                tracing::debug!(conn = %id, tag = query.tag, "query timed out");
                self.proto.query_finished(
                    Some((conn, state)),
                    owner,
                    query.tag,
                    QueryOutcome::Timeout,
                    &mut self.cx,
                );
                self.touched.insert(id);
            }
            QueryOwner::Target(tid) => {
                let Some(t) = self.targets.get_mut(tid) else {
                    return;
                };
                let Some(query) = self.cx.queries.remove(&mut t.queries, qid) else {
                    return;
                };
                tracing::debug!(target_id = %tid, tag = query.tag, "target query timed out");
                self.proto
                    .query_finished(None, owner, query.tag, QueryOutcome::Timeout, &mut self.cx);
                self.targets.try_free(tid);
            }
        }
    }

    /// Flush, read, parse and flush one connection.
    fn service(&mut self, id: ConnId) {
        let read_hint = self.cx.config.read_hint;
        let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id) else {
            return;
        };
        let Slot { conn, stream, state } = slot;
        if conn.status == ConnStatus::Connecting || conn.close_deferred {
            return;
        }

        flush(conn, stream, &mut self.cx);
        match fill(conn, stream, read_hint) {
            Fill::Backpressure => {
                READ_BACKPRESSURE.increment();
                self.read_retry.insert(id);
            }
            Fill::Eof => tracing::trace!(conn = %id, "peer closed"),
            Fill::Open => {}
        }
        run_parser(&mut self.proto, conn, state, &mut self.cx);
        flush(conn, stream, &mut self.cx);

        if conn.is_outbound()
            && !conn.ready_reported
            && !conn.is_failed()
            && self.proto.check_ready(conn, state) == ReadyState::Ok
        {
            conn.ready_reported = true;
            if let Some(tid) = conn.target() {
                self.targets.record_success(tid);
            }
            tracing::debug!(conn = %id, target_id = ?conn.target(), "outbound connection ready");
        }
    }

    fn close_if_done(&mut self, id: ConnId) {
        let Some(slot) = self.conns.get_mut(id.slot()).filter(|s| s.conn.id() == id) else {
            return;
        };
        let conn = &mut slot.conn;
        if conn.peer_closed && !conn.status.is_suspended() && !conn.input.is_empty() {
            // A partial packet can never complete.
            conn.fail(ERR_PEER_CLOSED);
        }
        let done = conn.is_failed()
            || conn.status == ConnStatus::Error
            || (conn.status == ConnStatus::WriteClose && !conn.has_wire_output())
            || (conn.peer_closed && !conn.status.is_suspended());
        if !done {
            return;
        }

        if conn.is_ignored() {
            if !conn.close_deferred {
                conn.close_deferred = true;
                if let Err(e) = self.poll.registry().reregister(
                    slot.stream.source(),
                    Token(id.slot()),
                    Interest::READABLE,
                ) {
                    tracing::debug!(conn = %id, "reregister failed: {e}");
                }
                tracing::debug!(conn = %id, "close deferred by critical section");
            }
            return;
        }

        self.close_connection(id);
    }

    fn close_connection(&mut self, id: ConnId) {
        if !self.contains(id) {
            return;
        }
        let mut slot = self.conns.remove(id.slot());
        let Slot { conn, stream, state } = &mut slot;

        for query in self.cx.queries.drain(&mut conn.queries) {
            self.proto.query_finished(
                Some((&mut *conn, &mut *state)),
                query.owner,
                query.tag,
                QueryOutcome::Aborted,
                &mut self.cx,
            );
        }
        self.proto.close(conn, state, &mut self.cx);

        if let Err(e) = self.poll.registry().deregister(stream.source()) {
            tracing::debug!(conn = %id, "deregister failed: {e}");
        }
        self.read_retry.remove(&id);

        if let Some(tid) = conn.target() {
            let now = self.cx.now;
            if let Some(t) = self.targets.get_mut(tid) {
                t.conns.retain(|c| *c != id);
                if conn.ready_reported {
                    t.active_outbound_connections = t.active_outbound_connections.saturating_sub(1);
                }
            }
            if !conn.ready_reported {
                self.targets.record_failure(tid, now, &mut self.rng);
            }
            self.targets.try_free(tid);
        }

        CONNECTIONS_CLOSED.increment();
        CONNECTIONS_ACTIVE.decrement();
        if conn.error() != 0 {
            CONNECTIONS_FAILED.increment();
        }
        tracing::debug!(
            conn = %id,
            error = conn.error(),
            status = %conn.status,
            "connection closed"
        );
    }
}

/// Status of a connection while no handler runs on it.
///
/// Outbound connections are `Ready` only with nothing buffered in either
/// direction and no query in flight.
fn resting_status(conn: &Connection) -> ConnStatus {
    match conn.kind() {
        ConnKind::Inbound if conn.input.is_empty() => ConnStatus::ExpectQuery,
        ConnKind::Inbound => ConnStatus::ReadingQuery,
        ConnKind::Outbound if !conn.input.is_empty() => ConnStatus::ReadingAnswer,
        ConnKind::Outbound if conn.has_wire_output() => ConnStatus::SendingQuery,
        ConnKind::Outbound if !conn.queries.is_empty() => ConnStatus::WaitAnswer,
        ConnKind::Outbound => ConnStatus::Ready,
    }
}

/// Status a connection returns to after a suspension ends.
fn resume(conn: &mut Connection) {
    conn.status = resting_status(conn);
    conn.reparse();
}

/// Write queued output until the socket blocks, the rate limit is hit or
/// nothing is left.
fn flush<C>(conn: &mut Connection, stream: &mut Stream, cx: &mut Context<C>) {
    if conn.is_failed() {
        return;
    }
    if conn.encrypt_output().is_err() {
        conn.fail(ERR_NO_MEMORY);
        return;
    }

    while !conn.flags.contains(ConnFlags::NOWR) && !conn.wire_out().is_empty() {
        let cap = match conn.rate_limit.as_mut() {
            Some(rl) => {
                let allowance = rl.allowance(cx.now);
                if allowance == 0 {
                    let at = rl.resume_at(cx.now);
                    let id = conn.id();
                    conn.throttle_timer = Some(cx.timers.insert(at, Alarm::Throttle(id)));
                    conn.flags.insert(ConnFlags::NOWR);
                    tracing::trace!(conn = %id, "output throttled");
                    break;
                }
                allowance
            }
            None => usize::MAX,
        };

        let result = if cap == usize::MAX {
            conn.wire_out().write_to(stream)
        } else {
            conn.wire_out().write_to(&mut Capped { inner: stream, cap })
        };

        match result {
            Ok(0) => break,
            Ok(n) => {
                BYTES_WRITTEN.add(n as u64);
                if let Some(rl) = conn.rate_limit.as_mut() {
                    rl.consume(n);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                conn.flags.insert(ConnFlags::NOWR);
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(conn = %conn.id(), "write failed: {e}");
                conn.fail(ERR_IO);
                return;
            }
        }
    }

    if conn.wire_out().is_empty() {
        conn.flags.remove(ConnFlags::WANTWR);
    } else {
        conn.flags.insert(ConnFlags::WANTWR);
    }
    if matches!(
        conn.status,
        ConnStatus::Ready | ConnStatus::SendingQuery | ConnStatus::WaitAnswer
    ) {
        conn.status = resting_status(conn);
    }
}

/// Drain the socket into the raw input queue.
fn fill(conn: &mut Connection, stream: &mut Stream, hint: usize) -> Fill {
    if conn.is_failed() || conn.peer_closed || !conn.flags.contains(ConnFlags::WANTRD) {
        return Fill::Open;
    }
    while !conn.flags.contains(ConnFlags::NORD) {
        match conn.wire_in().read_from(stream, hint) {
            Ok(0) => {
                conn.peer_closed = true;
                conn.flags.remove(ConnFlags::WANTRD);
                return Fill::Eof;
            }
            Ok(n) => {
                BYTES_READ.add(n as u64);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                conn.flags.insert(ConnFlags::NORD);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => return Fill::Backpressure,
            Err(e) => {
                tracing::debug!(conn = %conn.id(), "read failed: {e}");
                conn.fail(ERR_IO);
                break;
            }
        }
    }
    Fill::Open
}

/// Feed buffered input to the protocol until it runs dry, waits for more
/// bytes, suspends or fails.
fn run_parser<T: ConnType>(
    proto: &mut T,
    conn: &mut Connection,
    state: &mut T::State,
    cx: &mut Context<T::Completion>,
) {
    loop {
        if conn.decrypt_input().is_err() {
            conn.fail(ERR_NO_MEMORY);
        }
        if conn.is_failed()
            || conn.status.is_suspended()
            || matches!(conn.status, ConnStatus::WriteClose | ConnStatus::Connecting)
        {
            return;
        }

        if conn.skip_bytes > 0 {
            let skipped = conn.input.skip(conn.skip_bytes);
            conn.skip_bytes -= skipped;
            if conn.skip_bytes > 0 {
                return;
            }
        }

        let reparse = conn.flags.contains(ConnFlags::REPARSE);
        conn.flags.remove(ConnFlags::REPARSE);
        if !reparse && (conn.input.is_empty() || conn.input.len() < conn.need_bytes) {
            return;
        }
        conn.need_bytes = 0;

        let resting = matches!(
            conn.status,
            ConnStatus::ExpectQuery
                | ConnStatus::ReadingQuery
                | ConnStatus::Ready
                | ConnStatus::SendingQuery
                | ConnStatus::WaitAnswer
                | ConnStatus::ReadingAnswer
        );
        if resting {
            conn.status = ConnStatus::Running;
        }

        let result = proto.parse_execute(conn, state, cx);

        if conn.status == ConnStatus::Running {
            conn.status = resting_status(conn);
        }

        match result {
            ParseStatus::Consumed => {}
            ParseStatus::Skip(n) => conn.skip_bytes = n,
            ParseStatus::Need(n) => {
                conn.need_bytes = conn.input.len() + n.max(1);
                if !conn.flags.contains(ConnFlags::REPARSE) {
                    return;
                }
            }
            ParseStatus::NeedMore => {
                conn.need_bytes = conn.input.len() + 1;
                if !conn.flags.contains(ConnFlags::REPARSE) {
                    return;
                }
            }
        }
    }
}
