//! The protocol interface and the services the engine offers to it.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use mio::Waker;
use io_msgbuf::{BufferAllocator, RawMessage};

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::error::NetError;
use crate::pid::ProcessId;
use crate::query::{QueryId, QueryOutcome, QueryOwner, QueryTable};
use crate::timer::{Alarm, TimerHeap};
use crate::types::{ConnId, ConnStatus, ParseStatus, ReadyState};

/// Behaviour of one kind of connection.
///
/// Every callback runs synchronously on the engine thread. Output queued on
/// the connection is flushed by the engine after the callback returns.
pub trait ConnType {
    /// Per-connection protocol state.
    type State;

    /// Result delivered to a suspended connection by a [`Completer`].
    type Completion: Send + 'static;

    /// Short name for logs. Also the default connection type of targets
    /// created through this engine.
    fn name(&self) -> &'static str;

    /// A listener accepted `conn`.
    fn init_accepted(
        &mut self,
        conn: &mut Connection,
        cx: &mut Context<Self::Completion>,
    ) -> Result<Self::State, NetError>;

    /// An outbound socket was opened for a target. The connect is still in
    /// progress.
    fn init_outbound(
        &mut self,
        conn: &mut Connection,
        cx: &mut Context<Self::Completion>,
    ) -> Result<Self::State, NetError>;

    /// Consume buffered input from `conn.input`.
    fn parse_execute(
        &mut self,
        conn: &mut Connection,
        state: &mut Self::State,
        cx: &mut Context<Self::Completion>,
    ) -> ParseStatus;

    /// The outbound connect completed.
    fn connected(
        &mut self,
        _conn: &mut Connection,
        _state: &mut Self::State,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// The connection alarm set through [`Context::set_alarm`] fired.
    fn alarm(
        &mut self,
        _conn: &mut Connection,
        _state: &mut Self::State,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// An external completion arrived for a suspended connection.
    fn wakeup(
        &mut self,
        _conn: &mut Connection,
        _state: &mut Self::State,
        _completion: Self::Completion,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// A query ended without being finished by the protocol. `conn` is the
    /// owning connection, if it still exists.
    fn query_finished(
        &mut self,
        _conn: Option<(&mut Connection, &mut Self::State)>,
        _owner: QueryOwner,
        _tag: u64,
        _outcome: QueryOutcome,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// Whether an outbound connection can take requests.
    fn check_ready(&self, conn: &Connection, _state: &Self::State) -> ReadyState {
        default_check_ready(conn)
    }

    /// The connection is about to be closed and freed.
    fn close(
        &mut self,
        _conn: &mut Connection,
        _state: &mut Self::State,
        _cx: &mut Context<Self::Completion>,
    ) {
    }
}

/// Readiness derived from the connection status alone.
pub fn default_check_ready(conn: &Connection) -> ReadyState {
    if conn.is_failed() {
        return ReadyState::Failed;
    }
    match conn.status {
        ConnStatus::Connecting => ReadyState::NotYet,
        ConnStatus::Error => ReadyState::Failed,
        ConnStatus::WriteClose => ReadyState::Stopped,
        _ => ReadyState::Ok,
    }
}

/// Handle that resumes a suspended connection. Can be moved to another
/// thread; delivering consumes it.
pub struct Completer<C> {
    conn: ConnId,
    tx: Sender<(ConnId, C)>,
    waker: Arc<Waker>,
}

impl<C> Completer<C> {
    /// The suspended connection.
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Deliver the result. Returns false if the engine is gone.
    pub fn complete(self, value: C) -> bool {
        if self.tx.send((self.conn, value)).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(conn = %self.conn, "failed to wake engine: {e}");
        }
        true
    }
}

/// Engine services available inside protocol callbacks.
pub struct Context<C> {
    pub(crate) now: Instant,
    pub(crate) alloc: BufferAllocator,
    pub(crate) identity: ProcessId,
    pub(crate) config: NetConfig,
    pub(crate) timers: TimerHeap<Alarm>,
    pub(crate) queries: QueryTable,
    pub(crate) completions: Sender<(ConnId, C)>,
    pub(crate) waker: Arc<Waker>,
}

impl<C> Context<C> {
    /// Time of the current loop iteration.
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Wall clock seconds since the Unix epoch.
    pub fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.alloc
    }

    /// An empty message on this engine's allocator.
    pub fn message(&self) -> RawMessage {
        RawMessage::new(&self.alloc)
    }

    pub fn identity(&self) -> &ProcessId {
        &self.identity
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Arm the connection alarm, replacing any earlier one.
    pub fn set_alarm(&mut self, conn: &mut Connection, after: Duration) {
        let seq = self
            .timers
            .insert(self.now + after, Alarm::Connection(conn.id()));
        conn.alarm = Some(seq);
    }

    /// Disarm the connection alarm. The heap entry stays and is skipped when
    /// it comes due.
    pub fn clear_alarm(&mut self, conn: &mut Connection) {
        conn.alarm = None;
    }

    /// Suspend `conn` until the returned completer delivers. Each call adds
    /// one outstanding completion; processing resumes once all arrived.
    pub fn suspend(&mut self, conn: &mut Connection) -> Completer<C> {
        self.suspend_as(conn, ConnStatus::WaitAio)
    }

    /// Like [`suspend`](Self::suspend), for results coming from another
    /// connection.
    pub fn suspend_net(&mut self, conn: &mut Connection) -> Completer<C> {
        self.suspend_as(conn, ConnStatus::WaitNet)
    }

    fn suspend_as(&mut self, conn: &mut Connection, status: ConnStatus) -> Completer<C> {
        conn.add_pending();
        if !conn.is_failed() {
            conn.status = status;
        }
        Completer {
            conn: conn.id(),
            tx: self.completions.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Track a request sent on `conn`, with an optional deadline.
    pub fn create_query(
        &mut self,
        conn: &mut Connection,
        tag: u64,
        timeout: Option<Duration>,
    ) -> QueryId {
        let deadline = timeout.map(|t| self.now + t);
        let owner = QueryOwner::Connection(conn.id());
        self.queries.insert(
            &mut conn.queries,
            owner,
            tag,
            deadline,
            &mut self.timers,
        )
    }

    /// Finish a query; returns its tag, or `None` if it already ended.
    pub fn finish_query(&mut self, conn: &mut Connection, id: QueryId) -> Option<u64> {
        self.queries.remove(&mut conn.queries, id).map(|q| q.tag)
    }

    /// Finish the oldest query on `conn` whose tag equals `tag`.
    pub fn finish_query_by_tag(&mut self, conn: &mut Connection, tag: u64) -> Option<QueryId> {
        let id = self.queries.find_by_tag(&mut conn.queries, tag)?;
        self.queries.remove(&mut conn.queries, id)?;
        Some(id)
    }

    /// Number of queries anchored on `conn`.
    pub fn query_count(&self, conn: &Connection) -> usize {
        conn.queries.len()
    }
}
