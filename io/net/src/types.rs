//! Identifiers, connection states and flags.

/// Connection identifier.
///
/// Packs the slab slot (lower 32 bits) with a generation counter (upper 32
/// bits), so a stale id is detected after its slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    /// Slot index in the connection table.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.slot(), self.generation())
    }
}

/// Target identifier, slot plus generation like [`ConnId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.{}", self.slot(), self.generation())
    }
}

/// Listener identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) usize);

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnStatus {
    /// Slot is unused.
    #[default]
    None,
    /// Inbound connection waiting for a request.
    ExpectQuery,
    /// Inbound connection with a partial request buffered.
    ReadingQuery,
    /// A protocol handler is executing.
    Running,
    /// Suspended until outstanding external completions arrive.
    WaitAio,
    /// Suspended until another connection delivers a result.
    WaitNet,
    /// Outbound socket whose connect has not completed.
    Connecting,
    /// Outbound connection with nothing buffered and no query in flight.
    Ready,
    /// Outbound connection with output not yet written to the socket.
    SendingQuery,
    /// Outbound connection with queries in flight.
    WaitAnswer,
    /// Outbound connection with a partial response buffered.
    ReadingAnswer,
    /// Failed; closed on the next loop pass.
    Error,
    /// Suspended until the connection alarm fires.
    WaitTimeout,
    /// Flush pending output, then close.
    WriteClose,
}

impl ConnStatus {
    /// True while a handler waits for something other than socket input.
    #[inline]
    pub fn is_suspended(self) -> bool {
        matches!(self, Self::WaitAio | Self::WaitNet | Self::WaitTimeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ExpectQuery => "expect_query",
            Self::ReadingQuery => "reading_query",
            Self::Running => "running",
            Self::WaitAio => "wait_aio",
            Self::WaitNet => "wait_net",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::SendingQuery => "sending_query",
            Self::WaitAnswer => "wait_answer",
            Self::ReadingAnswer => "reading_answer",
            Self::Error => "error",
            Self::WaitTimeout => "wait_timeout",
            Self::WriteClose => "write_close",
        }
    }
}

impl std::fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Per-connection flags, orthogonal to [`ConnStatus`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u32 {
        /// Interested in reading.
        const WANTRD = 1 << 0;
        /// Interested in writing.
        const WANTWR = 1 << 1;
        /// Reading would block.
        const NORD = 1 << 2;
        /// Writing would block or is throttled.
        const NOWR = 1 << 3;
        /// Fatal error; the connection will be closed.
        const FAILED = 1 << 4;
        /// Run the parser again even without new input.
        const REPARSE = 1 << 5;
        /// Buffers are zero-copy message chains.
        const RAWMSG = 1 << 6;
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Inbound,
    Outbound,
}

/// Readiness of an outbound connection, as reported by its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Usable for new requests.
    Ok,
    /// Still connecting or handshaking.
    NotYet,
    /// Usable but saturated.
    Busy,
    /// Shutting down gracefully.
    Stopped,
    /// Unusable.
    Failed,
}

/// Result of one protocol parser invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A packet was consumed; call again.
    Consumed,
    /// Call again once this many more bytes are buffered.
    Need(usize),
    /// Discard this many bytes, then call again.
    Skip(usize),
    /// Call again once at least one more byte is buffered.
    NeedMore,
}
