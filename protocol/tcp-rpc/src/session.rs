//! Per-connection protocol state.

use io_msgbuf::{ChecksumKind, RawMessage};
use io_net::{Connection, NONCE_LEN, ProcessId};

use crate::error::RpcError;
use crate::handshake::{CryptoSchema, HandshakeFlags};
use crate::metrics::RPC_PACKETS_SENT;
use crate::packet::{self, SEQ_NONCE};

/// Where a session is in the nonce/handshake exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Outbound socket still connecting.
    Connecting,
    /// Waiting for the peer's nonce.
    AwaitNonce,
    /// Nonces exchanged, waiting for the peer's handshake.
    AwaitHandshake,
    /// Application traffic allowed.
    Ready,
}

#[derive(Debug)]
pub struct RpcSession {
    pub(crate) phase: Phase,
    pub(crate) in_seq: i32,
    pub(crate) out_seq: i32,
    pub(crate) checksum: ChecksumKind,
    pub(crate) schema: CryptoSchema,
    pub(crate) flags: HandshakeFlags,
    pub(crate) client_nonce: [u8; NONCE_LEN],
    pub(crate) server_nonce: [u8; NONCE_LEN],
    pub(crate) crypto_ts: u32,
    pub(crate) peer: ProcessId,
    pub(crate) next_ping: u64,
}

impl RpcSession {
    pub(crate) fn new(phase: Phase) -> Self {
        Self {
            phase,
            in_seq: SEQ_NONCE,
            out_seq: SEQ_NONCE,
            checksum: ChecksumKind::Crc32,
            schema: CryptoSchema::None,
            flags: HandshakeFlags::empty(),
            client_nonce: [0; NONCE_LEN],
            server_nonce: [0; NONCE_LEN],
            crypto_ts: 0,
            peer: ProcessId::default(),
            next_ping: 0,
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Negotiated capabilities; empty until the handshake completes.
    #[inline]
    pub fn flags(&self) -> HandshakeFlags {
        self.flags
    }

    #[inline]
    pub fn checksum(&self) -> ChecksumKind {
        self.checksum
    }

    /// Encryption selected by the nonce exchange.
    #[inline]
    pub fn schema(&self) -> CryptoSchema {
        self.schema
    }

    /// Identity the peer presented in its handshake.
    #[inline]
    pub fn peer(&self) -> &ProcessId {
        &self.peer
    }

    /// Sequence number the next outgoing packet will carry.
    #[inline]
    pub fn out_seq(&self) -> i32 {
        self.out_seq
    }

    /// Frame `payload` as a packet of type `ty` and queue it.
    pub fn send(
        &mut self,
        conn: &mut Connection,
        ty: u32,
        payload: RawMessage,
    ) -> Result<(), RpcError> {
        let frame = packet::encode(self.out_seq, ty, payload, self.checksum)?;
        self.out_seq = self.out_seq.wrapping_add(1);
        conn.send(frame)?;
        packet::pad_output(conn)?;
        RPC_PACKETS_SENT.increment();
        Ok(())
    }

    /// Like [`send`](Self::send), copying the payload from a slice.
    pub fn send_bytes(
        &mut self,
        conn: &mut Connection,
        ty: u32,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        let payload = RawMessage::from_slice(conn.output.allocator(), payload)?;
        self.send(conn, ty, payload)
    }

    /// Check an incoming sequence number and advance the expected one.
    /// Once unordered delivery is negotiated only handshake packets are
    /// checked.
    pub(crate) fn accept_seq(&mut self, seq: i32) -> Result<(), RpcError> {
        let ordered = self.in_seq < 0 || !self.flags.contains(HandshakeFlags::UNORDERED);
        if ordered && seq != self.in_seq {
            return Err(RpcError::BadSequence {
                expected: self.in_seq,
                got: seq,
            });
        }
        self.in_seq = self.in_seq.wrapping_add(1);
        Ok(())
    }

    /// Record the handshake outcome. From here on packets use the
    /// negotiated checksum.
    pub(crate) fn establish(&mut self, flags: HandshakeFlags, peer: ProcessId) {
        self.phase = Phase::Ready;
        self.flags = flags;
        self.peer = peer;
        self.checksum = if flags.contains(HandshakeFlags::CRC32C) {
            ChecksumKind::Crc32c
        } else {
            ChecksumKind::Crc32
        };
    }
}
