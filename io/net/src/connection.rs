//! Per-socket connection state.

use std::net::SocketAddr;
use std::time::Instant;

use io_msgbuf::{BufferAllocator, MessageError, RawMessage};

use crate::crypto::SessionCipher;
use crate::list::ListHead;
use crate::ratelimit::RateLimiter;
use crate::types::{ConnFlags, ConnId, ConnKind, ConnStatus, TargetId};

/// Error code recorded when the peer closes the socket.
pub const ERR_PEER_CLOSED: i32 = -1;
/// Error code recorded on a socket I/O failure.
pub const ERR_IO: i32 = -2;
/// Error code recorded when an outbound connect fails.
pub const ERR_CONNECT: i32 = -3;
/// Error code recorded when buffers cannot be allocated for a transform.
pub const ERR_NO_MEMORY: i32 = -4;

/// State of one connection, shared between the engine and its protocol.
///
/// Received bytes land in `input` (after decryption, if a session cipher is
/// installed). Bytes queued on `output` are encrypted and written by the
/// engine after every protocol callback.
pub struct Connection {
    id: ConnId,
    kind: ConnKind,
    pub status: ConnStatus,
    pub flags: ConnFlags,
    error: i32,

    pub input: RawMessage,
    pub output: RawMessage,
    crypto_in: RawMessage,
    crypto_out: RawMessage,
    cipher: Option<Box<dyn SessionCipher>>,

    target: Option<TargetId>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,

    pending_queries: u32,
    ignored: bool,
    pub(crate) close_deferred: bool,
    pub(crate) peer_closed: bool,
    pub(crate) ready_reported: bool,

    created: Instant,
    last_response_time: Instant,

    pub(crate) need_bytes: usize,
    pub(crate) skip_bytes: usize,
    pub(crate) queries: ListHead,
    pub(crate) alarm: Option<u64>,
    pub(crate) throttle_timer: Option<u64>,
    pub(crate) rate_limit: Option<RateLimiter>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        kind: ConnKind,
        alloc: &BufferAllocator,
        target: Option<TargetId>,
        now: Instant,
    ) -> Self {
        let status = match kind {
            ConnKind::Inbound => ConnStatus::ExpectQuery,
            ConnKind::Outbound => ConnStatus::Connecting,
        };
        Self {
            id,
            kind,
            status,
            flags: ConnFlags::WANTRD | ConnFlags::RAWMSG,
            error: 0,
            input: RawMessage::new(alloc),
            output: RawMessage::new(alloc),
            crypto_in: RawMessage::new(alloc),
            crypto_out: RawMessage::new(alloc),
            cipher: None,
            target,
            local_addr: None,
            remote_addr: None,
            pending_queries: 0,
            ignored: false,
            close_deferred: false,
            peer_closed: false,
            ready_reported: false,
            created: now,
            last_response_time: now,
            need_bytes: 0,
            skip_bytes: 0,
            queries: ListHead::default(),
            alarm: None,
            throttle_timer: None,
            rate_limit: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    #[inline]
    pub fn is_outbound(&self) -> bool {
        self.kind == ConnKind::Outbound
    }

    /// Target this outbound connection belongs to.
    #[inline]
    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_addrs(&mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        self.local_addr = local;
        self.remote_addr = remote;
    }

    /// Error code of a failed connection, zero otherwise.
    #[inline]
    pub fn error(&self) -> i32 {
        self.error
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.flags.contains(ConnFlags::FAILED)
    }

    /// Mark the connection failed with `code`. It is closed on the next loop
    /// pass unless inside a critical section. The first code is kept.
    pub fn fail(&mut self, code: i32) {
        if self.is_failed() {
            return;
        }
        tracing::debug!(conn = %self.id, code, status = %self.status, "connection failed");
        self.flags.insert(ConnFlags::FAILED);
        self.flags.remove(ConnFlags::WANTRD | ConnFlags::WANTWR);
        self.status = ConnStatus::Error;
        self.error = code;
    }

    /// Flush what is queued, then close.
    pub fn close_after_flush(&mut self) {
        if !self.is_failed() {
            self.status = ConnStatus::WriteClose;
            self.flags.remove(ConnFlags::WANTRD);
        }
    }

    /// Flush what is queued, then close, reporting `code` as the error.
    pub fn fail_after_flush(&mut self, code: i32) {
        if self.is_failed() {
            return;
        }
        if self.error == 0 {
            self.error = code;
        }
        self.close_after_flush();
    }

    /// Queue `msg` for sending.
    pub fn send(&mut self, msg: RawMessage) -> Result<(), MessageError> {
        self.output.append(msg)?;
        self.flags.insert(ConnFlags::WANTWR);
        Ok(())
    }

    /// Queue a copy of `data` for sending.
    pub fn write(&mut self, data: &[u8]) -> Result<(), MessageError> {
        self.output.push_data(data)?;
        self.flags.insert(ConnFlags::WANTWR);
        Ok(())
    }

    /// Ask the engine to run the parser again without new input.
    #[inline]
    pub fn reparse(&mut self) {
        self.flags.insert(ConnFlags::REPARSE);
    }

    #[inline]
    pub fn pending_queries(&self) -> u32 {
        self.pending_queries
    }

    pub(crate) fn add_pending(&mut self) {
        self.pending_queries += 1;
    }

    /// Returns true when the last outstanding completion arrived.
    pub(crate) fn complete_pending(&mut self) -> bool {
        self.pending_queries = self.pending_queries.saturating_sub(1);
        self.pending_queries == 0
    }

    /// True while a caller holds the connection in a critical section.
    #[inline]
    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub(crate) fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }

    #[inline]
    pub fn created(&self) -> Instant {
        self.created
    }

    #[inline]
    pub fn last_response_time(&self) -> Instant {
        self.last_response_time
    }

    /// Record that the peer is alive.
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_response_time = now;
    }

    /// Install a session cipher.
    ///
    /// Buffered input that has not been parsed yet is ciphertext and moves
    /// back to the raw input queue. Output that has not been flushed yet was
    /// produced before the switch and is sent as is.
    pub fn enable_crypto(&mut self, cipher: Box<dyn SessionCipher>) -> Result<(), MessageError> {
        let mut raw_in = self.input.take();
        raw_in.append(self.crypto_in.take())?;
        self.crypto_in = raw_in;
        self.crypto_out.append(self.output.take())?;
        self.cipher = Some(cipher);
        if !self.crypto_in.is_empty() {
            self.reparse();
        }
        Ok(())
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Padding needed after `len` bytes of output to reach a cipher block
    /// boundary; zero without encryption.
    pub fn padding_for(&self, len: usize) -> usize {
        self.cipher.as_ref().map_or(0, |c| c.padding_for(len))
    }

    /// Bytes that must still be queued before the output can be encrypted.
    pub fn needed_output_bytes(&self) -> usize {
        self.padding_for(self.output.len())
    }

    /// Buffer socket reads land in.
    pub(crate) fn wire_in(&mut self) -> &mut RawMessage {
        if self.cipher.is_some() {
            &mut self.crypto_in
        } else {
            &mut self.input
        }
    }

    /// Buffer socket writes drain.
    pub(crate) fn wire_out(&mut self) -> &mut RawMessage {
        if self.cipher.is_some() {
            &mut self.crypto_out
        } else {
            &mut self.output
        }
    }

    pub(crate) fn has_wire_output(&self) -> bool {
        !self.output.is_empty() || !self.crypto_out.is_empty()
    }

    /// Move whole decrypted blocks from the raw input queue to `input`.
    pub(crate) fn decrypt_input(&mut self) -> Result<usize, MessageError> {
        let Some(cipher) = self.cipher.as_mut() else {
            return Ok(0);
        };
        let bs = cipher.block_size();
        let n = self.crypto_in.len() - self.crypto_in.len() % bs;
        if n == 0 {
            return Ok(0);
        }
        let mut chunk = self.crypto_in.split_to(n)?;
        chunk.transform_in_place(n, bs, |blocks| cipher.decrypt(blocks))?;
        self.input.append(chunk)?;
        Ok(n)
    }

    /// Move whole encrypted blocks from `output` to the raw output queue.
    pub(crate) fn encrypt_output(&mut self) -> Result<usize, MessageError> {
        let Some(cipher) = self.cipher.as_mut() else {
            return Ok(0);
        };
        let bs = cipher.block_size();
        let n = self.output.len() - self.output.len() % bs;
        if n == 0 {
            return Ok(0);
        }
        let mut chunk = self.output.split_to(n)?;
        chunk.transform_in_place(n, bs, |blocks| cipher.encrypt(blocks))?;
        self.crypto_out.append(chunk)?;
        Ok(n)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("flags", &self.flags)
            .field("error", &self.error)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesCbcSession, KeyDerivation, KeyExchange, Sha256Kdf};

    fn conn(alloc: &BufferAllocator) -> Connection {
        Connection::new(
            ConnId::with_generation(0, 0),
            ConnKind::Inbound,
            alloc,
            None,
            Instant::now(),
        )
    }

    fn ciphers() -> (AesCbcSession, AesCbcSession) {
        let mut ex = KeyExchange {
            secret: b"k",
            client_nonce: [3; 16],
            server_nonce: [4; 16],
            timestamp: 7,
            client_addr: None,
            server_addr: None,
            is_client: true,
        };
        let client = AesCbcSession::new(&Sha256Kdf.derive(&ex)).unwrap();
        ex.is_client = false;
        let server = AesCbcSession::new(&Sha256Kdf.derive(&ex)).unwrap();
        (client, server)
    }

    #[test]
    fn fail_keeps_first_code() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let mut c = conn(&alloc);
        c.fail(-5);
        c.fail(-6);
        assert_eq!(c.error(), -5);
        assert_eq!(c.status, ConnStatus::Error);
        assert!(!c.flags.contains(ConnFlags::WANTRD));
    }

    #[test]
    fn fail_after_flush_keeps_writing() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let mut c = conn(&alloc);
        c.write(b"bye!").unwrap();
        c.fail_after_flush(-7);
        assert_eq!(c.error(), -7);
        assert_eq!(c.status, ConnStatus::WriteClose);
        assert!(!c.is_failed());
        assert!(c.has_wire_output());
    }

    #[test]
    fn encrypt_then_decrypt_through_queues() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let (client_cipher, server_cipher) = ciphers();
        let mut a = conn(&alloc);
        let mut b = conn(&alloc);

        a.write(b"plaintext queued before the switch").unwrap();
        a.enable_crypto(Box::new(client_cipher)).unwrap();
        b.enable_crypto(Box::new(server_cipher)).unwrap();

        let payload = [0x5au8; 40];
        a.write(&payload).unwrap();
        assert_eq!(a.needed_output_bytes(), 8);
        a.write(&[0x04; 8]).unwrap();
        assert_eq!(a.encrypt_output().unwrap(), 48);
        assert!(a.output.is_empty());

        let mut wire = a.wire_out().take();
        let plain = wire.split_to(34).unwrap();
        assert_eq!(plain.to_vec(), b"plaintext queued before the switch");
        assert_ne!(&wire.to_vec()[..40], &payload[..]);

        b.wire_in().append(wire).unwrap();
        assert_eq!(b.decrypt_input().unwrap(), 48);
        assert_eq!(&b.input.to_vec()[..40], &payload[..]);
    }

    #[test]
    fn enabling_crypto_requeues_unparsed_input() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let (client_cipher, _) = ciphers();
        let mut c = conn(&alloc);
        c.input.push_data(b"ciphertext").unwrap();
        c.enable_crypto(Box::new(client_cipher)).unwrap();
        assert!(c.input.is_empty());
        assert_eq!(c.wire_in().to_vec(), b"ciphertext");
        assert!(c.flags.contains(ConnFlags::REPARSE));
    }
}
