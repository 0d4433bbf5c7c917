//! The TCP RPC connection type.

use io_net::{
    AesCbcSession, ConnType, Connection, Context, KeyDerivation, KeyExchange, NetError,
    ParseStatus, ProcessId, QueryOutcome, QueryOwner, ReadyState, Sha256Kdf, default_check_ready,
    key_id,
};
use rand::Rng;

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::handshake::{
    CryptoSchema, HandshakeErrorPacket, HandshakeFlags, HandshakePacket, NoncePacket,
};
use crate::metrics::*;
use crate::packet::{
    self, Frame, HANDSHAKE, HANDSHAKE_ERROR, MIN_PACKET_LEN, NONCE, PING, PONG, Packet,
};
use crate::session::{Phase, RpcSession};

/// Query tags with this bit set belong to outstanding pings.
const PING_QUERY_TAG: u64 = 1 << 63;

/// Application callbacks of an RPC endpoint.
pub trait RpcHandler {
    /// Result delivered to a connection suspended by the handler.
    type Completion: Send + 'static;

    /// The handshake completed; application packets may be sent.
    fn ready(
        &mut self,
        _conn: &mut Connection,
        _session: &mut RpcSession,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// An application packet arrived. An error fails the connection.
    fn packet(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<Self::Completion>,
    ) -> Result<(), RpcError>;

    fn wakeup(
        &mut self,
        _conn: &mut Connection,
        _session: &mut RpcSession,
        _completion: Self::Completion,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    /// The peer answered ping `id`.
    fn pong(&mut self, _conn: &mut Connection, _session: &mut RpcSession, _id: u64) {}

    /// A query created by the handler timed out or was aborted.
    fn query_finished(
        &mut self,
        _conn: Option<(&mut Connection, &mut RpcSession)>,
        _owner: QueryOwner,
        _tag: u64,
        _outcome: QueryOutcome,
        _cx: &mut Context<Self::Completion>,
    ) {
    }

    fn closed(&mut self, _conn: &Connection, _session: &RpcSession) {}
}

/// Connection type speaking the framed RPC protocol.
///
/// Outbound connections open the exchange with a nonce; accepted ones
/// answer it. Application packets reach the [`RpcHandler`] only after both
/// the nonce and handshake steps succeed.
pub struct TcpRpc<H> {
    handler: H,
    config: RpcConfig,
    secret: Vec<u8>,
    key_select: u32,
    expected_peer: ProcessId,
    kdf: Box<dyn KeyDerivation>,
}

impl<H: RpcHandler> TcpRpc<H> {
    pub fn new(handler: H, config: RpcConfig) -> Result<Self, RpcError> {
        let secret = config.secret_bytes().to_vec();
        if config.crypto == CryptoSchema::Aes && secret.is_empty() {
            return Err(RpcError::Config("aes requires a secret"));
        }
        if (config.max_packet_len as usize) < MIN_PACKET_LEN {
            return Err(RpcError::Config("max_packet_len is below the minimum packet size"));
        }
        let key_select = if secret.is_empty() { 0 } else { key_id(&secret) };
        Ok(Self {
            handler,
            expected_peer: config.peer.to_pid(),
            config,
            secret,
            key_select,
            kdf: Box::new(Sha256Kdf),
        })
    }

    /// Replace the session key derivation.
    pub fn with_key_derivation(mut self, kdf: impl KeyDerivation + 'static) -> Self {
        self.kdf = Box::new(kdf);
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Key selector advertised in nonces; zero without a secret.
    pub fn key_select(&self) -> u32 {
        self.key_select
    }

    /// Schema this side can actually use, given whether it has a secret.
    fn local_schema(&self) -> CryptoSchema {
        match self.config.crypto {
            CryptoSchema::NoneOrAes if self.secret.is_empty() => CryptoSchema::None,
            schema => schema,
        }
    }

    /// Pick the schema for an incoming nonce. AES wins when both sides
    /// allow it and the key and timestamp check out. Plaintext is only
    /// chosen when both sides allow it.
    fn choose_schema(&self, nonce: &NoncePacket, now: u64) -> Result<CryptoSchema, RpcError> {
        let local = self.local_schema();
        let plaintext = nonce.schema.allows_plaintext() && local.allows_plaintext();

        if nonce.schema.allows_aes() && local.allows_aes() {
            let skew = (now as i64 - i64::from(nonce.crypto_ts)).unsigned_abs();
            let problem = if nonce.key_select != self.key_select {
                Some("unknown key")
            } else if skew > u64::from(self.config.max_clock_skew_secs) {
                Some("timestamp outside the accepted window")
            } else {
                None
            };
            match problem {
                None => return Ok(CryptoSchema::Aes),
                Some(reason) if !plaintext => return Err(RpcError::NonceRejected(reason)),
                Some(reason) => tracing::debug!("aes not possible, using plaintext: {reason}"),
            }
        }

        if plaintext {
            Ok(CryptoSchema::None)
        } else {
            Err(RpcError::NonceRejected("no common crypto schema"))
        }
    }

    fn start_encryption(
        &self,
        conn: &mut Connection,
        session: &RpcSession,
    ) -> Result<(), RpcError> {
        let is_client = conn.is_outbound();
        let (client_addr, server_addr) = if is_client {
            (conn.local_addr(), conn.remote_addr())
        } else {
            (conn.remote_addr(), conn.local_addr())
        };
        let keys = self.kdf.derive(&KeyExchange {
            secret: &self.secret,
            client_nonce: session.client_nonce,
            server_nonce: session.server_nonce,
            timestamp: session.crypto_ts,
            client_addr,
            server_addr,
            is_client,
        });
        let cipher = AesCbcSession::new(&keys)?;
        conn.enable_crypto(Box::new(cipher))?;
        Ok(())
    }

    fn dispatch(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        RPC_PACKETS_RECEIVED.increment();

        if packet.ty == HANDSHAKE_ERROR && !session.is_ready() {
            let notice = HandshakeErrorPacket::decode(&packet.payload.to_vec())?;
            return Err(RpcError::PeerHandshake(notice.error_code));
        }

        session.accept_seq(packet.seq)?;
        conn.touch(cx.now());

        match (session.phase, conn.is_outbound()) {
            (Phase::AwaitNonce, false) => self.accept_nonce(conn, session, packet, cx),
            (Phase::AwaitNonce, true) => self.nonce_reply(conn, session, packet, cx),
            (Phase::AwaitHandshake, false) => self.accept_handshake(conn, session, packet, cx),
            (Phase::AwaitHandshake, true) => self.handshake_reply(conn, session, packet, cx),
            (Phase::Ready, _) => self.application(conn, session, packet, cx),
            (Phase::Connecting, _) => Err(RpcError::UnexpectedPacket(packet.ty)),
        }
    }

    fn accept_nonce(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        expect_type(&packet, NONCE)?;
        let nonce = NoncePacket::decode(&packet.payload.to_vec())?;
        let schema = self.choose_schema(&nonce, cx.unix_time())?;

        session.client_nonce = nonce.nonce;
        session.crypto_ts = nonce.crypto_ts;
        rand::rng().fill(&mut session.server_nonce);

        let reply = NoncePacket {
            key_select: if schema == CryptoSchema::Aes {
                self.key_select
            } else {
                0
            },
            schema,
            crypto_ts: nonce.crypto_ts,
            nonce: session.server_nonce,
        };
        session.send_bytes(conn, NONCE, &reply.encode())?;

        // The reply is still queued and goes out as plaintext.
        if schema == CryptoSchema::Aes {
            self.start_encryption(conn, session)?;
        }
        session.schema = schema;
        session.phase = Phase::AwaitHandshake;
        tracing::debug!(conn = %conn.id(), %schema, "nonce accepted");
        Ok(())
    }

    fn nonce_reply(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        expect_type(&packet, NONCE)?;
        let reply = NoncePacket::decode(&packet.payload.to_vec())?;
        let offered = self.local_schema();

        match reply.schema {
            CryptoSchema::Aes => {
                if !offered.allows_aes() {
                    return Err(RpcError::NonceRejected("peer selected encryption"));
                }
                if reply.key_select != self.key_select {
                    return Err(RpcError::NonceRejected("peer selected a different key"));
                }
                session.server_nonce = reply.nonce;
                self.start_encryption(conn, session)?;
            }
            CryptoSchema::None => {
                if !offered.allows_plaintext() {
                    return Err(RpcError::NonceRejected("peer refused encryption"));
                }
            }
            CryptoSchema::NoneOrAes => return Err(RpcError::Malformed("nonce")),
        }
        session.schema = reply.schema;

        let hs = HandshakePacket {
            flags: self.config.supported_flags(),
            sender_pid: *cx.identity(),
            peer_pid: self.expected_peer,
        };
        session.send_bytes(conn, HANDSHAKE, &hs.encode())?;
        session.phase = Phase::AwaitHandshake;
        Ok(())
    }

    fn verify_identities(&self, hs: &HandshakePacket, local: &ProcessId) -> Result<(), RpcError> {
        if !local.matches(&hs.peer_pid) {
            return Err(RpcError::HandshakeRejected("peer expects another process"));
        }
        if !hs.sender_pid.matches(&self.expected_peer) {
            return Err(RpcError::HandshakeRejected("unexpected peer identity"));
        }
        Ok(())
    }

    fn accept_handshake(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        expect_type(&packet, HANDSHAKE)?;
        let hs = HandshakePacket::decode(&packet.payload.to_vec())?;
        self.verify_identities(&hs, cx.identity())?;

        let flags = hs.flags & self.config.supported_flags();
        let reply = HandshakePacket {
            flags,
            sender_pid: *cx.identity(),
            peer_pid: hs.sender_pid,
        };
        session.send_bytes(conn, HANDSHAKE, &reply.encode())?;
        self.established(conn, session, flags, hs.sender_pid, cx);
        Ok(())
    }

    fn handshake_reply(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        expect_type(&packet, HANDSHAKE)?;
        let hs = HandshakePacket::decode(&packet.payload.to_vec())?;
        self.verify_identities(&hs, cx.identity())?;
        if !self.config.supported_flags().contains(hs.flags) {
            return Err(RpcError::HandshakeRejected("peer enabled unrequested flags"));
        }
        self.established(conn, session, hs.flags, hs.sender_pid, cx);
        Ok(())
    }

    fn established(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        flags: HandshakeFlags,
        peer: ProcessId,
        cx: &mut Context<H::Completion>,
    ) {
        session.establish(flags, peer);
        RPC_HANDSHAKES.increment();
        if session.schema == CryptoSchema::Aes {
            RPC_HANDSHAKES_ENCRYPTED.increment();
        }
        tracing::info!(
            conn = %conn.id(),
            remote = ?conn.remote_addr(),
            %peer,
            schema = %session.schema,
            checksum = %session.checksum,
            "rpc session established"
        );

        if conn.is_outbound() {
            if let Some(interval) = self.config.ping_interval() {
                cx.set_alarm(conn, interval);
            }
        }
        self.handler.ready(conn, session, cx);
    }

    fn application(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        match packet.ty {
            PING => {
                if packet.payload.len() != 8 {
                    return Err(RpcError::Malformed("ping"));
                }
                session.send(conn, PONG, packet.payload)
            }
            PONG => {
                let mut id = [0u8; 8];
                if packet.payload.len() != id.len() {
                    return Err(RpcError::Malformed("pong"));
                }
                packet.payload.fetch_lookup(&mut id);
                let id = u64::from_le_bytes(id);
                RPC_PONGS_RECEIVED.increment();
                if cx.finish_query_by_tag(conn, PING_QUERY_TAG | id).is_none() {
                    tracing::trace!(conn = %conn.id(), id, "late or unsolicited pong");
                }
                self.handler.pong(conn, session, id);
                Ok(())
            }
            NONCE | HANDSHAKE | HANDSHAKE_ERROR => {
                Err(RpcError::UnexpectedPacket(packet.ty))
            }
            _ => self.handler.packet(conn, session, packet, cx),
        }
    }

    fn send_ping(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        cx: &mut Context<H::Completion>,
    ) -> Result<(), RpcError> {
        let id = session.next_ping & !PING_QUERY_TAG;
        session.next_ping = session.next_ping.wrapping_add(1);
        session.send_bytes(conn, PING, &id.to_le_bytes())?;
        cx.create_query(conn, PING_QUERY_TAG | id, Some(self.config.ping_timeout()));
        RPC_PINGS_SENT.increment();
        Ok(())
    }

    /// Fail the connection for `err`. Negotiation failures are reported to
    /// the peer with a `HANDSHAKE_ERROR` before the connection closes.
    fn abort(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        err: RpcError,
    ) {
        let code = err.code();
        if err.is_negotiation_failure() {
            RPC_HANDSHAKE_FAILURES.increment();
            tracing::warn!(conn = %conn.id(), remote = ?conn.remote_addr(), "rpc handshake failed: {err}");
            let notice = HandshakeErrorPacket { error_code: code };
            match session.send_bytes(conn, HANDSHAKE_ERROR, &notice.encode()) {
                Ok(()) => conn.fail_after_flush(code),
                Err(_) => conn.fail(code),
            }
            return;
        }

        match err {
            RpcError::PeerHandshake(_) => {
                RPC_HANDSHAKE_FAILURES.increment();
                tracing::warn!(conn = %conn.id(), remote = ?conn.remote_addr(), "{err}");
            }
            _ => {
                RPC_PROTOCOL_ERRORS.increment();
                tracing::debug!(conn = %conn.id(), phase = ?session.phase, "rpc protocol error: {err}");
            }
        }
        conn.fail(code);
    }
}

fn expect_type(packet: &Packet, ty: u32) -> Result<(), RpcError> {
    if packet.ty == ty {
        Ok(())
    } else {
        Err(RpcError::UnexpectedPacket(packet.ty))
    }
}

impl<H: RpcHandler> ConnType for TcpRpc<H> {
    type State = RpcSession;
    type Completion = H::Completion;

    fn name(&self) -> &'static str {
        "tcp-rpc"
    }

    fn init_accepted(
        &mut self,
        _conn: &mut Connection,
        _cx: &mut Context<H::Completion>,
    ) -> Result<RpcSession, NetError> {
        Ok(RpcSession::new(Phase::AwaitNonce))
    }

    fn init_outbound(
        &mut self,
        _conn: &mut Connection,
        _cx: &mut Context<H::Completion>,
    ) -> Result<RpcSession, NetError> {
        let mut session = RpcSession::new(Phase::Connecting);
        rand::rng().fill(&mut session.client_nonce);
        Ok(session)
    }

    fn connected(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        cx: &mut Context<H::Completion>,
    ) {
        let schema = self.local_schema();
        session.crypto_ts = cx.unix_time() as u32;
        session.phase = Phase::AwaitNonce;

        let nonce = NoncePacket {
            key_select: if schema.allows_aes() {
                self.key_select
            } else {
                0
            },
            schema,
            crypto_ts: session.crypto_ts,
            nonce: session.client_nonce,
        };
        if let Err(e) = session.send_bytes(conn, NONCE, &nonce.encode()) {
            self.abort(conn, session, e);
        }
    }

    fn parse_execute(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        cx: &mut Context<H::Completion>,
    ) -> ParseStatus {
        let frame = packet::decode(
            &mut conn.input,
            session.checksum,
            self.config.max_packet_len,
        );
        let result = match frame {
            Ok(Frame::Need(n)) => return ParseStatus::Need(n),
            Ok(Frame::Filler) => return ParseStatus::Consumed,
            Ok(Frame::Packet(packet)) => self.dispatch(conn, session, packet, cx),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.abort(conn, session, e);
        }
        ParseStatus::Consumed
    }

    fn alarm(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        cx: &mut Context<H::Completion>,
    ) {
        if !session.is_ready() || conn.is_failed() {
            return;
        }
        let Some(interval) = self.config.ping_interval() else {
            return;
        };
        if let Err(e) = self.send_ping(conn, session, cx) {
            self.abort(conn, session, e);
            return;
        }
        cx.set_alarm(conn, interval);
    }

    fn wakeup(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        completion: H::Completion,
        cx: &mut Context<H::Completion>,
    ) {
        self.handler.wakeup(conn, session, completion, cx);
    }

    fn query_finished(
        &mut self,
        conn: Option<(&mut Connection, &mut RpcSession)>,
        owner: QueryOwner,
        tag: u64,
        outcome: QueryOutcome,
        cx: &mut Context<H::Completion>,
    ) {
        if tag & PING_QUERY_TAG == 0 {
            self.handler.query_finished(conn, owner, tag, outcome, cx);
            return;
        }
        if let (QueryOutcome::Timeout, Some((conn, session))) = (outcome, conn) {
            RPC_PING_TIMEOUTS.increment();
            let id = tag & !PING_QUERY_TAG;
            self.abort(conn, session, RpcError::PingTimeout(id));
        }
    }

    fn check_ready(&self, conn: &Connection, session: &RpcSession) -> ReadyState {
        match default_check_ready(conn) {
            ReadyState::Ok if !session.is_ready() => ReadyState::NotYet,
            state => state,
        }
    }

    fn close(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        _cx: &mut Context<H::Completion>,
    ) {
        tracing::debug!(
            conn = %conn.id(),
            error = conn.error(),
            phase = ?session.phase,
            "rpc connection closed"
        );
        self.handler.closed(conn, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl RpcHandler for Nop {
        type Completion = ();

        fn packet(
            &mut self,
            _conn: &mut Connection,
            _session: &mut RpcSession,
            _packet: Packet,
            _cx: &mut Context<()>,
        ) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn rpc(toml: &str) -> TcpRpc<Nop> {
        TcpRpc::new(Nop, toml::from_str(toml).unwrap()).unwrap()
    }

    fn nonce(rpc: &TcpRpc<Nop>, schema: CryptoSchema, ts: u32) -> NoncePacket {
        NoncePacket {
            key_select: rpc.key_select(),
            schema,
            crypto_ts: ts,
            nonce: [1; 16],
        }
    }

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn aes_without_secret_is_a_config_error() {
        let config = toml::from_str("crypto = \"aes\"").unwrap();
        assert!(matches!(
            TcpRpc::new(Nop, config),
            Err(RpcError::Config(_))
        ));
    }

    #[test]
    fn aes_chosen_when_keys_and_clock_agree() {
        let server = rpc("secret = \"s3cret\"");
        let n = nonce(&server, CryptoSchema::Aes, NOW as u32 + 30);
        assert_eq!(server.choose_schema(&n, NOW).unwrap(), CryptoSchema::Aes);
    }

    #[test]
    fn stale_timestamp_rejects_strict_aes() {
        let server = rpc("secret = \"s3cret\"");
        let n = nonce(&server, CryptoSchema::Aes, NOW as u32 - 31);
        assert!(matches!(
            server.choose_schema(&n, NOW),
            Err(RpcError::NonceRejected(_))
        ));
    }

    #[test]
    fn none_or_aes_falls_back_to_plaintext() {
        let server = rpc("secret = \"s3cret\"");
        let mut n = nonce(&server, CryptoSchema::NoneOrAes, NOW as u32);
        n.key_select ^= 1;
        assert_eq!(server.choose_schema(&n, NOW).unwrap(), CryptoSchema::None);
    }

    #[test]
    fn strict_server_refuses_plaintext() {
        let server = rpc("crypto = \"aes\"\nsecret = \"s3cret\"");
        let n = nonce(&server, CryptoSchema::None, NOW as u32);
        assert!(server.choose_schema(&n, NOW).is_err());
    }

    #[test]
    fn keyless_server_speaks_plaintext_only() {
        let server = rpc("");
        assert_eq!(server.local_schema(), CryptoSchema::None);
        let n = nonce(&server, CryptoSchema::NoneOrAes, NOW as u32);
        assert_eq!(server.choose_schema(&n, NOW).unwrap(), CryptoSchema::None);
        let n = nonce(&server, CryptoSchema::Aes, NOW as u32);
        assert!(server.choose_schema(&n, NOW).is_err());
    }

    #[test]
    fn identity_checks() {
        let local = ProcessId {
            ip: 1,
            port: 2,
            pid: 3,
            utime: 4,
        };
        let server = rpc("[peer]\nport = 9");
        let mut hs = HandshakePacket {
            flags: HandshakeFlags::empty(),
            sender_pid: ProcessId {
                port: 9,
                ..local
            },
            peer_pid: ProcessId {
                pid: 3,
                ..Default::default()
            },
        };
        assert!(server.verify_identities(&hs, &local).is_ok());

        hs.peer_pid.pid = 4;
        assert!(server.verify_identities(&hs, &local).is_err());

        hs.peer_pid.pid = 0;
        hs.sender_pid.port = 10;
        assert!(server.verify_identities(&hs, &local).is_err());
    }
}
