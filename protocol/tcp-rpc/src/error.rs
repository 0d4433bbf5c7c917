use io_msgbuf::MessageError;
use io_net::NetError;

/// Connection error codes reported through [`io_net::Connection::error`].
pub const ERR_BAD_LENGTH: i32 = -101;
pub const ERR_BAD_CHECKSUM: i32 = -102;
pub const ERR_BAD_SEQUENCE: i32 = -103;
pub const ERR_UNALIGNED: i32 = -104;
pub const ERR_UNEXPECTED_PACKET: i32 = -105;
pub const ERR_MALFORMED: i32 = -106;
pub const ERR_NONCE_REJECTED: i32 = -107;
pub const ERR_HANDSHAKE_REJECTED: i32 = -108;
pub const ERR_PEER_HANDSHAKE: i32 = -109;
pub const ERR_PING_TIMEOUT: i32 = -110;
pub const ERR_BUFFER: i32 = -111;
pub const ERR_HANDLER: i32 = -112;

/// Protocol errors. Every variant is fatal for the connection it occurs on.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("invalid packet length {0}")]
    BadLength(u32),
    #[error("checksum mismatch: computed {computed:#010x}, received {received:#010x}")]
    BadChecksum { computed: u32, received: u32 },
    #[error("sequence number {got}, expected {expected}")]
    BadSequence { expected: i32, got: i32 },
    #[error("payload of {0} bytes is not 4-byte aligned")]
    Unaligned(usize),
    #[error("unexpected packet type {0:#010x}")]
    UnexpectedPacket(u32),
    #[error("malformed {0} packet")]
    Malformed(&'static str),
    #[error("nonce rejected: {0}")]
    NonceRejected(&'static str),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("peer reported handshake error {0}")]
    PeerHandshake(i32),
    #[error("ping {0} not answered in time")]
    PingTimeout(u64),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("handler error: {0}")]
    Handler(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Net(#[from] NetError),
}

impl RpcError {
    /// Negative code recorded on the failed connection.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::BadLength(_) => ERR_BAD_LENGTH,
            RpcError::BadChecksum { .. } => ERR_BAD_CHECKSUM,
            RpcError::BadSequence { .. } => ERR_BAD_SEQUENCE,
            RpcError::Unaligned(_) => ERR_UNALIGNED,
            RpcError::UnexpectedPacket(_) => ERR_UNEXPECTED_PACKET,
            RpcError::Malformed(_) => ERR_MALFORMED,
            RpcError::NonceRejected(_) => ERR_NONCE_REJECTED,
            RpcError::HandshakeRejected(_) => ERR_HANDSHAKE_REJECTED,
            RpcError::PeerHandshake(_) => ERR_PEER_HANDSHAKE,
            RpcError::PingTimeout(_) => ERR_PING_TIMEOUT,
            RpcError::Handler(_) => ERR_HANDLER,
            RpcError::Config(_) | RpcError::Message(_) | RpcError::Net(_) => ERR_BUFFER,
        }
    }

    /// Failures the local side answers with a `HANDSHAKE_ERROR` packet.
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(
            self,
            RpcError::NonceRejected(_) | RpcError::HandshakeRejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_negative() {
        let errors = [
            RpcError::BadLength(7),
            RpcError::BadChecksum {
                computed: 1,
                received: 2,
            },
            RpcError::BadSequence {
                expected: 0,
                got: 3,
            },
            RpcError::Unaligned(3),
            RpcError::UnexpectedPacket(9),
            RpcError::Malformed("nonce"),
            RpcError::NonceRejected("x"),
            RpcError::HandshakeRejected("x"),
            RpcError::PeerHandshake(-1),
            RpcError::PingTimeout(1),
            RpcError::Handler("x".into()),
            RpcError::Message(MessageError::Exhausted),
        ];
        let mut codes: Vec<i32> = errors.iter().map(RpcError::code).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn display() {
        let e = RpcError::BadChecksum {
            computed: 0xdead_beef,
            received: 0x1,
        };
        assert_eq!(
            e.to_string(),
            "checksum mismatch: computed 0xdeadbeef, received 0x00000001"
        );
    }
}
