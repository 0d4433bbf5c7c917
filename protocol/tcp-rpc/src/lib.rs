//! Framed RPC over TCP and Unix sockets.
//!
//! Every packet carries its length, a sequence number, a type and a
//! trailing CRC32 or CRC32C. A connection starts with a nonce exchange,
//! which may switch both directions to AES, followed by a handshake that
//! checks process identities and negotiates capabilities. After that,
//! packets go to an [`RpcHandler`].
//!
//! # Example
//!
//! ```
//! use io_msgbuf::{BufferAllocator, ChecksumKind, RawMessage};
//! use protocol_tcp_rpc::packet::{self, Frame, PING};
//!
//! let alloc = BufferAllocator::with_limit(1 << 20);
//! let payload = RawMessage::from_slice(&alloc, &7u64.to_le_bytes()).unwrap();
//! let mut wire = packet::encode(0, PING, payload, ChecksumKind::Crc32).unwrap();
//!
//! match packet::decode(&mut wire, ChecksumKind::Crc32, 1 << 20).unwrap() {
//!     Frame::Packet(p) => assert_eq!((p.seq, p.ty), (0, PING)),
//!     _ => unreachable!(),
//! }
//! ```

mod config;
mod conn;
mod error;
mod handshake;
mod session;

pub mod metrics;
pub mod packet;

pub use config::{PeerPattern, RpcConfig};
pub use conn::{RpcHandler, TcpRpc};
pub use error::*;
pub use handshake::{
    CryptoSchema, HandshakeErrorPacket, HandshakeFlags, HandshakePacket, NoncePacket,
};
pub use packet::Packet;
pub use session::{Phase, RpcSession};
