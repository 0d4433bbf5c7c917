//! Single-threaded connection engine.
//!
//! An [`Engine`] drives inbound and outbound connections over mio. Each
//! connection buffers its bytes in [`RawMessage`](io_msgbuf::RawMessage)
//! chains and hands them to a protocol implementing [`ConnType`]. Outbound
//! connections are grouped into targets that keep a configured number of
//! sockets open and reconnect with backoff.

mod config;
mod conn_type;
mod connection;
mod crypto;
mod endpoint;
mod engine;
mod error;
mod list;
mod pid;
mod query;
mod ratelimit;
mod socket;
mod target;
mod timer;
mod types;

pub mod metrics;

pub use config::NetConfig;
pub use conn_type::{Completer, ConnType, Context, default_check_ready};
pub use connection::{Connection, ERR_CONNECT, ERR_IO, ERR_NO_MEMORY, ERR_PEER_CLOSED};
pub use crypto::{
    AES_BLOCK, AesCbcSession, KeyDerivation, KeyExchange, NONCE_LEN, SessionCipher, SessionKeys,
    Sha256Kdf, key_id,
};
pub use endpoint::{Endpoint, EndpointParseError};
pub use engine::Engine;
pub use error::NetError;
pub use pid::{PROCESS_ID_LEN, ProcessId};
pub use query::{ConnQuery, QueryId, QueryOutcome, QueryOwner};
pub use ratelimit::RateLimiter;
pub use target::{Target, TargetSpec, desired_connections, idle_close_probability};
pub use types::{
    ConnFlags, ConnId, ConnKind, ConnStatus, ListenerId, ParseStatus, ReadyState, TargetId,
};
