use io_msgbuf::MessageError;

use crate::endpoint::Endpoint;
use crate::types::{ConnId, TargetId};

/// Errors returned by the connection engine.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message buffer error: {0}")]
    Message(#[from] MessageError),
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("target table full")]
    TargetLimitReached,
    #[error("stale or unknown connection {0}")]
    StaleConnection(ConnId),
    #[error("stale or unknown target {0}")]
    StaleTarget(TargetId),
    #[error("cannot listen on {endpoint}: {source}")]
    Listen {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("crypto setup failed: {0}")]
    Crypto(&'static str),
    #[error("protocol rejected connection: {0}")]
    Rejected(&'static str),
}
