use metriken::{Counter, metric};

#[metric(name = "rpc_packets_received")]
pub static RPC_PACKETS_RECEIVED: Counter = Counter::new();

#[metric(name = "rpc_packets_sent")]
pub static RPC_PACKETS_SENT: Counter = Counter::new();

#[metric(name = "rpc_checksum_errors")]
pub static RPC_CHECKSUM_ERRORS: Counter = Counter::new();

#[metric(name = "rpc_protocol_errors")]
pub static RPC_PROTOCOL_ERRORS: Counter = Counter::new();

/// Sessions that completed the handshake.
#[metric(name = "rpc_handshakes")]
pub static RPC_HANDSHAKES: Counter = Counter::new();

#[metric(name = "rpc_handshakes_encrypted")]
pub static RPC_HANDSHAKES_ENCRYPTED: Counter = Counter::new();

#[metric(name = "rpc_handshake_failures")]
pub static RPC_HANDSHAKE_FAILURES: Counter = Counter::new();

#[metric(name = "rpc_pings_sent")]
pub static RPC_PINGS_SENT: Counter = Counter::new();

#[metric(name = "rpc_pongs_received")]
pub static RPC_PONGS_RECEIVED: Counter = Counter::new();

#[metric(name = "rpc_ping_timeouts")]
pub static RPC_PING_TIMEOUTS: Counter = Counter::new();

#[metric(name = "rpc_padding_bytes")]
pub static RPC_PADDING_BYTES: Counter = Counter::new();
