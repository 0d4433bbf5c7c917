//! Engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(name = "net_connections_accepted")]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(name = "net_connections_opened")]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(name = "net_connections_closed")]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(name = "net_connections_failed")]
pub static CONNECTIONS_FAILED: Counter = Counter::new();

/// Currently open connections, listeners excluded.
#[metric(name = "net_connections_active")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "net_connect_errors")]
pub static CONNECT_ERRORS: Counter = Counter::new();

/// Targets with a non-zero reference count.
#[metric(name = "net_targets_active")]
pub static TARGETS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "net_targets_freed")]
pub static TARGETS_FREED: Counter = Counter::new();

#[metric(name = "net_idle_connections_closed")]
pub static IDLE_CLOSED: Counter = Counter::new();

#[metric(name = "net_bytes_read")]
pub static BYTES_READ: Counter = Counter::new();

#[metric(name = "net_bytes_written")]
pub static BYTES_WRITTEN: Counter = Counter::new();

#[metric(name = "net_queries_expired")]
pub static QUERIES_EXPIRED: Counter = Counter::new();

/// Reads deferred because the buffer budget was exhausted.
#[metric(name = "net_read_backpressure")]
pub static READ_BACKPRESSURE: Counter = Counter::new();
