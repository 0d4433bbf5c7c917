//! Buffer pool metrics.

use metriken::{Counter, Gauge, metric};

/// Buffers handed out by allocators.
#[metric(name = "msgbuf_buffers_allocated")]
pub static BUFFERS_ALLOCATED: Counter = Counter::new();

/// Buffers returned to allocators.
#[metric(name = "msgbuf_buffers_freed")]
pub static BUFFERS_FREED: Counter = Counter::new();

/// Allocations refused because the memory budget was exhausted.
#[metric(name = "msgbuf_alloc_failed")]
pub static BUFFER_ALLOC_FAILED: Counter = Counter::new();

/// Bytes held by live buffers.
#[metric(name = "msgbuf_buffer_bytes")]
pub static BUFFER_BYTES: Gauge = Gauge::new();
