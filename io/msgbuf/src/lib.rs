//! Zero-copy message buffers.
//!
//! Network payloads are stored as [`RawMessage`]s: chains of slices over
//! refcounted, size-classed [`MessageBuffer`]s handed out by a per-worker
//! [`BufferAllocator`]. Splitting, concatenating and cloning messages shares
//! buffers instead of copying bytes.
//!
//! # Example
//!
//! ```
//! use io_msgbuf::{BufferAllocator, RawMessage};
//!
//! let alloc = BufferAllocator::with_limit(1 << 20);
//! let msg = RawMessage::from_slice(&alloc, b"ABCDEFGH").unwrap();
//! let (head, tail) = msg.split(3).unwrap();
//! assert_eq!(head.to_vec(), b"ABC");
//! assert_eq!(tail.to_vec(), b"DEFGH");
//! ```

mod checksum;
mod error;
mod message;
mod part;
mod pool;

pub mod metrics;

pub use checksum::{CHECKSUMS, Checksum, ChecksumKind};
pub use error::MessageError;
pub use message::{MAX_TRANSFORM_BLOCK, RawMessage};
pub use part::MessagePart;
pub use pool::{
    AllocatorStats, BufferAllocator, ClassStats, DEFAULT_CACHE_LIMIT, MAX_BUFFER_SIZE,
    MemoryBudget, MessageBuffer, SIZE_CLASSES, size_class,
};
