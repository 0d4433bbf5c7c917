/// Errors from message chain operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The shared memory budget cannot cover a new buffer.
    #[error("buffer memory exhausted")]
    Exhausted,
    #[error("offset {at} out of range for message of {len} bytes")]
    OutOfRange { at: usize, len: usize },
    #[error("length {len} is not a multiple of block size {block}")]
    Unaligned { len: usize, block: usize },
    /// Part links disagree with the recorded offsets.
    #[error("message chain corrupt: {0}")]
    Corrupt(&'static str),
}
