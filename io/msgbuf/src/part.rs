//! Chain nodes referencing a slice of a [`MessageBuffer`].

use std::rc::Rc;

use crate::pool::MessageBuffer;

/// A node in a message chain.
///
/// A part references `[offset, offset + len)` of its buffer and links to the
/// next part. Parts are shared between messages through `Rc`; the strong
/// count is the part's reference count. A part may only be modified while
/// it is reachable from exactly one message, which the chain operations
/// enforce with `Rc::get_mut`.
pub struct MessagePart {
    pub(crate) buffer: MessageBuffer,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) next: Option<Rc<MessagePart>>,
}

impl MessagePart {
    pub(crate) fn new(buffer: MessageBuffer, offset: usize, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
            next: None,
        }
    }

    /// Buffer backing this part.
    #[inline]
    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// Absolute start of the part within its buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Absolute end of the part within its buffer.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// The following part, if any.
    #[inline]
    pub fn next(&self) -> Option<&MessagePart> {
        self.next.as_deref()
    }

    /// True if no other part or message can observe this part's bytes.
    #[inline]
    pub(crate) fn exclusive(this: &Rc<MessagePart>) -> bool {
        Rc::strong_count(this) == 1 && this.buffer.ref_count() == 1
    }
}

impl Drop for MessagePart {
    // Unlink iteratively so long chains don't recurse on drop.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(part) = next {
            match Rc::try_unwrap(part) {
                Ok(mut part) => next = part.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for MessagePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePart")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("buffer_refs", &self.buffer.ref_count())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}
