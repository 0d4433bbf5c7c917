//! Byte strings represented as chains of shared buffer slices.
//!
//! A [`RawMessage`] is a window `[first_offset, last_offset)` over a singly
//! linked chain of [`MessagePart`]s. Cloning a message shares the whole chain;
//! splitting one shares the buffers on both sides of the cut. Bytes are only
//! copied when a shared part would otherwise have to be modified, which is
//! handled by [`RawMessage::fork_message_chain`].

use std::io::{self, IoSlice, Read, Write};
use std::ptr;
use std::rc::Rc;

use crate::error::MessageError;
use crate::part::MessagePart;
use crate::pool::{BufferAllocator, MessageBuffer};

/// Largest block accepted by [`RawMessage::transform_in_place`].
pub const MAX_TRANSFORM_BLOCK: usize = 64;

/// Maximum number of slices gathered for one vectored write.
const MAX_IOVECS: usize = 64;

/// A byte string backed by a chain of refcounted buffer slices.
pub struct RawMessage {
    alloc: BufferAllocator,
    first: Option<Rc<MessagePart>>,
    // Non-owning; kept alive through `first`.
    last: *const MessagePart,
    first_offset: usize,
    last_offset: usize,
    total_bytes: usize,
}

/// Visible slice of one part.
struct Segment<'a> {
    rc: &'a Rc<MessagePart>,
    start: usize,
    end: usize,
}

impl<'a> Segment<'a> {
    #[inline]
    fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    fn bytes(&self) -> &'a [u8] {
        self.rc.buffer.slice(self.start, self.end)
    }

    #[inline]
    fn is_last(&self, msg: &RawMessage) -> bool {
        ptr::eq(Rc::as_ptr(self.rc), msg.last)
    }
}

struct Segments<'a> {
    msg: &'a RawMessage,
    next: Option<&'a Rc<MessagePart>>,
    head: bool,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Segment<'a>> {
        let rc = self.next?;
        let start = if self.head {
            self.msg.first_offset
        } else {
            rc.offset
        };
        self.head = false;
        let last = ptr::eq(Rc::as_ptr(rc), self.msg.last);
        let end = if last { self.msg.last_offset } else { rc.end() };
        self.next = if last { None } else { rc.next.as_ref() };
        Some(Segment { rc, start, end })
    }
}

/// Where a byte position falls inside the chain.
struct Boundary {
    /// Parts before the one holding the position.
    hops: usize,
    /// Absolute offset of the position in that part's buffer.
    offset: usize,
    /// Visible end of that part.
    seg_end: usize,
    /// The part is the message's last one.
    is_last: bool,
    /// Some part on the path from `first` up to and including this one is
    /// referenced from elsewhere.
    shared: bool,
    part: *const MessagePart,
}

/// A freshly built run of parts.
struct Chain {
    first: Rc<MessagePart>,
    last: *const MessagePart,
    first_offset: usize,
    last_offset: usize,
}

fn reserve(alloc: &BufferAllocator, len: usize) -> Result<Vec<MessageBuffer>, MessageError> {
    let mut buffers = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let buffer = alloc.allocate(remaining).ok_or(MessageError::Exhausted)?;
        remaining -= buffer.capacity().min(remaining);
        buffers.push(buffer);
    }
    Ok(buffers)
}

/// Link `parts` in order, followed by `tail`.
fn link(parts: Vec<MessagePart>, tail: Option<Rc<MessagePart>>) -> Option<Chain> {
    let first_offset = parts.first()?.offset;
    let last_offset = parts.last()?.end();
    let mut next = tail;
    let mut last: *const MessagePart = ptr::null();
    for mut part in parts.into_iter().rev() {
        part.next = next;
        let rc = Rc::new(part);
        if last.is_null() {
            last = Rc::as_ptr(&rc);
        }
        next = Some(rc);
    }
    next.map(|first| Chain {
        first,
        last,
        first_offset,
        last_offset,
    })
}

/// Copy `sources` front to back into fresh buffers.
fn fill_forward<'s>(
    buffers: Vec<MessageBuffer>,
    sources: impl IntoIterator<Item = &'s [u8]>,
    tail: Option<Rc<MessagePart>>,
) -> Option<Chain> {
    let mut buffers = buffers.into_iter();
    let mut parts: Vec<MessagePart> = Vec::new();
    for mut src in sources {
        while !src.is_empty() {
            let full = parts
                .last()
                .is_none_or(|p| p.len == p.buffer.capacity());
            if full {
                let buffer = buffers.next()?;
                buffer.claim_fresh(0, 0);
                parts.push(MessagePart::new(buffer, 0, 0));
            }
            let part = parts.last_mut()?;
            let take = (part.buffer.capacity() - part.len).min(src.len());
            part.buffer.append_claim(&src[..take]);
            part.len += take;
            src = &src[take..];
        }
    }
    link(parts, tail)
}

/// Copy `data` into fresh buffers, filling each one from its end.
fn fill_backward(
    buffers: Vec<MessageBuffer>,
    data: &[u8],
    tail: Option<Rc<MessagePart>>,
) -> Option<Chain> {
    let mut parts = Vec::with_capacity(buffers.len());
    let mut end = data.len();
    for buffer in buffers {
        let cap = buffer.capacity();
        let n = cap.min(end);
        buffer.claim_fresh(cap, cap);
        buffer.prepend_claim(cap, &data[end - n..end]);
        parts.push(MessagePart::new(buffer, cap - n, n));
        end -= n;
    }
    parts.reverse();
    link(parts, tail)
}

impl RawMessage {
    /// Create an empty message.
    pub fn new(alloc: &BufferAllocator) -> Self {
        Self {
            alloc: alloc.clone(),
            first: None,
            last: ptr::null(),
            first_offset: 0,
            last_offset: 0,
            total_bytes: 0,
        }
    }

    /// Create a message holding a copy of `data`.
    pub fn from_slice(alloc: &BufferAllocator, data: &[u8]) -> Result<Self, MessageError> {
        let mut msg = Self::new(alloc);
        msg.push_data(data)?;
        Ok(msg)
    }

    /// Allocator used for buffers this message creates.
    pub fn allocator(&self) -> &BufferAllocator {
        &self.alloc
    }

    /// Number of visible bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.total_bytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Number of parts the message spans.
    pub fn part_count(&self) -> usize {
        self.segments().count()
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.first = None;
        self.last = ptr::null();
        self.first_offset = 0;
        self.last_offset = 0;
        self.total_bytes = 0;
    }

    /// Move the content out, leaving this message empty.
    pub fn take(&mut self) -> RawMessage {
        let empty = RawMessage::new(&self.alloc);
        std::mem::replace(self, empty)
    }

    fn segments(&self) -> Segments<'_> {
        Segments {
            msg: self,
            next: self.first.as_ref(),
            head: true,
        }
    }

    /// Iterate over the visible bytes, one slice per part.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.segments().map(|s| s.bytes())
    }

    fn install(&mut self, chain: Chain, total: usize) {
        self.first = Some(chain.first);
        self.last = chain.last;
        self.first_offset = chain.first_offset;
        self.last_offset = chain.last_offset;
        self.total_bytes = total;
    }

    fn tail(&self) -> Option<&MessagePart> {
        self.first.as_ref()?;
        // SAFETY: `last` points into the chain owned through `first`.
        Some(unsafe { &*self.last })
    }

    /// The last part, if every part leading to it is referenced only from
    /// this message.
    fn tail_mut(&mut self) -> Option<&mut MessagePart> {
        let last = self.last;
        let mut cur = Rc::get_mut(self.first.as_mut()?)?;
        while !ptr::eq(cur, last) {
            cur = Rc::get_mut(cur.next.as_mut()?)?;
        }
        Some(cur)
    }

    fn part_mut_at(&mut self, hops: usize) -> Option<&mut MessagePart> {
        let mut cur = Rc::get_mut(self.first.as_mut()?)?;
        for _ in 0..hops {
            cur = Rc::get_mut(cur.next.as_mut()?)?;
        }
        Some(cur)
    }

    /// Locate the part holding byte `pos`, with `0 < pos <= len`. A position
    /// at a part boundary resolves to the earlier part.
    fn boundary(&self, pos: usize) -> Option<Boundary> {
        let mut before = 0;
        let mut shared = false;
        for (hops, seg) in self.segments().enumerate() {
            shared |= Rc::strong_count(seg.rc) > 1;
            if before + seg.len() >= pos {
                return Some(Boundary {
                    hops,
                    offset: seg.start + (pos - before),
                    seg_end: seg.end,
                    is_last: seg.is_last(self),
                    shared,
                    part: Rc::as_ptr(seg.rc),
                });
            }
            before += seg.len();
        }
        None
    }

    /// Make the first part start exactly at `first_offset`.
    fn normalize_front(&mut self) {
        let first_offset = self.first_offset;
        let last_offset = self.last_offset;
        let is_last = self
            .first
            .as_ref()
            .is_some_and(|f| ptr::eq(Rc::as_ptr(f), self.last));
        let Some(first) = self.first.as_mut() else {
            return;
        };
        if first.offset == first_offset {
            return;
        }
        if let Some(part) = Rc::get_mut(first) {
            let end = part.end();
            part.offset = first_offset;
            part.len = end - first_offset;
            return;
        }
        // Shared node: replace it with a private one over the same buffer.
        let (len, next) = if is_last {
            (last_offset - first_offset, None)
        } else {
            (first.end() - first_offset, first.next.clone())
        };
        let mut dup = MessagePart::new(first.buffer.clone(), first_offset, len);
        dup.next = next;
        let dup = Rc::new(dup);
        if is_last {
            self.last = Rc::as_ptr(&dup);
        }
        self.first = Some(dup);
    }

    /// Append a copy of `data`.
    ///
    /// Writes into free space after the last part when nobody else can see
    /// it, and allocates new buffers for the rest. On `Exhausted` the message
    /// is unchanged.
    pub fn push_data(&mut self, data: &[u8]) -> Result<(), MessageError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.first.is_none() {
            let buffers = reserve(&self.alloc, data.len())?;
            if let Some(chain) = fill_forward(buffers, [data], None) {
                self.install(chain, data.len());
            }
            return Ok(());
        }

        let last_offset = self.last_offset;
        let appendable = matches!(
            self.tail_mut(),
            Some(t) if t.next.is_none() && t.end() == last_offset
        );
        if !appendable {
            self.fork_message_chain()?;
        }

        let room = self
            .tail()
            .map_or(0, |t| t.buffer.room_after(self.last_offset));
        let (head, rest) = data.split_at(room.min(data.len()));
        let chain = if rest.is_empty() {
            None
        } else {
            fill_forward(reserve(&self.alloc, rest.len())?, [rest], None)
        };

        let tail = self
            .tail_mut()
            .ok_or(MessageError::Corrupt("shared tail after fork"))?;
        if !head.is_empty() {
            tail.buffer.append_claim(head);
            tail.len += head.len();
        }
        let tail_end = tail.end();
        match chain {
            Some(chain) => {
                tail.next = Some(chain.first);
                self.last = chain.last;
                self.last_offset = chain.last_offset;
            }
            None => self.last_offset = tail_end,
        }
        self.total_bytes += data.len();
        Ok(())
    }

    /// Prepend a copy of `data`.
    ///
    /// Writes into free space before the first part when possible, and
    /// allocates new buffers, filled from the back, for the rest.
    pub fn push_data_front(&mut self, data: &[u8]) -> Result<(), MessageError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.first.is_none() {
            return self.push_data(data);
        }

        let first_offset = self.first_offset;
        let room = match self.first.as_mut().and_then(Rc::get_mut) {
            Some(part) => {
                let (low, _) = part.buffer.claimed();
                if part.buffer.ref_count() == 1
                    || (part.offset == first_offset && low == first_offset)
                {
                    first_offset
                } else {
                    0
                }
            }
            None => 0,
        };
        let (rest, head) = data.split_at(data.len() - room.min(data.len()));
        let buffers = if rest.is_empty() {
            Vec::new()
        } else {
            reserve(&self.alloc, rest.len())?
        };

        if !head.is_empty() {
            let part = self
                .first
                .as_mut()
                .and_then(Rc::get_mut)
                .ok_or(MessageError::Corrupt("shared first part"))?;
            part.buffer.prepend_claim(first_offset, head);
            let end = part.end();
            part.offset = first_offset - head.len();
            part.len = end - part.offset;
            self.first_offset = part.offset;
        }

        if !rest.is_empty() {
            self.normalize_front();
            let old_first = self.first.take();
            if let Some(chain) = fill_backward(buffers, rest, old_first) {
                self.first = Some(chain.first);
                self.first_offset = chain.first_offset;
            }
        }
        self.total_bytes += data.len();
        Ok(())
    }

    /// Split off the first `at` bytes and return them; `self` keeps the rest.
    ///
    /// No bytes are copied unless the part holding the cut is shared with
    /// another message, in which case only the tail of that part is copied.
    pub fn split_to(&mut self, at: usize) -> Result<RawMessage, MessageError> {
        if at > self.total_bytes {
            return Err(MessageError::OutOfRange {
                at,
                len: self.total_bytes,
            });
        }
        if at == 0 {
            return Ok(RawMessage::new(&self.alloc));
        }
        if at == self.total_bytes {
            return Ok(self.take());
        }
        let b = self
            .boundary(at)
            .ok_or(MessageError::Corrupt("no boundary inside message"))?;

        // (first part of the tail, its visible start, tail's last, tail's last_offset)
        let (tail_first, tail_first_offset, tail_last, tail_last_offset) = if b.offset == b.seg_end
        {
            let next = if b.shared {
                self.part_at(b.hops).and_then(|p| p.next.clone())
            } else {
                self.part_mut_at(b.hops).and_then(|p| p.next.take())
            };
            let next = next.ok_or(MessageError::Corrupt("missing successor part"))?;
            let offset = next.offset;
            (next, offset, self.last, self.last_offset)
        } else if !b.shared {
            let p = self
                .part_mut_at(b.hops)
                .ok_or(MessageError::Corrupt("missing boundary part"))?;
            let mut q = MessagePart::new(p.buffer.clone(), b.offset, p.end() - b.offset);
            q.next = p.next.take();
            p.len = b.offset - p.offset;
            let q = Rc::new(q);
            let last = if b.is_last { Rc::as_ptr(&q) } else { self.last };
            (q, b.offset, last, self.last_offset)
        } else {
            let p = self
                .part_at(b.hops)
                .ok_or(MessageError::Corrupt("missing boundary part"))?;
            let next = if b.is_last { None } else { p.next.clone() };
            let buffers = reserve(&self.alloc, b.seg_end - b.offset)?;
            let chain = fill_forward(buffers, [p.buffer.slice(b.offset, b.seg_end)], next)
                .ok_or(MessageError::Corrupt("empty copy"))?;
            let (last, last_offset) = if b.is_last {
                (chain.last, chain.last_offset)
            } else {
                (self.last, self.last_offset)
            };
            (chain.first, chain.first_offset, last, last_offset)
        };

        let head = RawMessage {
            alloc: self.alloc.clone(),
            first: self.first.take(),
            last: b.part,
            first_offset: self.first_offset,
            last_offset: b.offset,
            total_bytes: at,
        };
        self.first = Some(tail_first);
        self.first_offset = tail_first_offset;
        self.last = tail_last;
        self.last_offset = tail_last_offset;
        self.total_bytes -= at;
        Ok(head)
    }

    /// Split into the first `at` bytes and the rest.
    pub fn split(mut self, at: usize) -> Result<(RawMessage, RawMessage), MessageError> {
        let head = self.split_to(at)?;
        Ok((head, self))
    }

    fn part_at(&self, hops: usize) -> Option<&MessagePart> {
        self.segments().nth(hops).map(|s| &**s.rc)
    }

    /// Append `other` to this message, consuming it.
    ///
    /// Adjacent slices of the same buffer are merged into one part.
    pub fn append(&mut self, mut other: RawMessage) -> Result<(), MessageError> {
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            let alloc = self.alloc.clone();
            *self = other.take();
            self.alloc = alloc;
            return Ok(());
        }
        if self.tail_mut().is_none() {
            self.fork_message_chain()?;
        }
        other.normalize_front();

        let last_offset = self.last_offset;
        let other_first = other
            .first
            .take()
            .ok_or(MessageError::Corrupt("missing first part"))?;
        let other_first_is_last = ptr::eq(Rc::as_ptr(&other_first), other.last);

        let tail = self
            .tail_mut()
            .ok_or(MessageError::Corrupt("shared tail after fork"))?;
        tail.len = last_offset - tail.offset;
        tail.next = None;

        let coalesce =
            tail.buffer.ptr_eq(&other_first.buffer) && other_first.offset == tail.end();
        let (new_last, new_last_offset) = if coalesce && other_first_is_last {
            tail.len = other.last_offset - tail.offset;
            (ptr::from_ref::<MessagePart>(&*tail), other.last_offset)
        } else if coalesce {
            tail.len = other_first.end() - tail.offset;
            tail.next = other_first.next.clone();
            (other.last, other.last_offset)
        } else {
            tail.next = Some(other_first);
            (other.last, other.last_offset)
        };

        self.last = new_last;
        self.last_offset = new_last_offset;
        self.total_bytes += other.total_bytes;
        other.clear();
        Ok(())
    }

    /// Keep only the first `n` bytes. Does nothing if `n >= len`.
    pub fn trunc(&mut self, n: usize) {
        if n >= self.total_bytes {
            return;
        }
        if n == 0 {
            self.clear();
            return;
        }
        let Some(b) = self.boundary(n) else {
            return;
        };
        self.last = b.part;
        self.last_offset = b.offset;
        self.total_bytes = n;
        if !b.shared
            && let Some(part) = self.part_mut_at(b.hops)
        {
            part.next = None;
        }
    }

    /// Drop up to `n` bytes from the front; returns how many were dropped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.total_bytes);
        let mut left = n;
        while left > 0 {
            let Some(first) = self.first.as_ref() else {
                break;
            };
            let is_last = ptr::eq(Rc::as_ptr(first), self.last);
            let seg_end = if is_last { self.last_offset } else { first.end() };
            let avail = seg_end - self.first_offset;
            if left < avail {
                self.first_offset += left;
                self.total_bytes -= left;
                left = 0;
            } else if is_last {
                self.clear();
                left = 0;
            } else {
                let next = first.next.clone();
                self.total_bytes -= avail;
                left -= avail;
                self.first_offset = next.as_ref().map_or(0, |p| p.offset);
                self.first = next;
            }
        }
        n
    }

    /// Copy up to `out.len()` bytes from the front into `out` without
    /// consuming them.
    pub fn fetch_lookup(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.total_bytes);
        let mut copied = 0;
        for chunk in self.chunks() {
            if copied == n {
                break;
            }
            let take = chunk.len().min(n - copied);
            out[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
        }
        n
    }

    /// Copy up to `out.len()` bytes from the front and consume them.
    pub fn fetch_data(&mut self, out: &mut [u8]) -> usize {
        let n = self.fetch_lookup(out);
        self.skip(n);
        n
    }

    /// Copy the last `min(out.len(), len)` bytes into the front of `out`
    /// without consuming them.
    pub fn fetch_lookup_back(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.total_bytes);
        let from = self.total_bytes - n;
        let mut pos = 0;
        for chunk in self.chunks() {
            let chunk_end = pos + chunk.len();
            if chunk_end > from {
                let skip = from.saturating_sub(pos);
                let dst = pos + skip - from;
                out[dst..dst + chunk.len() - skip].copy_from_slice(&chunk[skip..]);
            }
            pos = chunk_end;
        }
        n
    }

    /// Copy the last bytes into `out` and drop them from the message.
    pub fn fetch_data_back(&mut self, out: &mut [u8]) -> usize {
        let n = self.fetch_lookup_back(out);
        self.trunc(self.total_bytes - n);
        n
    }

    /// Feed the first `min(n, len)` bytes to `f`, one contiguous slice at a
    /// time. Returns the number of bytes processed.
    pub fn process<F: FnMut(&[u8])>(&self, n: usize, mut f: F) -> usize {
        let n = n.min(self.total_bytes);
        let mut left = n;
        for chunk in self.chunks() {
            if left == 0 {
                break;
            }
            let take = chunk.len().min(left);
            if take > 0 {
                f(&chunk[..take]);
            }
            left -= take;
        }
        n
    }

    /// Like [`process`](Self::process), then consume the processed bytes.
    pub fn process_and_advance<F: FnMut(&[u8])>(&mut self, n: usize, f: F) -> usize {
        let n = self.process(n, f);
        self.skip(n);
        n
    }

    /// Copy the visible bytes into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Make every part of the chain exclusively owned by this message.
    ///
    /// Parts are kept as long as both the part and its buffer have a single
    /// owner. From the first shared part on, the remaining bytes are copied
    /// into fresh buffers and the shared suffix is released. The first and
    /// last parts are trimmed to the visible window. A second call is a
    /// no-op.
    pub fn fork_message_chain(&mut self) -> Result<(), MessageError> {
        if self.first.is_none() {
            return Ok(());
        }

        let mut prefix_parts = 0;
        let mut prefix_bytes = 0;
        let mut shared = false;
        for seg in self.segments() {
            if !MessagePart::exclusive(seg.rc) {
                shared = true;
                break;
            }
            prefix_parts += 1;
            prefix_bytes += seg.len();
        }

        if shared {
            let copy_len = self.total_bytes - prefix_bytes;
            let buffers = reserve(&self.alloc, copy_len)?;
            let chain = fill_forward(
                buffers,
                self.segments().skip(prefix_parts).map(|s| s.bytes()),
                None,
            );
            match chain {
                Some(chain) if prefix_parts == 0 => {
                    self.first = Some(chain.first);
                    self.first_offset = chain.first_offset;
                    self.last = chain.last;
                    self.last_offset = chain.last_offset;
                }
                Some(chain) => {
                    let part = self
                        .part_mut_at(prefix_parts - 1)
                        .ok_or(MessageError::Corrupt("missing prefix part"))?;
                    part.next = Some(chain.first);
                    self.last = chain.last;
                    self.last_offset = chain.last_offset;
                }
                None if prefix_parts == 0 => self.clear(),
                None => {
                    // Nothing visible past the prefix: its last part ends the
                    // message.
                    let part = self
                        .part_mut_at(prefix_parts - 1)
                        .ok_or(MessageError::Corrupt("missing prefix part"))?;
                    part.next = None;
                    let end = part.end();
                    self.last = ptr::from_ref::<MessagePart>(&*part);
                    self.last_offset = end;
                }
            }
        }

        let first_offset = self.first_offset;
        if let Some(first) = self.first.as_mut().and_then(Rc::get_mut) {
            let end = first.end();
            first.offset = first_offset;
            first.len = end - first_offset;
        }
        let last_offset = self.last_offset;
        if let Some(tail) = self.tail_mut() {
            tail.len = last_offset - tail.offset;
            tail.next = None;
        }
        Ok(())
    }

    /// Fork the chain so that every part and every buffer is owned by this
    /// message alone, with each part covering exactly its visible bytes.
    ///
    /// After this call the bytes may be rewritten in place.
    pub fn fork_deep(&mut self) -> Result<(), MessageError> {
        self.fork_message_chain()?;
        debug_assert!(self.segments().all(|s| MessagePart::exclusive(s.rc)
            && s.start == s.rc.offset
            && s.end == s.rc.end()));
        Ok(())
    }

    /// Rewrite the first `n` bytes in place, `block` bytes at a time.
    ///
    /// `f` receives one or more whole blocks per call. Blocks that straddle a
    /// part boundary are gathered into a scratch buffer and scattered back.
    /// Used for block ciphers, which need the whole chain privately owned.
    pub fn transform_in_place<F>(&mut self, n: usize, block: usize, mut f: F) -> Result<(), MessageError>
    where
        F: FnMut(&mut [u8]),
    {
        if n > self.total_bytes {
            return Err(MessageError::OutOfRange {
                at: n,
                len: self.total_bytes,
            });
        }
        if block == 0 || block > MAX_TRANSFORM_BLOCK || n % block != 0 {
            return Err(MessageError::Unaligned { len: n, block });
        }
        if n == 0 {
            return Ok(());
        }
        self.fork_deep()?;

        let mut carry = [0u8; MAX_TRANSFORM_BLOCK];
        // Destinations of the bytes currently in `carry`.
        let mut pending: Vec<(*mut u8, usize)> = Vec::new();
        let mut carry_len = 0;
        let mut left = n;

        for seg in self.segments() {
            if left == 0 {
                break;
            }
            let len = seg.len().min(left);
            left -= len;
            // SAFETY: after fork_deep this message is the only owner of every
            // part and buffer in the chain, and `&mut self` keeps it that way.
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(seg.rc.buffer.as_mut_ptr().add(seg.start), len)
            };
            let mut pos = 0;

            if carry_len > 0 {
                let take = (block - carry_len).min(len);
                carry[carry_len..carry_len + take].copy_from_slice(&bytes[..take]);
                pending.push((bytes.as_mut_ptr(), take));
                carry_len += take;
                pos = take;
                if carry_len < block {
                    continue;
                }
                f(&mut carry[..block]);
                let mut at = 0;
                for (dst, len) in pending.drain(..) {
                    // SAFETY: each pointer was taken from a live slice of a
                    // distinct, privately owned buffer and covers `len` bytes.
                    unsafe { ptr::copy_nonoverlapping(carry.as_ptr().add(at), dst, len) };
                    at += len;
                }
                carry_len = 0;
            }

            let whole = (len - pos) / block * block;
            if whole > 0 {
                f(&mut bytes[pos..pos + whole]);
            }
            let rest = &mut bytes[pos + whole..];
            if !rest.is_empty() {
                carry[..rest.len()].copy_from_slice(rest);
                pending.push((rest.as_mut_ptr(), rest.len()));
                carry_len = rest.len();
            }
        }
        debug_assert_eq!(carry_len, 0);
        Ok(())
    }

    /// Collect up to `max` slices of the visible bytes for a vectored write.
    pub fn io_slices<'a>(&'a self, out: &mut Vec<IoSlice<'a>>, max: usize) {
        out.extend(
            self.chunks()
                .filter(|c| !c.is_empty())
                .take(max)
                .map(IoSlice::new),
        );
    }

    /// Read from `reader` into the free space after the last part.
    ///
    /// A new buffer sized for `hint` is allocated when there is no room.
    /// Budget exhaustion is reported as [`io::ErrorKind::OutOfMemory`].
    pub fn read_from<R: Read>(&mut self, reader: &mut R, hint: usize) -> io::Result<usize> {
        let last_offset = self.last_offset;
        if let Some(tail) = self.tail_mut()
            && tail.next.is_none()
            && tail.end() == last_offset
            && tail.buffer.room_after(last_offset) > 0
        {
            // SAFETY: the spare region is not visible through any part and
            // the slice does not outlive this call.
            let n = reader.read(unsafe { tail.buffer.spare_mut() })?;
            tail.buffer.commit(n);
            tail.len += n;
            self.last_offset += n;
            self.total_bytes += n;
            return Ok(n);
        }

        let buffer = self
            .alloc
            .allocate(hint)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, MessageError::Exhausted))?;
        buffer.claim_fresh(0, 0);
        // SAFETY: the buffer is fresh and private to this call.
        let n = reader.read(unsafe { buffer.spare_mut() })?;
        if n == 0 {
            return Ok(0);
        }
        buffer.commit(n);
        let part = Rc::new(MessagePart::new(buffer, 0, n));
        let part_ptr = Rc::as_ptr(&part);

        if self.first.is_none() {
            self.first = Some(part);
            self.first_offset = 0;
        } else {
            if self.tail_mut().is_none() {
                self.fork_message_chain()
                    .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
            }
            let last_offset = self.last_offset;
            let tail = self
                .tail_mut()
                .ok_or_else(|| io::Error::other(MessageError::Corrupt("shared tail after fork")))?;
            tail.len = last_offset - tail.offset;
            tail.next = Some(part);
        }
        self.last = part_ptr;
        self.last_offset = n;
        self.total_bytes += n;
        Ok(n)
    }

    /// Write as much as possible to `writer` and consume what was written.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut slices = Vec::with_capacity(MAX_IOVECS);
        self.io_slices(&mut slices, MAX_IOVECS);
        if slices.is_empty() {
            return Ok(0);
        }
        let n = writer.write_vectored(&slices)?;
        drop(slices);
        self.skip(n);
        Ok(n)
    }

    /// Check the length bookkeeping against the chain.
    pub fn check_invariant(&self) -> bool {
        let mut total = 0;
        let mut reached_last = self.first.is_none();
        for seg in self.segments() {
            if seg.start > seg.end || seg.end > seg.rc.buffer.capacity() {
                return false;
            }
            total += seg.len();
            reached_last = seg.is_last(self);
        }
        reached_last && total == self.total_bytes
    }
}

impl Clone for RawMessage {
    /// Share the chain; no bytes are copied.
    fn clone(&self) -> Self {
        Self {
            alloc: self.alloc.clone(),
            first: self.first.clone(),
            last: self.last,
            first_offset: self.first_offset,
            last_offset: self.last_offset,
            total_bytes: self.total_bytes,
        }
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessage")
            .field("len", &self.total_bytes)
            .field("parts", &self.part_count())
            .field("first_offset", &self.first_offset)
            .field("last_offset", &self.last_offset)
            .finish()
    }
}
