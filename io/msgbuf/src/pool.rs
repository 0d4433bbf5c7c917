//! Size-classed message buffer allocation.
//!
//! Buffers come in a small set of fixed size classes. Each worker owns a
//! [`BufferAllocator`] holding a free list per class, so the hot path never
//! takes a lock. All allocators of a process draw from one shared
//! [`MemoryBudget`], which is accounted with atomics only.
//!
//! # Backpressure
//!
//! When the budget cannot cover a new buffer, [`BufferAllocator::allocate`]
//! returns `None`. Callers treat this as "try later": the allocator never
//! blocks and never aborts.
//!
//! # Region claims
//!
//! Every [`MessageBuffer`] tracks the byte range `[low, high)` that has been
//! handed out to message parts. Bytes inside the range are immutable for as
//! long as more than one owner can observe them; fresh bytes are only ever
//! written below `low` (prepend) or at and above `high` (append). This is what
//! lets several messages share one buffer without copying.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::metrics::{BUFFER_ALLOC_FAILED, BUFFER_BYTES, BUFFERS_ALLOCATED, BUFFERS_FREED};

/// Buffer size classes, smallest first.
pub const SIZE_CLASSES: [usize; 5] = [48, 512, 2048, 16384, 262144];

/// Largest single buffer that can be handed out.
pub const MAX_BUFFER_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Default number of freed buffers kept per class before memory is returned
/// to the system allocator.
pub const DEFAULT_CACHE_LIMIT: usize = 256;

/// Returns the index of the smallest size class that fits `size`.
///
/// Requests above [`MAX_BUFFER_SIZE`] map to the largest class; callers that
/// need more bytes chain several buffers together.
#[inline]
pub fn size_class(size: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&class| class >= size)
        .unwrap_or(SIZE_CLASSES.len() - 1)
}

/// Process-wide byte budget shared by every allocator.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget allowing `limit` bytes of live buffers.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    /// Try to reserve `bytes` from the budget.
    fn try_reserve(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(bytes)?;
                (next <= self.limit).then_some(next)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "budget released more than reserved");
    }

    /// Configured limit in bytes.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently held by live buffers.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes that can still be allocated.
    #[inline]
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }
}

/// Free list for one size class.
#[derive(Default)]
struct ClassCache {
    free: Vec<Box<[u8]>>,
    live: usize,
}

struct AllocatorInner {
    budget: Arc<MemoryBudget>,
    classes: RefCell<[ClassCache; SIZE_CLASSES.len()]>,
    cache_limit: usize,
}

impl AllocatorInner {
    fn recycle(&self, class: usize, storage: Box<[u8]>) {
        let mut classes = self.classes.borrow_mut();
        let cache = &mut classes[class];
        cache.live -= 1;
        if cache.free.len() < self.cache_limit {
            cache.free.push(storage);
        }
        drop(classes);

        self.budget.release(SIZE_CLASSES[class]);
        BUFFERS_FREED.increment();
        BUFFER_BYTES.sub(SIZE_CLASSES[class] as i64);
    }
}

/// Per-worker buffer allocator.
///
/// Cloning is cheap and yields a handle to the same class caches. The
/// allocator is deliberately `!Send`: each event loop owns its own.
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Rc<AllocatorInner>,
}

impl BufferAllocator {
    /// Create an allocator drawing from a shared budget.
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self::with_cache_limit(budget, DEFAULT_CACHE_LIMIT)
    }

    /// Create an allocator that keeps at most `cache_limit` freed buffers per
    /// size class.
    pub fn with_cache_limit(budget: Arc<MemoryBudget>, cache_limit: usize) -> Self {
        Self {
            inner: Rc::new(AllocatorInner {
                budget,
                classes: RefCell::new(Default::default()),
                cache_limit,
            }),
        }
    }

    /// Create an allocator with a private budget of `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self::new(MemoryBudget::new(limit))
    }

    /// The budget this allocator draws from.
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.inner.budget
    }

    /// Allocate a buffer large enough for `size_hint` bytes.
    ///
    /// The request is rounded up to the next size class. Returns `None` when
    /// the shared budget is exhausted.
    pub fn allocate(&self, size_hint: usize) -> Option<MessageBuffer> {
        let class = size_class(size_hint);
        let size = SIZE_CLASSES[class];

        if !self.inner.budget.try_reserve(size) {
            BUFFER_ALLOC_FAILED.increment();
            tracing::trace!(size, used = self.inner.budget.used(), "buffer budget exhausted");
            return None;
        }

        let storage = {
            let mut classes = self.inner.classes.borrow_mut();
            let cache = &mut classes[class];
            cache.live += 1;
            cache.free.pop()
        }
        .unwrap_or_else(|| vec![0u8; size].into_boxed_slice());

        BUFFERS_ALLOCATED.increment();
        BUFFER_BYTES.add(size as i64);

        Some(MessageBuffer::from_storage(
            self.inner.clone(),
            class,
            storage,
        ))
    }

    /// Snapshot of per-class usage.
    pub fn stats(&self) -> AllocatorStats {
        let classes = self.inner.classes.borrow();
        let mut stats = AllocatorStats {
            budget_used: self.inner.budget.used(),
            budget_limit: self.inner.budget.limit(),
            classes: [ClassStats::default(); SIZE_CLASSES.len()],
        };
        for (i, cache) in classes.iter().enumerate() {
            stats.classes[i] = ClassStats {
                size: SIZE_CLASSES[i],
                live: cache.live,
                cached: cache.free.len(),
            };
        }
        stats
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("budget", &self.inner.budget)
            .finish()
    }
}

/// Usage of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Buffer size of this class.
    pub size: usize,
    /// Buffers currently handed out.
    pub live: usize,
    /// Freed buffers kept for reuse.
    pub cached: usize,
}

/// Snapshot returned by [`BufferAllocator::stats`].
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStats {
    pub budget_used: usize,
    pub budget_limit: usize,
    pub classes: [ClassStats; SIZE_CLASSES.len()],
}

impl AllocatorStats {
    /// Total live buffers across all classes.
    pub fn live_buffers(&self) -> usize {
        self.classes.iter().map(|c| c.live).sum()
    }
}

struct BufferBlock {
    owner: Rc<AllocatorInner>,
    class: usize,
    ptr: NonNull<u8>,
    cap: usize,
    /// Start of the claimed region.
    low: Cell<usize>,
    /// End of the claimed region.
    high: Cell<usize>,
}

impl Drop for BufferBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`cap` came from `Box::into_raw` in `from_storage` and
        // this is the only place that reconstructs the box.
        let storage = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.cap,
            ))
        };
        self.owner.recycle(self.class, storage);
    }
}

/// A reference-counted, fixed-size block of bytes.
///
/// Cloning increments the reference count. The block returns to its
/// allocator's class cache when the last reference is dropped.
#[derive(Clone)]
pub struct MessageBuffer {
    block: Rc<BufferBlock>,
}

impl MessageBuffer {
    fn from_storage(owner: Rc<AllocatorInner>, class: usize, storage: Box<[u8]>) -> Self {
        let cap = storage.len();
        let raw = Box::into_raw(storage) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self {
            block: Rc::new(BufferBlock {
                owner,
                class,
                ptr,
                cap,
                low: Cell::new(0),
                high: Cell::new(0),
            }),
        }
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.cap
    }

    /// Number of live references to this buffer.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.block)
    }

    /// Returns true if both handles refer to the same block.
    #[inline]
    pub fn ptr_eq(&self, other: &MessageBuffer) -> bool {
        Rc::ptr_eq(&self.block, &other.block)
    }

    /// Claimed region of the buffer.
    #[inline]
    pub(crate) fn claimed(&self) -> (usize, usize) {
        (self.block.low.get(), self.block.high.get())
    }

    /// Mark `[start, end)` as claimed by a fresh part. Only valid on a buffer
    /// that has not been claimed yet.
    pub(crate) fn claim_fresh(&self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.block.cap);
        self.block.low.set(start);
        self.block.high.set(end);
    }

    /// Bytes that can be appended after a part ending at `end` without
    /// touching bytes visible to anyone else.
    #[inline]
    pub(crate) fn room_after(&self, end: usize) -> usize {
        if self.block.high.get() == end {
            self.block.cap - end
        } else {
            0
        }
    }

    /// Write `data` at the current high mark and extend the claim.
    pub(crate) fn append_claim(&self, data: &[u8]) {
        let high = self.block.high.get();
        assert!(high + data.len() <= self.block.cap, "append past buffer end");
        // SAFETY: bytes at and above `high` are not visible to any part, so no
        // shared slice overlaps the destination.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.block.ptr.as_ptr().add(high),
                data.len(),
            );
        }
        self.block.high.set(high + data.len());
    }

    /// Write `data` so that it ends at `end` and lower the claim to cover it.
    ///
    /// `end` must be the low mark, or the buffer must have a single owner.
    pub(crate) fn prepend_claim(&self, end: usize, data: &[u8]) {
        assert!(data.len() <= end, "prepend before buffer start");
        let start = end - data.len();
        debug_assert!(end <= self.block.low.get() || self.ref_count() == 1);
        // SAFETY: the destination lies below the claimed region, or the caller
        // holds the only reference to this buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.block.ptr.as_ptr().add(start),
                data.len(),
            );
        }
        if start < self.block.low.get() {
            self.block.low.set(start);
        }
    }

    /// Unclaimed bytes at and above the high mark.
    ///
    /// # Safety
    ///
    /// The caller must not hold another slice returned by this method for the
    /// same buffer, and must call [`MessageBuffer::commit`] only for bytes it
    /// actually wrote.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn spare_mut(&self) -> &mut [u8] {
        let high = self.block.high.get();
        // SAFETY: nothing above `high` is visible through any part.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.block.ptr.as_ptr().add(high),
                self.block.cap - high,
            )
        }
    }

    /// Extend the claim over `n` bytes written through `spare_mut`.
    pub(crate) fn commit(&self, n: usize) {
        let high = self.block.high.get();
        assert!(
            high + n <= self.block.cap,
            "commit({}) exceeds spare capacity ({})",
            n,
            self.block.cap - high
        );
        self.block.high.set(high + n);
    }

    /// Borrow `[start, end)` of the buffer.
    #[inline]
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.block.cap, "slice out of bounds");
        // SAFETY: in bounds; claimed bytes are never written while shared.
        unsafe { std::slice::from_raw_parts(self.block.ptr.as_ptr().add(start), end - start) }
    }

    /// Raw pointer to the start of the buffer, for in-place transforms on
    /// exclusively owned buffers.
    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.block.ptr.as_ptr()
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("capacity", &self.block.cap)
            .field("claimed", &self.claimed())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_rounding() {
        assert_eq!(size_class(0), 0);
        assert_eq!(size_class(48), 0);
        assert_eq!(size_class(49), 1);
        assert_eq!(size_class(2000), 2);
        assert_eq!(size_class(16385), 4);
        assert_eq!(size_class(10 * MAX_BUFFER_SIZE), 4);
    }

    #[test]
    fn test_allocate_rounds_up() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let buf = alloc.allocate(2000).unwrap();
        assert_eq!(buf.capacity(), 2048);
        assert_eq!(alloc.budget().used(), 2048);
    }

    #[test]
    fn test_budget_exhaustion_returns_none() {
        let alloc = BufferAllocator::with_limit(4096);
        let a = alloc.allocate(2048).unwrap();
        let b = alloc.allocate(2048).unwrap();
        assert!(alloc.allocate(1).is_none());
        drop(a);
        assert!(alloc.allocate(1).is_some());
        drop(b);
    }

    #[test]
    fn test_request_over_budget() {
        let alloc = BufferAllocator::with_limit(1024);
        assert!(alloc.allocate(2000).is_none());
        assert_eq!(alloc.budget().used(), 0);
    }

    #[test]
    fn test_free_restores_budget_and_caches() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let buf = alloc.allocate(100).unwrap();
        assert_eq!(alloc.stats().classes[1].live, 1);
        drop(buf);

        let stats = alloc.stats();
        assert_eq!(stats.budget_used, 0);
        assert_eq!(stats.classes[1].live, 0);
        assert_eq!(stats.classes[1].cached, 1);

        // reuse comes from the cache
        let _buf = alloc.allocate(100).unwrap();
        assert_eq!(alloc.stats().classes[1].cached, 0);
    }

    #[test]
    fn test_cache_limit() {
        let alloc = BufferAllocator::with_cache_limit(MemoryBudget::new(1 << 20), 1);
        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(10).unwrap();
        drop(a);
        drop(b);
        assert_eq!(alloc.stats().classes[0].cached, 1);
    }

    #[test]
    fn test_shared_budget_between_allocators() {
        let budget = MemoryBudget::new(48 * 2);
        let a = BufferAllocator::new(budget.clone());
        let b = BufferAllocator::new(budget.clone());
        let _x = a.allocate(1).unwrap();
        let _y = b.allocate(1).unwrap();
        assert!(a.allocate(1).is_none());
        assert_eq!(budget.available(), 0);
    }

    #[test]
    fn test_refcount() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let buf = alloc.allocate(10).unwrap();
        assert_eq!(buf.ref_count(), 1);
        let other = buf.clone();
        assert_eq!(buf.ref_count(), 2);
        assert!(buf.ptr_eq(&other));
        drop(other);
        assert_eq!(buf.ref_count(), 1);
    }

    #[test]
    fn test_claims() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let buf = alloc.allocate(48).unwrap();
        buf.claim_fresh(10, 10);
        buf.append_claim(b"world");
        assert_eq!(buf.claimed(), (10, 15));
        assert_eq!(buf.room_after(15), 33);
        assert_eq!(buf.room_after(12), 0);

        buf.prepend_claim(10, b"hello");
        assert_eq!(buf.claimed(), (5, 15));
        assert_eq!(buf.slice(5, 15), b"helloworld");
    }
}
