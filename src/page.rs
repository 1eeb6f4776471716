//! Fixed-size tuple pages.
//!
//! Both the hash table's bucket chains and the paged tables store tuples in
//! the same kind of page: a zeroed, cache-line aligned block with a bump
//! pointer. The block is held through a raw pointer so that its address is
//! stable for as long as the page lives, no matter how the owning `Vec` of
//! pages grows. Shared-allocation paths rely on that to hand out slots while
//! other threads keep appending pages.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::slice;

pub const CACHE_LINE_SIZE: usize = 64;

/// Owned, zero-initialised byte block.
pub struct PageBuf {
    data: NonNull<u8>,
    capacity: usize,
}

// SAFETY: PageBuf exclusively owns its allocation; all shared mutation goes
// through the unsafe `slot_ptr` contract.
unsafe impl Send for PageBuf {}
unsafe impl Sync for PageBuf {}

impl PageBuf {
    pub fn zeroed(capacity: usize) -> Self {
        assert!(capacity > 0, "page capacity must be non-zero");
        let layout = Self::layout(capacity);
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let data = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { data, capacity }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, CACHE_LINE_SIZE).expect("invalid page layout")
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the block is initialised (zeroed) and lives as long as self.
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.capacity) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.capacity) }
    }

    /// Raw pointer to byte `offset` of the block.
    #[inline(always)]
    pub fn slot_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is within (or one past) the allocation.
        unsafe { self.data.as_ptr().add(offset) }
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.data.as_ptr(), Self::layout(self.capacity)) }
    }
}

/// A page of fixed-width tuples filled front to back.
pub struct TuplePage {
    buf: PageBuf,
    tuple_size: usize,
    used: usize,
}

impl TuplePage {
    /// Creates an empty page of `capacity` bytes holding `tuple_size`-byte
    /// tuples. Panics if a single tuple does not fit.
    pub fn new(capacity: usize, tuple_size: usize) -> Self {
        assert!(tuple_size > 0, "tuple size must be non-zero");
        assert!(
            tuple_size <= capacity,
            "tuple of {tuple_size} bytes does not fit a {capacity}-byte page"
        );
        Self {
            buf: PageBuf::zeroed(capacity),
            tuple_size,
            used: 0,
        }
    }

    #[inline(always)]
    pub fn can_store(&self) -> bool {
        self.used + self.tuple_size <= self.buf.capacity()
    }

    /// Reserves the next slot and returns its byte offset, or `None` when
    /// the page is full.
    #[inline(always)]
    pub fn reserve(&mut self) -> Option<usize> {
        if !self.can_store() {
            return None;
        }
        let offset = self.used;
        self.used += self.tuple_size;
        Some(offset)
    }

    #[inline(always)]
    pub fn allocate_tuple(&mut self) -> Option<&mut [u8]> {
        let offset = self.reserve()?;
        let size = self.tuple_size;
        Some(&mut self.buf.as_mut_slice()[offset..offset + size])
    }

    #[inline(always)]
    pub fn slot_mut(&mut self, offset: usize) -> &mut [u8] {
        let size = self.tuple_size;
        &mut self.buf.as_mut_slice()[offset..offset + size]
    }

    /// Raw pointer to the slot at byte `offset`, for writers that reserved
    /// the slot under a lock and fill it after releasing it.
    #[inline(always)]
    pub(crate) fn slot_ptr(&self, offset: usize) -> *mut u8 {
        self.buf.slot_ptr(offset)
    }

    #[inline(always)]
    pub fn tuple(&self, pos: usize) -> Option<&[u8]> {
        let offset = pos.checked_mul(self.tuple_size)?;
        if offset < self.used {
            Some(&self.buf.as_slice()[offset..offset + self.tuple_size])
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn tuples(&self) -> std::slice::ChunksExact<'_, u8> {
        self.as_bytes().chunks_exact(self.tuple_size)
    }

    /// The filled prefix of the page.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_slice()[..self.used]
    }

    pub fn len(&self) -> usize {
        self.used / self.tuple_size
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }
}

/// Reserves a tuple slot in the last page of `pages`, appending a fresh page
/// when it is full. Returns `(page index, byte offset)`.
#[inline(always)]
pub(crate) fn reserve_slot(
    pages: &mut Vec<TuplePage>,
    page_size: usize,
    tuple_size: usize,
) -> (usize, usize) {
    loop {
        if let Some(offset) = pages.last_mut().and_then(TuplePage::reserve) {
            return (pages.len() - 1, offset);
        }
        pages.push(TuplePage::new(page_size, tuple_size));
    }
}
