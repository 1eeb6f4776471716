//! Bucket-chained hash table for join build sides.
//!
//! ```text
//!  buckets[b] (chain, oldest .. newest)           locks[b]
//! ┌───────────────────────────────────────┐      ┌──────────┐
//! │ page 0 (full) │ page 1 (full) │ page 2│◄──── │ Mutex<()>│
//! └───────────────────────────────────────┘      └──────────┘
//!                                   ▲ head: allocations bump here
//! ```
//!
//! Each bucket owns a chain of fixed-size [`TuplePage`]s. Records are bump
//! allocated from the head page; when it cannot take another record a new
//! head is pushed. Chains only grow, so a scan starts at the newest page and
//! walks back to the oldest, reading each page front to back.
//!
//! Single-threaded builds allocate through `&mut HashTable`. Parallel builds
//! borrow the table mutably into an [`AtomicAllocator`], which serialises
//! allocations per bucket with one lock per bucket: two threads only contend
//! when they hash to the same bucket.

use std::cell::UnsafeCell;

use parking_lot::Mutex;

use crate::page::{TuplePage, reserve_slot};

pub struct HashTable {
    buckets: Box<[UnsafeCell<Vec<TuplePage>>]>,
    locks: Box<[Mutex<()>]>,
    bucket_size: usize,
    tuple_size: usize,
}

// SAFETY: chains are only mutated through `&mut HashTable` or through an
// `AtomicAllocator`, which holds the table's unique borrow and takes the
// bucket's lock around every chain update.
unsafe impl Sync for HashTable {}

impl HashTable {
    /// Creates `nbuckets` chains of one empty `bucket_size`-byte page each,
    /// holding `tuple_size`-byte records.
    pub fn new(nbuckets: usize, bucket_size: usize, tuple_size: usize) -> Self {
        assert!(nbuckets > 0, "hash table needs at least one bucket");
        assert!(
            tuple_size <= bucket_size,
            "{tuple_size}-byte records do not fit {bucket_size}-byte bucket pages"
        );
        let buckets = (0..nbuckets)
            .map(|_| UnsafeCell::new(vec![TuplePage::new(bucket_size, tuple_size)]))
            .collect();
        let locks = (0..nbuckets).map(|_| Mutex::new(())).collect();
        Self {
            buckets,
            locks,
            bucket_size,
            tuple_size,
        }
    }

    #[inline(always)]
    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    #[inline(always)]
    fn chain(&self, bucket: usize) -> &[TuplePage] {
        // SAFETY: see the `Sync` impl; no writer can exist while `&self` is
        // reachable outside an allocator.
        unsafe { &*self.buckets[bucket].get() }
    }

    /// Reserves one record slot in `bucket`.
    #[inline(always)]
    pub fn allocate(&mut self, bucket: usize) -> &mut [u8] {
        debug_assert!(bucket < self.nbuckets(), "bucket {bucket} out of range");
        let chain = self.buckets[bucket].get_mut();
        let (page, offset) = reserve_slot(chain, self.bucket_size, self.tuple_size);
        chain[page].slot_mut(offset)
    }

    /// Shared allocation handle for concurrent builders.
    pub fn atomic_allocator(&mut self) -> AtomicAllocator<'_> {
        AtomicAllocator { table: self }
    }

    /// An unplaced iterator; see [`HashTable::place`].
    pub fn iterator(&self) -> BucketIter<'_> {
        BucketIter {
            pages: &[],
            page: 0,
            cur: &[],
            tuple_size: self.tuple_size,
        }
    }

    /// Points `it` at the head page of `bucket`.
    #[inline(always)]
    pub fn place<'a>(&'a self, it: &mut BucketIter<'a>, bucket: usize) {
        let chain = self.chain(bucket);
        it.pages = chain;
        it.page = chain.len();
        it.cur = &[];
    }

    /// Iterator over every record of `bucket`, newest page first.
    pub fn bucket(&self, bucket: usize) -> BucketIter<'_> {
        let mut it = self.iterator();
        self.place(&mut it, bucket);
        it
    }

    /// Hints the CPU to pull the head page of `bucket` into cache.
    #[inline(always)]
    pub fn prefetch(&self, bucket: usize) {
        if let Some(head) = self.buckets.get(bucket).and_then(|_| self.chain(bucket).last()) {
            prefetch_read(head.slot_ptr(0));
        }
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        (0..self.nbuckets())
            .map(|b| self.chain(b).iter().map(TuplePage::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_count(&self) -> usize {
        (0..self.nbuckets()).map(|b| self.chain(b).len()).sum()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.page_count() * self.bucket_size
    }
}

/// Concurrent allocation into a [`HashTable`].
///
/// Holds the table's unique borrow, so no scan can observe a half-written
/// record. Slots handed out by [`atomic_allocate`](Self::atomic_allocate)
/// live as long as the borrow of the allocator they came from.
pub struct AtomicAllocator<'a> {
    table: &'a HashTable,
}

impl<'a> AtomicAllocator<'a> {
    /// Reserves one record slot in `bucket` under that bucket's lock. The
    /// caller fills the slot after the lock is released.
    #[inline(always)]
    pub fn atomic_allocate(&self, bucket: usize) -> &mut [u8] {
        let table = self.table;
        debug_assert!(bucket < table.nbuckets(), "bucket {bucket} out of range");
        let slot = {
            let _guard = table.locks[bucket].lock();
            // SAFETY: the bucket lock gives this thread exclusive access to
            // the chain bookkeeping. Only `used` counters and the page list
            // are touched, never bytes of previously handed out slots.
            let chain = unsafe { &mut *table.buckets[bucket].get() };
            let (page, offset) = reserve_slot(chain, table.bucket_size, table.tuple_size);
            chain[page].slot_ptr(offset)
        };
        // SAFETY: the slot was reserved for this call alone and its page
        // block neither moves nor is freed while the table is borrowed.
        unsafe { std::slice::from_raw_parts_mut(slot, table.tuple_size) }
    }

    /// Ends concurrent allocation and gives back read access.
    pub fn finish(self) -> &'a HashTable {
        self.table
    }
}

/// Allocation interface shared by the serial and concurrent build paths.
pub trait SlotAllocator {
    fn nbuckets(&self) -> usize;

    fn slot(&mut self, bucket: usize) -> &mut [u8];
}

impl SlotAllocator for HashTable {
    #[inline(always)]
    fn nbuckets(&self) -> usize {
        HashTable::nbuckets(self)
    }

    #[inline(always)]
    fn slot(&mut self, bucket: usize) -> &mut [u8] {
        self.allocate(bucket)
    }
}

impl SlotAllocator for &AtomicAllocator<'_> {
    #[inline(always)]
    fn nbuckets(&self) -> usize {
        self.table.nbuckets()
    }

    #[inline(always)]
    fn slot(&mut self, bucket: usize) -> &mut [u8] {
        self.atomic_allocate(bucket)
    }
}

/// Forward-only scan over one bucket chain.
pub struct BucketIter<'a> {
    pages: &'a [TuplePage],
    /// Pages not yet entered; the next one is `pages[page - 1]`.
    page: usize,
    /// Unread part of the current page.
    cur: &'a [u8],
    tuple_size: usize,
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = &'a [u8];

    #[inline(always)]
    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            if self.cur.len() >= self.tuple_size {
                let (record, rest) = self.cur.split_at(self.tuple_size);
                self.cur = rest;
                return Some(record);
            }
            if self.page == 0 {
                return None;
            }
            self.page -= 1;
            self.cur = self.pages[self.page].as_bytes();
        }
    }
}

#[inline(always)]
fn prefetch_read(ptr: *const u8) {
    #[cfg(feature = "nightly")]
    unsafe {
        std::intrinsics::prefetch_read_data::<u8, 3>(ptr);
    }
    #[cfg(all(not(feature = "nightly"), target_arch = "x86_64"))]
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8);
    }
    #[cfg(all(not(feature = "nightly"), not(target_arch = "x86_64")))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const RECORD: usize = 8;

    fn put(table: &mut HashTable, bucket: usize, v: u64) {
        table.allocate(bucket).copy_from_slice(&v.to_le_bytes());
    }

    fn read(record: &[u8]) -> u64 {
        u64::from_le_bytes(record.try_into().unwrap())
    }

    fn contents(table: &HashTable, bucket: usize) -> Vec<u64> {
        table.bucket(bucket).map(read).collect()
    }

    #[test]
    fn starts_with_one_empty_page_per_bucket() {
        let table = HashTable::new(16, 64, RECORD);
        assert_eq!(table.nbuckets(), 16);
        assert_eq!(table.page_count(), 16);
        assert!(table.is_empty());
        for b in 0..16 {
            assert_eq!(table.bucket(b).count(), 0);
        }
    }

    #[test]
    fn overflow_chain_is_scanned_newest_page_first() {
        // 32-byte pages hold four records.
        let mut table = HashTable::new(1, 32, RECORD);
        for v in 0..10 {
            put(&mut table, 0, v);
        }
        assert_eq!(table.page_count(), 3);
        assert_eq!(contents(&table, 0), vec![8, 9, 4, 5, 6, 7, 0, 1, 2, 3]);
    }

    #[test]
    fn page_tail_smaller_than_a_record_is_skipped() {
        // 20-byte pages hold two records; 4 bytes per page stay unused.
        let mut table = HashTable::new(1, 20, RECORD);
        for v in 0..5 {
            put(&mut table, 0, v);
        }
        assert_eq!(table.page_count(), 3);
        assert_eq!(contents(&table, 0), vec![4, 2, 3, 0, 1]);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn buckets_are_independent() {
        let mut table = HashTable::new(4, 32, RECORD);
        for v in 0..40 {
            put(&mut table, (v % 4) as usize, v);
        }
        for b in 0..4 {
            let mut got = contents(&table, b);
            got.sort();
            let expected: Vec<u64> = (0..40).filter(|v| v % 4 == b as u64).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn iterator_can_be_replaced() {
        let mut table = HashTable::new(2, 32, RECORD);
        put(&mut table, 0, 1);
        put(&mut table, 1, 2);
        put(&mut table, 1, 3);

        let mut it = table.iterator();
        assert!(it.next().is_none());
        table.place(&mut it, 1);
        assert_eq!(it.next().map(read), Some(2));
        table.place(&mut it, 0);
        assert_eq!(it.by_ref().map(read).collect::<Vec<_>>(), vec![1]);
        assert!(it.next().is_none());
    }

    #[test]
    fn prefetch_is_harmless() {
        let mut table = HashTable::new(8, 64, RECORD);
        put(&mut table, 3, 7);
        for b in 0..16 {
            table.prefetch(b);
        }
        assert_eq!(contents(&table, 3), vec![7]);
    }

    #[test]
    #[should_panic]
    fn record_larger_than_page_panics() {
        let _ = HashTable::new(1, 8, 16);
    }

    #[test]
    fn concurrent_allocation_loses_nothing() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 2_000;
        let mut table = HashTable::new(4, 64, RECORD);
        {
            let alloc = table.atomic_allocator();
            thread::scope(|s| {
                for t in 0..THREADS {
                    let alloc = &alloc;
                    s.spawn(move || {
                        for i in 0..PER_THREAD {
                            let v = t * PER_THREAD + i;
                            alloc
                                .atomic_allocate((v % 4) as usize)
                                .copy_from_slice(&v.to_le_bytes());
                        }
                    });
                }
            });
        }

        assert_eq!(table.len() as u64, THREADS * PER_THREAD);
        let mut all = Vec::new();
        for b in 0..4 {
            for v in contents(&table, b) {
                assert_eq!(v % 4, b as u64, "record {v} in wrong bucket");
                all.push(v);
            }
        }
        all.sort();
        assert_eq!(all, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }

    #[test]
    fn shuttle_concurrent_allocation() {
        shuttle::check_random(
            || {
                let table: &'static mut HashTable = Box::leak(Box::new(HashTable::new(2, 32, RECORD)));
                let alloc = Arc::new(table.atomic_allocator());
                let mut handles = vec![];

                for t in 0..4u64 {
                    let a = alloc.clone();
                    handles.push(shuttle::thread::spawn(move || {
                        for j in 0..6 {
                            let v = t * 10 + j;
                            a.atomic_allocate((v % 2) as usize)
                                .copy_from_slice(&v.to_le_bytes());
                            shuttle::thread::yield_now();
                        }
                    }));
                }

                for h in handles {
                    h.join().unwrap();
                }

                let table = Arc::try_unwrap(alloc).ok().unwrap().finish();
                let mut all: Vec<u64> = (0..2).flat_map(|b| contents(table, b)).collect();
                all.sort();
                let expected: Vec<u64> =
                    (0..4u64).flat_map(|t| (0..6).map(move |j| t * 10 + j)).collect();
                assert_eq!(all, expected);
            },
            100,
        );
    }
}
