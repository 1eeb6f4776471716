//! Cross-query hash table reuse.
//!
//! Repeated joins against the same build input under shifting key-range
//! predicates spend most of their time building hash tables. The cache keeps
//! every table it has built, tagged with the key interval it covers, and
//! hands one back when a new predicate overlaps it closely enough. A reused
//! table is only topped up with the keys it is missing.
//!
//! Entries are kept newest first. The cache size is the sum of the tagged
//! interval widths, a proxy for memory that does not need per-table byte
//! accounting. Eviction drops the oldest tail once that sum passes the
//! budget.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{JoinError, Result};
use crate::hashtable::HashTable;
use crate::range::{KeyRange, KeySet};
use crate::table::Table;

pub const DEFAULT_REUSE_THRESHOLD: f64 = 0.3;
pub const DEFAULT_KEYS_PER_BUCKET: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Budget for the summed interval widths of all entries.
    pub max_size: u64,
    /// Minimum containment ratio for reuse.
    pub reuse_threshold: f64,
    /// Key values per hash bucket when sizing a new table.
    pub keys_per_bucket: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: u64::MAX,
            reuse_threshold: DEFAULT_REUSE_THRESHOLD,
            keys_per_bucket: DEFAULT_KEYS_PER_BUCKET,
        }
    }
}

/// Stable handle to a cache entry. Never reused, so a handle to an evicted
/// entry simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

/// A hash table tagged with the key interval it serves.
pub struct CacheEntry {
    id: EntryId,
    range: KeyRange,
    built: KeySet,
    table: HashTable,
    fresh: bool,
    source: Option<Arc<Table>>,
}

impl CacheEntry {
    fn new(id: EntryId, range: KeyRange, table: HashTable) -> Self {
        Self {
            id,
            range,
            built: KeySet::new(),
            table,
            fresh: true,
            source: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Interval the entry is tagged with.
    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Keys already in the table. The tag may be wider than this: a reuse
    /// widens the tag before the build that fills it.
    pub fn built(&self) -> &KeySet {
        &self.built
    }

    /// True until the first build into this entry completes.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.table
    }

    pub fn hash_table_mut(&mut self) -> &mut HashTable {
        &mut self.table
    }

    /// Build table that back-references stored in this entry point into.
    pub fn source(&self) -> Option<&Arc<Table>> {
        self.source.as_ref()
    }

    /// Pins `table` as the target of stored back-references. Rejects a table
    /// other than the one already pinned.
    pub fn bind_source(&mut self, table: &Arc<Table>) -> Result<()> {
        match &self.source {
            Some(pinned) if !Arc::ptr_eq(pinned, table) => Err(JoinError::BuildSideMismatch),
            Some(_) => Ok(()),
            None => {
                self.source = Some(Arc::clone(table));
                Ok(())
            }
        }
    }

    /// Records that every key of `range` is now in the table. Keys between
    /// `range` and earlier builds stay unbuilt.
    pub fn mark_built(&mut self, range: KeyRange) {
        self.built.insert(range);
        self.range = self.range.union(&range);
        self.fresh = false;
    }
}

pub struct ReuseCache {
    config: CacheConfig,
    enabled: bool,
    entries: VecDeque<CacheEntry>,
    current_size: u64,
    untracked: u64,
    next_id: u64,
}

impl ReuseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            enabled: true,
            entries: VecDeque::new(),
            current_size: 0,
            untracked: 0,
            next_id: 0,
        }
    }

    /// A cache of size one that is always reused. The single table is
    /// widened by every acquire whatever the overlap, and each build only
    /// adds the keys it is missing. It is never evicted.
    pub fn disabled() -> Self {
        let mut cache = Self::new(CacheConfig::default());
        cache.enabled = false;
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Entries, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> + '_ {
        self.entries.iter()
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.position(id).map(|i| &self.entries[i])
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        let i = self.position(id)?;
        Some(&mut self.entries[i])
    }

    /// Creates a table sized for `range`, tags it and makes it the newest
    /// entry. A disabled cache drops its previous table first.
    pub fn insert(&mut self, range: KeyRange, bucket_size: usize, tuple_size: usize) -> EntryId {
        if !self.enabled {
            self.destroy();
        }
        let nbuckets = (range.width() / self.config.keys_per_bucket.max(1)).max(1);
        let nbuckets = usize::try_from(nbuckets).unwrap_or(usize::MAX);
        let id = EntryId(self.next_id);
        self.next_id += 1;

        self.entries
            .push_front(CacheEntry::new(id, range, HashTable::new(nbuckets, bucket_size, tuple_size)));
        self.current_size = self.current_size.saturating_add(range.width());
        debug!(%range, nbuckets, current_size = self.current_size, "cached new hash table");
        id
    }

    /// Picks the overlapping entry whose interval best contains `range`.
    ///
    /// The containment ratio is `|range| / |range ∪ entry|`; the highest
    /// ratio wins, ties going to the newer entry. Below the reuse threshold
    /// nothing is returned. A chosen entry has its tag widened to cover
    /// `range`.
    pub fn get_reusable_ht(&mut self, range: KeyRange) -> Option<EntryId> {
        let i = self.reusable_position(range)?;
        Some(self.entries[i].id)
    }

    fn reusable_position(&mut self, range: KeyRange) -> Option<usize> {
        if !self.enabled {
            return (!self.entries.is_empty()).then(|| self.widen(0, range, 1.0));
        }

        let mut best = None;
        let mut best_ratio = 0.0_f64;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.range.overlaps(&range) {
                continue;
            }
            let hull = entry.range.union(&range);
            let ratio = range.width() as f64 / hull.width() as f64;
            if ratio > best_ratio {
                best = Some(i);
                best_ratio = ratio;
            }
        }

        let i = best?;
        if best_ratio < self.config.reuse_threshold {
            debug!(%range, best_ratio, "no reusable hash table");
            return None;
        }
        Some(self.widen(i, range, best_ratio))
    }

    fn widen(&mut self, i: usize, range: KeyRange, ratio: f64) -> usize {
        let entry = &mut self.entries[i];
        let widened = entry.range.union(&range);
        self.current_size = self
            .current_size
            .saturating_add(widened.width() - entry.range.width());
        debug!(%range, tagged = %entry.range, %widened, ratio, "reusing hash table");
        entry.range = widened;
        i
    }

    /// Returns a reusable entry for `range`, or inserts a fresh one. The flag
    /// tells whether the entry was reused.
    pub fn acquire(
        &mut self,
        range: KeyRange,
        bucket_size: usize,
        tuple_size: usize,
    ) -> (&mut CacheEntry, bool) {
        match self.reusable_position(range) {
            Some(i) => (&mut self.entries[i], true),
            None => {
                self.insert(range, bucket_size, tuple_size);
                (&mut self.entries[0], false)
            }
        }
    }

    /// Adjusts the size counter for memory tracked outside the tagged
    /// intervals. The amount counts against the budget in the next
    /// [`garbage_collection`](Self::garbage_collection). An eviction
    /// recomputes the size from the surviving entries and drops it.
    pub fn add_cache(&mut self, additional: u64) {
        self.untracked = self.untracked.saturating_add(additional);
        self.current_size = self.current_size.saturating_add(additional);
    }

    /// Evicts the oldest entries once the size exceeds the budget.
    ///
    /// Walks from the newest entry summing interval widths on top of any
    /// [`add_cache`](Self::add_cache) amount; the entry that pushes the sum
    /// past the budget and everything older goes. Returns the number of
    /// evicted entries. A disabled cache keeps its single table.
    pub fn garbage_collection(&mut self) -> usize {
        if !self.enabled || self.current_size <= self.config.max_size {
            debug!(
                max_size = self.config.max_size,
                current_size = self.current_size,
                "cache within budget"
            );
            return 0;
        }

        let mut total = self.untracked;
        let cut = self
            .entries
            .iter()
            .position(|e| {
                total = total.saturating_add(e.range.width());
                total > self.config.max_size
            })
            .unwrap_or(self.entries.len());

        let evicted = self.entries.len() - cut;
        for entry in self.entries.drain(cut..) {
            debug!(range = %entry.range, records = entry.table.len(), "evicting hash table");
        }
        self.untracked = 0;
        self.current_size = self.entries.iter().map(|e| e.range.width()).sum();
        if evicted > 0 {
            info!(evicted, current_size = self.current_size, "garbage collection finished");
        }
        evicted
    }

    /// Drops every entry.
    pub fn destroy(&mut self) {
        self.entries.clear();
        self.current_size = 0;
        self.untracked = 0;
    }
}
