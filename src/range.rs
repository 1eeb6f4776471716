/// Half-open interval `[start, end)` of join-key values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: i64,
    pub end: i64,
}

impl KeyRange {
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start <= end, "inverted range [{start},{end})");
        Self { start, end }
    }

    #[inline(always)]
    pub fn contains(&self, key: i64) -> bool {
        self.start <= key && key < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Number of key values covered. Used as the cache size proxy.
    pub fn width(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end.abs_diff(self.start)
        }
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// Smallest interval covering both. An empty side is ignored.
    pub fn union(&self, other: &KeyRange) -> KeyRange {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        KeyRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Sorted, disjoint intervals. Touching intervals are merged on insert, so
/// a gap between two members always holds keys outside the set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet {
    intervals: Vec<KeyRange>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[KeyRange] {
        &self.intervals
    }

    #[inline]
    pub fn contains(&self, key: i64) -> bool {
        let i = self.intervals.partition_point(|r| r.end <= key);
        self.intervals.get(i).is_some_and(|r| r.contains(key))
    }

    /// Adds every key of `range`, merging it with the members it overlaps or
    /// touches.
    pub fn insert(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let lo = self.intervals.partition_point(|r| r.end < range.start);
        let hi = self.intervals.partition_point(|r| r.start <= range.end);
        let merged = self.intervals[lo..hi].iter().fold(range, |acc, r| acc.union(r));
        self.intervals.splice(lo..hi, std::iter::once(merged));
    }
}

impl std::fmt::Display for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.intervals.is_empty() {
            return f.write_str("{}");
        }
        for (i, r) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}
