//! Ordered set of non-overlapping, non-abutting closed byte ranges. This is
//!  the bookkeeping behind selective acknowledgement: the receiver tracks
//!  which red-part bytes have arrived, and the sender subtracts a report's
//!  claims from the report window to find what to retransmit.
//!
//! Backed by a `BTreeMap<begin, end>`; the merge/split work on insert and
//!  remove touches only the affected neighbours, so both are
//!  `O(log n + k)` for `k` affected ranges.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Closed interval `[begin, end]` of byte indices.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FragmentRange {
    pub begin: u64,
    pub end: u64,
}
impl FragmentRange {
    pub fn new(begin: u64, end: u64) -> FragmentRange {
        debug_assert!(begin <= end);
        FragmentRange { begin, end }
    }

    /// The `[offset, offset + length)` convention used by data segments;
    ///  `length` must be at least 1.
    pub fn from_offset_and_length(offset: u64, length: u64) -> FragmentRange {
        debug_assert!(length >= 1);
        FragmentRange { begin: offset, end: offset + length - 1 }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }
}
impl Display for FragmentRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.begin, self.end)
    }
}

#[derive(Clone, Default, Debug)]
pub struct FragmentSet {
    ranges: BTreeMap<u64, u64>,
}

impl FragmentSet {
    pub fn new() -> FragmentSet {
        FragmentSet::default()
    }

    /// Inserts `key`, merging with every stored range it overlaps or abuts.
    ///  Returns whether the set changed.
    pub fn insert(&mut self, key: FragmentRange) -> bool {
        let mut merged = key;
        let mut to_remove = Vec::new();

        // candidates are the stored ranges with begin <= key.end + 1,
        //  scanned backwards until one ends left of key.begin - 1
        for (&begin, &end) in self.ranges.range(..=key.end.saturating_add(1)).rev() {
            if end.saturating_add(1) < merged.begin {
                break;
            }
            if begin <= key.begin && end >= key.end {
                // fully contained in an existing range
                return false;
            }
            to_remove.push(begin);
            merged.begin = merged.begin.min(begin);
            merged.end = merged.end.max(end);
        }

        for begin in to_remove {
            self.ranges.remove(&begin);
        }
        self.ranges.insert(merged.begin, merged.end);
        true
    }

    /// Subtracts `key`, trimming or splitting stored ranges as needed.
    ///  Returns whether the set changed.
    pub fn remove(&mut self, key: FragmentRange) -> bool {
        let mut affected = Vec::new();
        for (&begin, &end) in self.ranges.range(..=key.end).rev() {
            if end < key.begin {
                break;
            }
            affected.push((begin, end));
        }
        if affected.is_empty() {
            return false;
        }

        for (begin, end) in affected {
            self.ranges.remove(&begin);
            if begin < key.begin {
                self.ranges.insert(begin, key.begin - 1);
            }
            if end > key.end {
                self.ranges.insert(key.end + 1, end);
            }
        }
        true
    }

    /// True if a single stored range covers all of `key`.
    pub fn contains_entirely(&self, key: FragmentRange) -> bool {
        self.ranges
            .range(..=key.begin)
            .next_back()
            .is_some_and(|(_, &end)| end >= key.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = FragmentRange> + '_ {
        self.ranges
            .iter()
            .map(|(&begin, &end)| FragmentRange { begin, end })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear()
    }

    /// The gaps within `bounds` not covered by `set`, in increasing order.
    pub fn bounds_minus(bounds: FragmentRange, set: &FragmentSet) -> FragmentSet {
        let mut gaps = FragmentSet::new();
        gaps.insert(bounds);
        for range in set.iter() {
            gaps.remove(range);
        }
        gaps
    }
}
