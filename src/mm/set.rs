use alloc::{collections::BTreeMap, vec::Vec};
use core::ops::Bound;

use crate::addr::{AddrRange, VirtualAddress};

/// A value stored over a range of addresses in a [`RangeSet`].
pub(crate) trait Segment: Sized {
    /// Split the value for `range` at `at`: `self` keeps `[range.start, at)`
    /// and the returned value describes `[at, range.end)`.
    fn split_at(&mut self, range: AddrRange, at: VirtualAddress) -> Self;

    /// Try to absorb `next`, which directly follows `range`. Returns false if
    /// the two describe different things.
    fn try_merge(&mut self, range: AddrRange, next: &Self, next_range: AddrRange) -> bool;
}

#[derive(Debug)]
struct Entry<V> {
    end: VirtualAddress,
    value: V,
}

/// Non-overlapping, non-empty ranges of addresses keyed by start, each holding
/// a value. All splitting and merging goes through here.
#[derive(Debug)]
pub(crate) struct RangeSet<V> {
    map: BTreeMap<VirtualAddress, Entry<V>>,
}

impl<V> Default for RangeSet<V> {
    fn default() -> Self {
        Self { map: BTreeMap::new() }
    }
}

impl<V: Segment> RangeSet<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns the segment, if any, which occupies the specified address
    pub fn contains(&self, address: VirtualAddress) -> Option<(AddrRange, &V)> {
        self.map
            .range(..=address)
            .next_back()
            .filter(|(_, entry)| address < entry.end)
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
    }

    pub fn contains_mut(&mut self, address: VirtualAddress) -> Option<(AddrRange, &mut V)> {
        self.map
            .range_mut(..=address)
            .next_back()
            .filter(|(_, entry)| address < entry.end)
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &mut entry.value))
    }

    /// The first segment starting at or after `address`.
    pub fn next_after(&self, address: VirtualAddress) -> Option<(AddrRange, &V)> {
        self.map
            .range(address..)
            .next()
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
    }

    /// The last segment ending at or before `address`.
    pub fn prev_before(&self, address: VirtualAddress) -> Option<(AddrRange, &V)> {
        self.map
            .range(..address)
            .next_back()
            .filter(|(_, entry)| entry.end <= address)
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
            .or_else(|| {
                // The segment right below may contain `address`; skip it.
                let (start, _) = self.map.range(..address).next_back()?;
                self.map
                    .range(..*start)
                    .next_back()
                    .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
            })
    }

    fn first_key(&self, requested: AddrRange) -> VirtualAddress {
        self.contains(requested.start())
            .map_or(requested.start(), |(range, _)| range.start())
    }

    /// Returns an iterator over all segments that occupy some part of the
    /// requested range
    pub fn conflicts(&self, requested: AddrRange) -> impl Iterator<Item = (AddrRange, &V)> + '_ {
        let first = self.first_key(requested);
        self.map
            .range(first..)
            .take_while(move |(start, _)| **start < requested.end())
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
    }

    pub fn conflicts_mut(
        &mut self,
        requested: AddrRange,
    ) -> impl Iterator<Item = (AddrRange, &mut V)> + '_ {
        let first = self.first_key(requested);
        self.map
            .range_mut(first..)
            .take_while(move |(start, _)| **start < requested.end())
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &mut entry.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AddrRange, &V)> + '_ {
        self.map
            .iter()
            .map(|(start, entry)| (AddrRange::new(*start, entry.end), &entry.value))
    }

    /// Sub-ranges of `requested` not occupied by any segment, in order.
    pub fn gaps(&self, requested: AddrRange) -> Vec<AddrRange> {
        let mut gaps = Vec::new();
        let mut cursor = requested.start();
        for (range, _) in self.conflicts(requested) {
            if cursor < range.start() {
                gaps.push(AddrRange::new(cursor, range.start()));
            }
            cursor = cursor.max(range.end());
        }
        if cursor < requested.end() {
            gaps.push(AddrRange::new(cursor, requested.end()));
        }
        gaps
    }

    /// Whether segments occupy every address of `requested`.
    pub fn is_covered(&self, requested: AddrRange) -> bool {
        self.gaps(requested).is_empty()
    }

    /// The largest unoccupied range containing `requested`, bounded by `bounds`.
    pub fn gap_around(&self, requested: AddrRange, bounds: AddrRange) -> AddrRange {
        let start = self
            .map
            .range((Bound::Unbounded, Bound::Included(requested.start())))
            .next_back()
            .map_or(bounds.start(), |(_, entry)| entry.end.max(bounds.start()));
        let end = self
            .map
            .range(requested.end()..)
            .next()
            .map_or(bounds.end(), |(start, _)| (*start).min(bounds.end()));
        AddrRange::new(start.min(requested.start()), end.max(requested.end()))
    }

    fn split_at(&mut self, at: VirtualAddress) {
        let Some((start, entry)) = self.map.range_mut(..at).next_back() else {
            return;
        };
        if entry.end <= at {
            return;
        }
        let range = AddrRange::new(*start, entry.end);
        let value = entry.value.split_at(range, at);
        let end = core::mem::replace(&mut entry.end, at);
        self.map.insert(at, Entry { end, value });
    }

    /// Split segments so that none straddles the bounds of `requested`.
    pub fn isolate(&mut self, requested: AddrRange) {
        self.split_at(requested.start());
        self.split_at(requested.end());
    }

    /// Insert a segment. Overlapping an existing segment is a broken
    /// invariant.
    pub fn insert_without_merging(&mut self, range: AddrRange, value: V) {
        assert!(!range.is_empty(), "inserting empty segment");
        if let Some((existing, _)) = self.conflicts(range).next() {
            panic!("segment {range:?} overlaps {existing:?}");
        }
        self.map.insert(range.start(), Entry { end: range.end(), value });
    }

    /// Insert a segment and merge it with its neighbours. Returns the range of
    /// the resulting segment.
    pub fn insert(&mut self, range: AddrRange, value: V) -> AddrRange {
        self.insert_without_merging(range, value);
        let start = self.merge_at(range.start()).unwrap_or(range.start());
        self.merge_at(range.end());
        let end = self.map[&start].end;
        AddrRange::new(start, end)
    }

    /// Merge the segment ending at `at` with the one starting there, if they
    /// allow it. Returns the start of the merged segment.
    fn merge_at(&mut self, at: VirtualAddress) -> Option<VirtualAddress> {
        let (&prev_start, prev) = self.map.range(..at).next_back()?;
        if prev.end != at {
            return None;
        }
        let next = self.map.get(&at)?;
        let prev_range = AddrRange::new(prev_start, at);
        let next_range = AddrRange::new(at, next.end);

        let next = self.map.remove(&at)?;
        let prev = self.map.get_mut(&prev_start)?;
        if prev.value.try_merge(prev_range, &next.value, next_range) {
            prev.end = next.end;
            Some(prev_start)
        } else {
            self.map.insert(at, next);
            None
        }
    }

    /// Merge whatever can be merged between the segments overlapping or
    /// adjacent to `requested`.
    pub fn merge_range(&mut self, requested: AddrRange) {
        let mut boundaries: Vec<VirtualAddress> = self
            .conflicts(requested)
            .map(|(range, _)| range.start())
            .collect();
        boundaries.push(requested.end());
        // Later boundaries first, so earlier keys stay valid.
        for at in boundaries.into_iter().rev() {
            self.merge_at(at);
        }
    }

    /// Remove everything in `requested`, splitting segments at its bounds.
    pub fn remove(&mut self, requested: AddrRange) -> Vec<(AddrRange, V)> {
        self.isolate(requested);
        let starts: Vec<VirtualAddress> = self.conflicts(requested).map(|(range, _)| range.start()).collect();
        starts
            .into_iter()
            .filter_map(|start| {
                let entry = self.map.remove(&start)?;
                Some((AddrRange::new(start, entry.end), entry.value))
            })
            .collect()
    }

    /// Remove every segment.
    pub fn take_all(&mut self) -> Vec<(AddrRange, V)> {
        core::mem::take(&mut self.map)
            .into_iter()
            .map(|(start, entry)| (AddrRange::new(start, entry.end), entry.value))
            .collect()
    }

    /// The bounds of the first and last segment.
    pub fn span(&self) -> Option<AddrRange> {
        let (first, _) = self.map.iter().next()?;
        let (_, last) = self.map.iter().next_back()?;
        Some(AddrRange::new(*first, last.end))
    }

    /// Panics unless segments are non-empty, page aligned and disjoint.
    pub fn check_invariants(&self) {
        let mut prev_end = VirtualAddress::new(0);
        for (range, _) in self.iter() {
            assert!(!range.is_empty(), "empty segment at {:?}", range.start());
            assert!(range.is_page_aligned(), "unaligned segment {range:?}");
            assert!(prev_end <= range.start(), "segment {range:?} overlaps its predecessor");
            prev_end = range.end();
        }
    }
}
