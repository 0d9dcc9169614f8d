//! Closed intervals of ring keys and sets of them.
//!
//! Query ranges may wrap around the origin of the ring. Before any arithmetic is done
//! they are broken into [Interval]s that never cross the wrap point (see [Interval::arc]),
//! so everything below can reason about plain `lo <= hi` spans.

use std::fmt;

/// A closed span `[lo, hi]` of keys that does not wrap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    lo: u64,
    hi: u64,
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Interval {
    /// Create `[lo, hi]`, returning `None` if the span would be empty.
    pub fn new(lo: u64, hi: u64) -> Option<Self> {
        (lo <= hi).then_some(Self { lo, hi })
    }

    /// The interval containing every key.
    pub const fn full() -> Self {
        Self {
            lo: 0,
            hi: u64::MAX,
        }
    }

    /// An interval holding a single key.
    pub const fn point(key: u64) -> Self {
        Self { lo: key, hi: key }
    }

    /// Create the half-open span `[lo, hi)`, returning `None` if it is empty.
    pub fn half_open(lo: u64, hi: u64) -> Option<Self> {
        Self::new(lo, hi.checked_sub(1)?)
    }

    pub const fn lo(&self) -> u64 {
        self.lo
    }

    pub const fn hi(&self) -> u64 {
        self.hi
    }

    /// Number of keys covered.
    pub const fn width(&self) -> u128 {
        (self.hi - self.lo) as u128 + 1
    }

    pub const fn contains(&self, key: u64) -> bool {
        self.lo <= key && key <= self.hi
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        Self::new(self.lo.max(other.lo), self.hi.min(other.hi))
    }

    /// Break the clockwise arc from `from` to `to` into intervals that do not wrap.
    ///
    /// The arc follows the same rules as [crate::is_ordered]: when `from == to` it spans
    /// the whole ring and the shared endpoint is included if either flag is set.
    pub fn arc(from: u64, from_inclusive: bool, to: u64, to_inclusive: bool) -> Vec<Interval> {
        let start = if from_inclusive {
            Some(from)
        } else {
            from.checked_add(1)
        };
        let end = if to_inclusive {
            Some(to)
        } else {
            to.checked_sub(1)
        };
        match from.cmp(&to) {
            std::cmp::Ordering::Less => match (start, end) {
                (Some(start), Some(end)) => Self::new(start, end).into_iter().collect(),
                _ => Vec::new(),
            },
            std::cmp::Ordering::Equal if from_inclusive || to_inclusive => vec![Self::full()],
            std::cmp::Ordering::Equal | std::cmp::Ordering::Greater => {
                // Lower piece restarts at 0, upper piece runs to the top of the key space.
                let mut pieces = Vec::with_capacity(2);
                if let Some(end) = end {
                    pieces.push(Self { lo: 0, hi: end });
                }
                if let Some(start) = start {
                    pieces.push(Self {
                        lo: start,
                        hi: u64::MAX,
                    });
                }
                if pieces.len() == 2 && pieces[0].hi.checked_add(1) == Some(pieces[1].lo) {
                    return vec![Self::full()];
                }
                pieces
            }
        }
    }
}

/// A sorted set of disjoint, non-adjacent [Interval]s.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct IntervalSet(Vec<Interval>);

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        let mut set = Self::new();
        for interval in iter {
            set.insert(interval);
        }
        set
    }
}

impl IntervalSet {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of disjoint intervals held.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&Interval> {
        self.0.first()
    }

    pub fn into_vec(self) -> Vec<Interval> {
        self.0
    }

    /// Total number of keys covered.
    pub fn width(&self) -> u128 {
        self.0.iter().map(Interval::width).sum()
    }

    pub fn contains(&self, key: u64) -> bool {
        let idx = self.0.partition_point(|i| i.hi < key);
        self.0.get(idx).is_some_and(|i| i.contains(key))
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        let idx = self.0.partition_point(|i| i.hi < other.lo);
        self.0.get(idx).is_some_and(|i| i.overlaps(other))
    }

    /// Add `interval`, merging with anything it overlaps or touches.
    pub fn insert(&mut self, interval: Interval) {
        let mut merged = interval;
        // First interval that could touch `interval` (its end is at least lo - 1).
        let start = self
            .0
            .partition_point(|i| i.hi.saturating_add(1) < merged.lo);
        let mut end = start;
        while end < self.0.len() && self.0[end].lo <= merged.hi.saturating_add(1) {
            merged.lo = merged.lo.min(self.0[end].lo);
            merged.hi = merged.hi.max(self.0[end].hi);
            end += 1;
        }
        self.0.splice(start..end, std::iter::once(merged));
    }

    /// Remove every key of `interval`, returning true if anything was removed.
    pub fn subtract(&mut self, interval: &Interval) -> bool {
        let start = self.0.partition_point(|i| i.hi < interval.lo);
        let mut end = start;
        while end < self.0.len() && self.0[end].lo <= interval.hi {
            end += 1;
        }
        if start == end {
            return false;
        }
        let mut remainder = Vec::with_capacity(2);
        let first = self.0[start];
        let last = self.0[end - 1];
        if first.lo < interval.lo {
            remainder.push(Interval {
                lo: first.lo,
                hi: interval.lo - 1,
            });
        }
        if last.hi > interval.hi {
            remainder.push(Interval {
                lo: interval.hi + 1,
                hi: last.hi,
            });
        }
        self.0.splice(start..end, remainder);
        true
    }

    /// Keys of `self` that fall within `interval`.
    pub fn intersection(&self, interval: &Interval) -> IntervalSet {
        Self(
            self.0
                .iter()
                .filter_map(|i| i.intersect(interval))
                .collect(),
        )
    }

    /// Keys of `self` that fall within `other`.
    pub fn intersection_set(&self, other: &IntervalSet) -> IntervalSet {
        other
            .iter()
            .flat_map(|i| self.intersection(i).into_vec())
            .collect()
    }
}
