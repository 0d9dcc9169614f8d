//! Split ranges among the nodes a run knows about.

use ringsim_overlay::NodeHandle;
use ringsim_utils::{Interval, IntervalSet};
use std::collections::BTreeMap;

/// Assign every key of `ranges` to the closest candidate at or before it on the ring.
///
/// `candidates` must be sorted by key. The piece starting at the left edge of each
/// interval goes to the closest predecessor of that edge (wrapping around to the last
/// candidate when nobody precedes it). Returns each delegate with its ranges, in ring order.
pub fn assign(candidates: &[NodeHandle], ranges: &IntervalSet) -> BTreeMap<NodeHandle, Vec<Interval>> {
    let mut assignments: BTreeMap<NodeHandle, IntervalSet> = BTreeMap::new();
    if candidates.is_empty() {
        return BTreeMap::new();
    }
    for interval in ranges.iter() {
        let (lo, hi) = (interval.lo(), interval.hi());
        let first = candidates.partition_point(|candidate| candidate.key() <= lo);
        let mut current = match first {
            0 => candidates[candidates.len() - 1],
            n => candidates[n - 1],
        };
        let mut start = lo;
        for candidate in &candidates[first..] {
            if candidate.key() > hi {
                break;
            }
            if candidate.key() > start {
                if let Some(piece) = Interval::new(start, candidate.key() - 1) {
                    assignments.entry(current).or_default().insert(piece);
                }
                start = candidate.key();
            }
            current = *candidate;
        }
        if let Some(piece) = Interval::new(start, hi) {
            assignments.entry(current).or_default().insert(piece);
        }
    }
    assignments
        .into_iter()
        .map(|(delegate, ranges)| (delegate, ranges.into_vec()))
        .collect()
}
