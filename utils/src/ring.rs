//! Circular ordering predicates.
//!
//! Keys live on a ring: after the largest key comes the smallest one again. Every
//! containment check in the simulator (responsibility, routing-table filtering, query
//! splitting) is phrased through [is_ordered] or one of its derived forms.

/// Returns true if `x` lies on the clockwise arc that starts at `from` and ends at `to`.
///
/// `from_inclusive` and `to_inclusive` control whether the endpoints themselves belong to
/// the arc. When `from == to` the arc covers the whole ring, so every key other than the
/// endpoint is inside and the endpoint is inside if either flag is set.
pub fn is_ordered<K: Ord>(
    from: &K,
    from_inclusive: bool,
    x: &K,
    to: &K,
    to_inclusive: bool,
) -> bool {
    if x == from && x == to {
        return from_inclusive || to_inclusive;
    }
    if x == from {
        return from_inclusive;
    }
    if x == to {
        return to_inclusive;
    }
    match from.cmp(to) {
        std::cmp::Ordering::Less => from < x && x < to,
        std::cmp::Ordering::Greater => from < x || x < to,
        std::cmp::Ordering::Equal => true,
    }
}

/// `x` in `(from, to)`.
pub fn is_ordered_open<K: Ord>(from: &K, x: &K, to: &K) -> bool {
    is_ordered(from, false, x, to, false)
}

/// `x` in `[from, to)`.
pub fn is_ordered_left<K: Ord>(from: &K, x: &K, to: &K) -> bool {
    is_ordered(from, true, x, to, false)
}

/// `x` in `(from, to]`.
pub fn is_ordered_right<K: Ord>(from: &K, x: &K, to: &K) -> bool {
    is_ordered(from, false, x, to, true)
}
