//! # Intervals with Endpoint Inclusivity
//!
//! An [`Interval`] is a pair of endpoint annotations over some point type,
//! each endpoint independently inclusive or exclusive. Intervals back
//! partition range bounds and interval-filter queries; the augmented search
//! tree lives in [`tree`].
//!
//! All comparisons are parameterized by the point type and sort missing
//! greatest, matching key order in the ordered dataset layer.

pub mod tree;

pub use tree::IntervalTree;

use std::cmp::Ordering;

use crate::vtype::{compare, Annotation, Type};

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub start: Annotation,
    pub end: Annotation,
    pub includes_start: bool,
    pub includes_end: bool,
}

impl Interval {
    pub fn new(start: Annotation, end: Annotation, includes_start: bool, includes_end: bool) -> Self {
        Self {
            start,
            end,
            includes_start,
            includes_end,
        }
    }

    /// Empty regardless of the point type's density: a single excluded point.
    pub fn definitely_empty(&self, point_type: &Type) -> bool {
        compare(point_type, &self.start, &self.end, true) == Ordering::Equal
            && !(self.includes_start && self.includes_end)
    }

    pub fn contains(&self, point_type: &Type, p: &Annotation) -> bool {
        let s = compare(point_type, &self.start, p, true);
        let above_start = s == Ordering::Less || (s == Ordering::Equal && self.includes_start);
        if !above_start {
            return false;
        }
        let e = compare(point_type, p, &self.end, true);
        e == Ordering::Less || (e == Ordering::Equal && self.includes_end)
    }

    /// True when every point of `self` precedes every point of `other`.
    pub fn is_below(&self, point_type: &Type, other: &Interval) -> bool {
        ends_before(
            point_type,
            &self.end,
            self.includes_end,
            &other.start,
            other.includes_start,
        )
    }

    pub fn is_above(&self, point_type: &Type, other: &Interval) -> bool {
        other.is_below(point_type, self)
    }

    /// True when the intersection may be non-empty.
    pub fn may_overlap(&self, point_type: &Type, other: &Interval) -> bool {
        !self.is_below(point_type, other) && !self.is_above(point_type, other)
    }

    pub fn ordering(&self, point_type: &Type, other: &Interval) -> Ordering {
        compare(point_type, &self.start, &other.start, true)
            .then_with(|| (!self.includes_start).cmp(&!other.includes_start))
            .then_with(|| compare(point_type, &self.end, &other.end, true))
            .then_with(|| self.includes_end.cmp(&other.includes_end))
    }
}

/// True when an endpoint (end, includes_end) lies strictly before
/// (start, includes_start): no point can satisfy both.
pub(crate) fn ends_before(
    point_type: &Type,
    end: &Annotation,
    includes_end: bool,
    start: &Annotation,
    includes_start: bool,
) -> bool {
    match compare(point_type, end, start, true) {
        Ordering::Less => true,
        Ordering::Equal => !(includes_end && includes_start),
        Ordering::Greater => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(s: i32, e: i32, is: bool, ie: bool) -> Interval {
        Interval::new(Annotation::Int32(s), Annotation::Int32(e), is, ie)
    }

    #[test]
    fn emptiness_requires_equal_endpoints_and_an_exclusion() {
        let t = Type::int32().required();
        assert!(iv(5, 5, true, false).definitely_empty(&t));
        assert!(iv(5, 5, false, false).definitely_empty(&t));
        assert!(!iv(5, 5, true, true).definitely_empty(&t));
        assert!(!iv(5, 6, false, false).definitely_empty(&t));
    }

    #[test]
    fn contains_honors_inclusivity() {
        let t = Type::int32().required();
        let half_open = iv(0, 10, true, false);
        assert!(half_open.contains(&t, &Annotation::Int32(0)));
        assert!(half_open.contains(&t, &Annotation::Int32(9)));
        assert!(!half_open.contains(&t, &Annotation::Int32(10)));
        assert!(!half_open.contains(&t, &Annotation::Int32(-1)));
    }

    #[test]
    fn adjacent_intervals_overlap_only_when_both_include_the_joint() {
        let t = Type::int32().required();
        assert!(!iv(0, 5, true, false).may_overlap(&t, &iv(5, 10, true, false)));
        assert!(iv(0, 5, true, true).may_overlap(&t, &iv(5, 10, true, false)));
        assert!(!iv(0, 5, true, true).may_overlap(&t, &iv(5, 10, false, true)));
        assert!(iv(0, 6, true, false).may_overlap(&t, &iv(5, 10, true, false)));
    }
}
