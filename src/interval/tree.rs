//! Augmented interval search tree.
//!
//! Balanced by construction: built median-split from inputs sorted by
//! interval start, in linear time. Each node carries the maximum (end,
//! inclusivity) endpoint of its subtree, which prunes containment and
//! overlap queries to O(log n + hits). In-order traversal respects start
//! order, so query results come back sorted by interval.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::interval::{ends_before, Interval};
use crate::vtype::{compare, Annotation, Type};

struct Node {
    interval: Interval,
    value: usize,
    max_end: Annotation,
    max_end_includes: bool,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

pub struct IntervalTree {
    point_type: Type,
    root: Option<Box<Node>>,
    len: usize,
}

impl IntervalTree {
    /// Builds from intervals already sorted by `Interval::ordering`.
    pub fn from_sorted(point_type: Type, intervals: Vec<(Interval, usize)>) -> Self {
        let len = intervals.len();
        let root = build(&point_type, intervals);
        Self {
            point_type,
            root,
            len,
        }
    }

    pub fn from_unsorted(point_type: Type, mut intervals: Vec<(Interval, usize)>) -> Self {
        intervals.sort_by(|(a, _), (b, _)| a.ordering(&point_type, b));
        Self::from_sorted(point_type, intervals)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The value of an interval containing `p`, if any. With pairwise
    /// non-overlapping inputs the containing interval is unique.
    pub fn containing(&self, p: &Annotation) -> Option<usize> {
        let mut result = None;
        // walk all candidate paths; pruning keeps this logarithmic for
        // non-overlapping inputs
        let mut stack: SmallVec<[&Node; 16]> = SmallVec::new();
        if let Some(n) = self.root.as_deref() {
            stack.push(n);
        }
        while let Some(n) = stack.pop() {
            // subtree ends before p: nothing here contains it
            if point_after_end(&self.point_type, p, &n.max_end, n.max_end_includes) {
                continue;
            }
            if n.interval.contains(&self.point_type, p) {
                result = Some(n.value);
                break;
            }
            if let Some(l) = n.left.as_deref() {
                stack.push(l);
            }
            // right subtree starts at or after this node's start; skip it
            // once p precedes that start
            let s = compare(&self.point_type, p, &n.interval.start, true);
            let before_start =
                s == Ordering::Less || (s == Ordering::Equal && !n.interval.includes_start);
            if !before_start {
                if let Some(r) = n.right.as_deref() {
                    stack.push(r);
                }
            }
        }
        result
    }

    pub fn contains_point(&self, p: &Annotation) -> bool {
        self.containing(p).is_some()
    }

    /// Values of all intervals that may overlap `query`, sorted by interval.
    pub fn overlapping(&self, query: &Interval) -> Vec<usize> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            overlap_visit(&self.point_type, root, query, &mut out);
        }
        out
    }

    /// All intervals in order.
    pub fn intervals(&self) -> Vec<Interval> {
        fn visit(node: Option<&Node>, out: &mut Vec<Interval>) {
            if let Some(n) = node {
                visit(n.left.as_deref(), out);
                out.push(n.interval.clone());
                visit(n.right.as_deref(), out);
            }
        }
        let mut out = Vec::with_capacity(self.len);
        visit(self.root.as_deref(), &mut out);
        out
    }
}

fn build(point_type: &Type, mut intervals: Vec<(Interval, usize)>) -> Option<Box<Node>> {
    if intervals.is_empty() {
        return None;
    }
    let mid = intervals.len() / 2;
    let right_part = intervals.split_off(mid + 1);
    let (interval, value) = intervals.pop().expect("non-empty split");
    let left = build(point_type, intervals);
    let right = build(point_type, right_part);

    let (mut max_end, mut max_end_includes) = (interval.end.clone(), interval.includes_end);
    for child in [left.as_deref(), right.as_deref()].into_iter().flatten() {
        if end_greater(
            point_type,
            &child.max_end,
            child.max_end_includes,
            &max_end,
            max_end_includes,
        ) {
            max_end = child.max_end.clone();
            max_end_includes = child.max_end_includes;
        }
    }

    Some(Box::new(Node {
        interval,
        value,
        max_end,
        max_end_includes,
        left,
        right,
    }))
}

fn end_greater(
    point_type: &Type,
    e1: &Annotation,
    i1: bool,
    e2: &Annotation,
    i2: bool,
) -> bool {
    match compare(point_type, e1, e2, true) {
        Ordering::Greater => true,
        Ordering::Equal => i1 && !i2,
        Ordering::Less => false,
    }
}

fn point_after_end(point_type: &Type, p: &Annotation, end: &Annotation, includes: bool) -> bool {
    match compare(point_type, p, end, true) {
        Ordering::Greater => true,
        Ordering::Equal => !includes,
        Ordering::Less => false,
    }
}

fn overlap_visit(point_type: &Type, node: &Node, query: &Interval, out: &mut Vec<usize>) {
    // the whole subtree ends before the query starts
    if ends_before(
        point_type,
        &node.max_end,
        node.max_end_includes,
        &query.start,
        query.includes_start,
    ) {
        return;
    }
    if let Some(l) = node.left.as_deref() {
        overlap_visit(point_type, l, query, out);
    }
    if node.interval.may_overlap(point_type, query) {
        out.push(node.value);
    }
    // right subtree starts no earlier than this node; stop once the query
    // ends before this node starts
    let query_below = ends_before(
        point_type,
        &query.end,
        query.includes_end,
        &node.interval.start,
        node.interval.includes_start,
    );
    if !query_below {
        if let Some(r) = node.right.as_deref() {
            overlap_visit(point_type, r, query, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(s: i32, e: i32) -> Interval {
        // partition-bound style: start inclusive, end exclusive
        Interval::new(Annotation::Int32(s), Annotation::Int32(e), true, false)
    }

    fn tree(bounds: &[(i32, i32)]) -> IntervalTree {
        IntervalTree::from_sorted(
            Type::int32().required(),
            bounds
                .iter()
                .enumerate()
                .map(|(i, &(s, e))| (iv(s, e), i))
                .collect(),
        )
    }

    #[test]
    fn containing_finds_the_unique_bound() {
        let t = tree(&[(0, 10), (10, 20), (20, 30), (30, 40)]);
        assert_eq!(t.containing(&Annotation::Int32(0)), Some(0));
        assert_eq!(t.containing(&Annotation::Int32(10)), Some(1));
        assert_eq!(t.containing(&Annotation::Int32(29)), Some(2));
        assert_eq!(t.containing(&Annotation::Int32(40)), None);
        assert_eq!(t.containing(&Annotation::Int32(-1)), None);
    }

    #[test]
    fn overlapping_returns_sorted_partition_indices() {
        let t = tree(&[(0, 10), (10, 20), (20, 30), (30, 40)]);
        let q = Interval::new(Annotation::Int32(5), Annotation::Int32(25), true, true);
        assert_eq!(t.overlapping(&q), vec![0, 1, 2]);

        let q2 = Interval::new(Annotation::Int32(10), Annotation::Int32(10), true, true);
        assert_eq!(t.overlapping(&q2), vec![1]);

        let q3 = Interval::new(Annotation::Int32(100), Annotation::Int32(200), true, true);
        assert!(t.overlapping(&q3).is_empty());
    }

    #[test]
    fn empty_tree_answers_nothing() {
        let t = tree(&[]);
        assert!(t.is_empty());
        assert_eq!(t.containing(&Annotation::Int32(1)), None);
    }
}
