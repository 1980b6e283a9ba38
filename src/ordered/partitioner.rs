//! # Ordered Range Partitioner
//!
//! Maps a partition key to a partition index through an interval tree over
//! the range bounds. Bounds are maintained under a strict invariant, checked
//! on every construction: sorted, pairwise non-overlapping, weakly adjacent
//! (each bound's end equals the next bound's start with exactly one side
//! inclusive), and never definitely empty.
//!
//! Keys outside the overall range clamp to the first or last partition. A
//! full key whose partition key is a prefix is honored by projecting the
//! prefix fields.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::interval::{Interval, IntervalTree};
use crate::vtype::{compare, Annotation, Type};

pub struct OrderedPartitioner {
    pk_type: Type,
    range_bounds: Vec<Interval>,
    tree: IntervalTree,
}

impl std::fmt::Debug for OrderedPartitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPartitioner")
            .field("pk_type", &self.pk_type)
            .field("range_bounds", &self.range_bounds)
            .finish()
    }
}

impl OrderedPartitioner {
    /// Builds a partitioner over a struct-typed partition key, validating
    /// the bound invariants.
    pub fn new(pk_type: Type, range_bounds: Vec<Interval>) -> Result<Self> {
        check_bounds(&pk_type, &range_bounds)?;
        let tree = IntervalTree::from_sorted(
            pk_type.clone(),
            range_bounds
                .iter()
                .enumerate()
                .map(|(i, iv)| (iv.clone(), i))
                .collect(),
        );
        Ok(Self {
            pk_type,
            range_bounds,
            tree,
        })
    }

    pub fn empty(pk_type: Type) -> Self {
        Self {
            tree: IntervalTree::from_sorted(pk_type.clone(), Vec::new()),
            pk_type,
            range_bounds: Vec::new(),
        }
    }

    pub fn pk_type(&self) -> &Type {
        &self.pk_type
    }

    pub fn num_partitions(&self) -> usize {
        self.range_bounds.len()
    }

    pub fn range_bounds(&self) -> &[Interval] {
        &self.range_bounds
    }

    /// The spanning interval, `None` when there are no partitions.
    pub fn range(&self) -> Option<Interval> {
        let first = self.range_bounds.first()?;
        let last = self.range_bounds.last()?;
        Some(Interval::new(
            first.start.clone(),
            last.end.clone(),
            first.includes_start,
            last.includes_end,
        ))
    }

    /// Projects the partition-key prefix out of a (possibly longer) key
    /// struct annotation.
    fn project_pk(&self, key: &Annotation) -> Result<Annotation> {
        let n_pk = self
            .pk_type
            .as_struct()
            .map(|s| s.n_fields())
            .unwrap_or(1);
        match key {
            Annotation::Struct(fields) if fields.len() > n_pk => {
                Ok(Annotation::Struct(fields[..n_pk].to_vec()))
            }
            other => Ok(other.clone()),
        }
    }

    /// The partition owning `key`. Out-of-range keys clamp to the first or
    /// last partition.
    pub fn partition_for_key(&self, key: &Annotation) -> Result<usize> {
        ensure!(
            !self.range_bounds.is_empty(),
            "partition lookup on an empty partitioner"
        );
        let pk = self.project_pk(key)?;
        if let Some(i) = self.tree.containing(&pk) {
            return Ok(i);
        }
        let first = &self.range_bounds[0];
        let below = match compare(&self.pk_type, &pk, &first.start, true) {
            Ordering::Less => true,
            Ordering::Equal => !first.includes_start,
            Ordering::Greater => false,
        };
        if below {
            Ok(0)
        } else {
            Ok(self.range_bounds.len() - 1)
        }
    }

    /// Indices of all partitions whose bounds may overlap `query`, sorted.
    pub fn partition_range(&self, query: &Interval) -> Vec<usize> {
        self.tree.overlapping(query)
    }

    /// Extends the first and last bounds (with inclusive endpoints) so the
    /// overall range covers `new_range`. The new range's point type must
    /// equal the current partition-key type; changing key types during an
    /// enlargement is unsupported.
    pub fn enlarge_to_range(&self, new_range: &Interval, point_type: &Type) -> Result<Self> {
        if point_type.kind != self.pk_type.kind {
            bail!(
                "cannot enlarge a partitioner keyed by {} to a range over {}",
                self.pk_type,
                point_type
            );
        }
        ensure!(
            !self.range_bounds.is_empty(),
            "cannot enlarge an empty partitioner"
        );
        let mut bounds = self.range_bounds.clone();
        let first = &mut bounds[0];
        match compare(&self.pk_type, &new_range.start, &first.start, true) {
            Ordering::Less => {
                first.start = new_range.start.clone();
                first.includes_start = true;
            }
            Ordering::Equal => first.includes_start |= new_range.includes_start,
            Ordering::Greater => {}
        }
        let n = bounds.len();
        let last = &mut bounds[n - 1];
        match compare(&self.pk_type, &new_range.end, &last.end, true) {
            Ordering::Greater => {
                last.end = new_range.end.clone();
                last.includes_end = true;
            }
            Ordering::Equal => last.includes_end |= new_range.includes_end,
            Ordering::Less => {}
        }
        Self::new(self.pk_type.clone(), bounds)
    }

    /// Merges contiguous partitions into groups ending at the given final
    /// indices. `new_part_end` must be strictly increasing and end at the
    /// last partition.
    pub fn coalesce_range_bounds(&self, new_part_end: &[usize]) -> Result<Self> {
        ensure!(!new_part_end.is_empty(), "coalesce with no group ends");
        ensure!(
            *new_part_end.last().expect("non-empty") == self.range_bounds.len() - 1,
            "coalesce group ends must cover all {} partitions",
            self.range_bounds.len()
        );
        let mut bounds = Vec::with_capacity(new_part_end.len());
        let mut prev_end: Option<usize> = None;
        for &end in new_part_end {
            let start = prev_end.map_or(0, |p| p + 1);
            ensure!(
                start <= end && end < self.range_bounds.len(),
                "coalesce group ends must be strictly increasing, got {:?}",
                new_part_end
            );
            let lo = &self.range_bounds[start];
            let hi = &self.range_bounds[end];
            bounds.push(Interval::new(
                lo.start.clone(),
                hi.end.clone(),
                lo.includes_start,
                hi.includes_end,
            ));
            prev_end = Some(end);
        }
        Self::new(self.pk_type.clone(), bounds)
    }

    /// Keeps the selected partitions. Each kept bound's end stretches to the
    /// next kept bound's start so the bounds stay adjacent; dropped ranges
    /// hold no rows, so assignment is unaffected.
    pub fn subset(&self, keep: &[usize]) -> Result<Self> {
        ensure!(!keep.is_empty(), "subset with no partitions kept");
        ensure!(
            keep.windows(2).all(|w| w[0] < w[1]),
            "subset indices must be strictly increasing, got {:?}",
            keep
        );
        ensure!(
            *keep.last().expect("non-empty") < self.range_bounds.len(),
            "subset index {} out of range for {} partitions",
            keep.last().expect("non-empty"),
            self.range_bounds.len()
        );
        let mut bounds: Vec<Interval> = Vec::with_capacity(keep.len());
        for (i, &k) in keep.iter().enumerate() {
            let mut b = self.range_bounds[k].clone();
            if let Some(&next) = keep.get(i + 1) {
                if next != k + 1 {
                    let next_b = &self.range_bounds[next];
                    b.end = next_b.start.clone();
                    b.includes_end = !next_b.includes_start;
                }
            }
            bounds.push(b);
        }
        Self::new(self.pk_type.clone(), bounds)
    }

    /// A prefix of the bounds, used by `head` when tail partitions drop.
    pub fn truncate(&self, n_parts: usize) -> Result<Self> {
        ensure!(
            n_parts <= self.range_bounds.len(),
            "cannot truncate {} partitions to {}",
            self.range_bounds.len(),
            n_parts
        );
        if n_parts == 0 {
            return Ok(Self::empty(self.pk_type.clone()));
        }
        Self::new(
            self.pk_type.clone(),
            self.range_bounds[..n_parts].to_vec(),
        )
    }

    pub fn copy(&self) -> Self {
        Self {
            pk_type: self.pk_type.clone(),
            range_bounds: self.range_bounds.clone(),
            tree: IntervalTree::from_sorted(
                self.pk_type.clone(),
                self.range_bounds
                    .iter()
                    .enumerate()
                    .map(|(i, iv)| (iv.clone(), i))
                    .collect(),
            ),
        }
    }

    /// Partitions overlapping any of the query intervals, sorted and
    /// deduplicated.
    pub fn partitions_overlapping(&self, queries: &[Interval]) -> Vec<usize> {
        let mut keep: SmallVec<[usize; 16]> = SmallVec::new();
        for q in queries {
            keep.extend(self.partition_range(q));
        }
        keep.sort_unstable();
        keep.dedup();
        keep.into_vec()
    }
}

fn check_bounds(pk_type: &Type, bounds: &[Interval]) -> Result<()> {
    for (i, b) in bounds.iter().enumerate() {
        ensure!(
            compare(pk_type, &b.start, &b.end, true) != Ordering::Greater,
            "range bound {} has start above end",
            i
        );
        ensure!(
            !b.definitely_empty(pk_type),
            "range bound {} is definitely empty",
            i
        );
    }
    for (i, w) in bounds.windows(2).enumerate() {
        let (a, b) = (&w[0], &w[1]);
        ensure!(
            compare(pk_type, &a.end, &b.start, true) == Ordering::Equal,
            "range bounds {} and {} are not adjacent",
            i,
            i + 1
        );
        ensure!(
            a.includes_end != b.includes_start,
            "range bounds {} and {} must include their shared endpoint exactly once",
            i,
            i + 1
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtype::Field;

    fn pk_type() -> Type {
        Type::struct_(vec![Field::new("k", Type::int32().required())]).required()
    }

    fn pk(v: i32) -> Annotation {
        Annotation::Struct(vec![Annotation::Int32(v)])
    }

    fn bounds(cuts: &[i32]) -> Vec<Interval> {
        // cuts [a, b, c, d] -> [a,b), [b,c), [c,d]
        let mut out = Vec::new();
        for i in 0..cuts.len() - 1 {
            let last = i == cuts.len() - 2;
            out.push(Interval::new(pk(cuts[i]), pk(cuts[i + 1]), true, last));
        }
        out
    }

    fn partitioner(cuts: &[i32]) -> OrderedPartitioner {
        OrderedPartitioner::new(pk_type(), bounds(cuts)).unwrap()
    }

    #[test]
    fn keys_land_in_their_bound_and_clamp_outside() {
        let p = partitioner(&[0, 10, 20, 30]);
        assert_eq!(p.partition_for_key(&pk(0)).unwrap(), 0);
        assert_eq!(p.partition_for_key(&pk(10)).unwrap(), 1);
        assert_eq!(p.partition_for_key(&pk(29)).unwrap(), 2);
        assert_eq!(p.partition_for_key(&pk(30)).unwrap(), 2);
        assert_eq!(p.partition_for_key(&pk(-5)).unwrap(), 0);
        assert_eq!(p.partition_for_key(&pk(99)).unwrap(), 2);
    }

    #[test]
    fn full_keys_project_their_pk_prefix() {
        let p = partitioner(&[0, 10, 20]);
        let full_key = Annotation::Struct(vec![Annotation::Int32(15), Annotation::str("suffix")]);
        assert_eq!(p.partition_for_key(&full_key).unwrap(), 1);
    }

    #[test]
    fn non_adjacent_bounds_are_rejected() {
        let bad = vec![
            Interval::new(pk(0), pk(10), true, false),
            Interval::new(pk(11), pk(20), true, true),
        ];
        assert!(OrderedPartitioner::new(pk_type(), bad).is_err());
    }

    #[test]
    fn doubly_inclusive_joint_is_rejected() {
        let bad = vec![
            Interval::new(pk(0), pk(10), true, true),
            Interval::new(pk(10), pk(20), true, true),
        ];
        assert!(OrderedPartitioner::new(pk_type(), bad).is_err());
    }

    #[test]
    fn enlarge_extends_outer_bounds_inclusively() {
        let p = partitioner(&[0, 10, 20]);
        let enlarged = p
            .enlarge_to_range(
                &Interval::new(pk(-100), pk(50), true, true),
                &pk_type(),
            )
            .unwrap();
        let r = enlarged.range().unwrap();
        assert_eq!(r.start, pk(-100));
        assert_eq!(r.end, pk(50));
        assert!(r.includes_start && r.includes_end);
        assert_eq!(enlarged.partition_for_key(&pk(-50)).unwrap(), 0);
    }

    #[test]
    fn enlarge_with_a_different_point_type_is_an_error() {
        let p = partitioner(&[0, 10]);
        let other = Type::struct_(vec![Field::new("k", Type::str().required())]);
        let err = p
            .enlarge_to_range(
                &Interval::new(
                    Annotation::Struct(vec![Annotation::str("a")]),
                    Annotation::Struct(vec![Annotation::str("z")]),
                    true,
                    true,
                ),
                &other,
            )
            .unwrap_err();
        assert!(err.to_string().contains("cannot enlarge"));
    }

    #[test]
    fn coalesce_merges_contiguous_groups() {
        let p = partitioner(&[0, 10, 20, 30, 40]);
        let c = p.coalesce_range_bounds(&[1, 3]).unwrap();
        assert_eq!(c.num_partitions(), 2);
        assert_eq!(c.partition_for_key(&pk(15)).unwrap(), 0);
        assert_eq!(c.partition_for_key(&pk(25)).unwrap(), 1);
        assert_eq!(c.range().unwrap().start, pk(0));
        assert_eq!(c.range().unwrap().end, pk(40));
    }

    #[test]
    fn subset_bridges_gaps_to_stay_adjacent() {
        let p = partitioner(&[0, 10, 20, 30, 40]);
        let s = p.subset(&[0, 2, 3]).unwrap();
        assert_eq!(s.num_partitions(), 3);
        // partition 1 was dropped; its range folds into the first kept bound
        assert_eq!(s.partition_for_key(&pk(5)).unwrap(), 0);
        assert_eq!(s.partition_for_key(&pk(25)).unwrap(), 1);
        assert_eq!(s.partition_for_key(&pk(35)).unwrap(), 2);
    }

    #[test]
    fn partition_range_reports_overlaps() {
        let p = partitioner(&[0, 10, 20, 30]);
        let q = Interval::new(pk(5), pk(15), true, true);
        assert_eq!(p.partition_range(&q), vec![0, 1]);
    }
}
