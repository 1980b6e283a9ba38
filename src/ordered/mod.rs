//! # Ordered Distributed Dataset
//!
//! An [`OrderedDataset`] is the triple of a keyed row type, an
//! [`OrderedPartitioner`], and a partitioned stream of region rows. Two
//! invariants hold everywhere: within each partition rows are non-decreasing
//! by the full key, and each row's partition key lies inside its partition's
//! range bound.
//!
//! Operations either preserve the partitioner (map, filter, zip, group,
//! distinct, union), recompute bounds deterministically (head, coalesce,
//! subset), or realign streams against a new partitioner (constrain, joins,
//! shuffle). Sortedness-aware construction from unordered input lives in
//! [`coerce`].
//!
//! The partitioner is broadcast lazily on first use; in the local runtime a
//! broadcast is a shared handle.

pub mod coerce;
pub mod cursors;
pub mod join;
pub mod partitioner;

pub use coerce::coerce;
pub use join::JoinKind;
pub use partitioner::OrderedPartitioner;

use std::rc::Rc;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::RwLock;

use crate::backend::{Backend, ConcatCursor, CursorFactory, PartStream, RowCursor, TakeCursor};
use crate::interval::IntervalTree;
use crate::ir::CompiledRoutine;
use crate::ordered::cursors::{
    BoundFilterCursor, DistinctByKeyCursor, FilterCursor, GroupByKeyCursor,
    IntervalMembershipCursor, MapRowsCursor, MergeCursor, SampleCursor, VerifyCursor,
};
use crate::region::{view, Region};
use crate::vtype::{compare_regions, Annotation, Field, Kind, StructType, Type};

/// Row type plus sort-key structure: `key` names the sort-key fields in
/// order, of which the first `n_partition_key` form the partition key.
#[derive(Debug, Clone)]
pub struct OrderedKeyedType {
    row_type: Type,
    row_fund: Type,
    key: Vec<String>,
    n_partition_key: usize,
    key_indices: Vec<usize>,
    key_typ: Type,
    pk_typ: Type,
}

impl OrderedKeyedType {
    pub fn new(row_type: Type, key: Vec<String>, n_partition_key: usize) -> Result<Self> {
        let s = match row_type.as_struct() {
            Some(s) => s,
            None => bail!("ordered dataset rows must be structs, got {}", row_type),
        };
        ensure!(
            n_partition_key >= 1 && n_partition_key <= key.len(),
            "partition key must be a non-empty prefix of the key ({} of {})",
            n_partition_key,
            key.len()
        );
        let mut key_indices = Vec::with_capacity(key.len());
        for k in &key {
            match s.field_index(k) {
                Some(i) => key_indices.push(i),
                None => bail!("key field `{}` not found in row type {}", k, row_type),
            }
        }
        let key_typ = Type::struct_(
            key_indices.iter().map(|&i| s.field(i).clone()).collect(),
        )
        .required();
        let pk_typ = Type::struct_(
            key_indices[..n_partition_key]
                .iter()
                .map(|&i| s.field(i).clone())
                .collect(),
        )
        .required();
        let row_fund = row_type.fundamental();
        Ok(Self {
            row_type,
            row_fund,
            key,
            n_partition_key,
            key_indices,
            key_typ,
            pk_typ,
        })
    }

    pub fn row_type(&self) -> &Type {
        &self.row_type
    }

    pub(crate) fn row_fund(&self) -> &Type {
        &self.row_fund
    }

    pub(crate) fn row_struct(&self) -> &StructType {
        self.row_type.as_struct().expect("row struct")
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn n_partition_key(&self) -> usize {
        self.n_partition_key
    }

    pub fn key_indices(&self) -> &[usize] {
        &self.key_indices
    }

    pub fn pk_indices(&self) -> &[usize] {
        &self.key_indices[..self.n_partition_key]
    }

    pub fn value_indices(&self) -> Vec<usize> {
        let s = self.row_struct();
        (0..s.n_fields())
            .filter(|i| !self.key_indices.contains(i))
            .collect()
    }

    /// Struct of the key fields, in key order.
    pub fn key_type(&self) -> Type {
        self.key_typ.clone()
    }

    /// Struct of the partition-key prefix fields.
    pub fn pk_type(&self) -> Type {
        self.pk_typ.clone()
    }

    pub(crate) fn pk_type_ref(&self) -> &Type {
        &self.pk_typ
    }

    /// Materializes a row's partition key as a struct annotation.
    pub fn pk_of_row(&self, region: &Region, off: usize) -> Annotation {
        let s = self.row_struct();
        Annotation::Struct(
            self.pk_indices()
                .iter()
                .map(|&i| {
                    if view::is_field_defined(s, region, off, i) {
                        let foff = view::load_field(s, region, off, i);
                        view::read_annotation(s.field_type(i), region, foff)
                    } else {
                        Annotation::Missing
                    }
                })
                .collect(),
        )
    }

    fn compare_projected(
        &self,
        indices: &[usize],
        r1: &Region,
        o1: usize,
        r2: &Region,
        o2: usize,
    ) -> std::cmp::Ordering {
        let s = self.row_struct();
        for &i in indices {
            let d1 = view::is_field_defined(s, r1, o1, i);
            let d2 = view::is_field_defined(s, r2, o2, i);
            let c = match (d1, d2) {
                (false, false) => std::cmp::Ordering::Equal,
                (false, true) => std::cmp::Ordering::Greater,
                (true, false) => std::cmp::Ordering::Less,
                (true, true) => {
                    let f1 = view::load_field(s, r1, o1, i);
                    let f2 = view::load_field(s, r2, o2, i);
                    compare_regions(s.field_type(i), r1, f1, r2, f2, true)
                }
            };
            if c != std::cmp::Ordering::Equal {
                return c;
            }
        }
        std::cmp::Ordering::Equal
    }

    pub fn compare_rows_by_key(
        &self,
        r1: &Region,
        o1: usize,
        r2: &Region,
        o2: usize,
    ) -> std::cmp::Ordering {
        self.compare_projected(&self.key_indices, r1, o1, r2, o2)
    }

    pub fn compare_rows_by_pk(
        &self,
        r1: &Region,
        o1: usize,
        r2: &Region,
        o2: usize,
    ) -> std::cmp::Ordering {
        self.compare_projected(self.pk_indices(), r1, o1, r2, o2)
    }

    /// Compares a row's key against a materialized key-struct value.
    pub fn compare_row_with_key(
        &self,
        row_region: &Region,
        row_off: usize,
        key_region: &Region,
        key_off: usize,
    ) -> std::cmp::Ordering {
        self.compare_row_with_projected(
            &self.key_indices,
            &self.key_typ,
            row_region,
            row_off,
            key_region,
            key_off,
        )
    }

    /// Compares a row's partition key against a materialized pk-struct
    /// value.
    pub fn compare_row_with_pk(
        &self,
        row_region: &Region,
        row_off: usize,
        pk_region: &Region,
        pk_off: usize,
    ) -> std::cmp::Ordering {
        self.compare_row_with_projected(
            self.pk_indices(),
            &self.pk_typ,
            row_region,
            row_off,
            pk_region,
            pk_off,
        )
    }

    fn compare_row_with_projected(
        &self,
        indices: &[usize],
        proj_type: &Type,
        row_region: &Region,
        row_off: usize,
        proj_region: &Region,
        proj_off: usize,
    ) -> std::cmp::Ordering {
        let s = self.row_struct();
        let ps = proj_type.as_struct().expect("projection struct");
        for (pi, &i) in indices.iter().enumerate() {
            let d1 = view::is_field_defined(s, row_region, row_off, i);
            let d2 = view::is_field_defined(ps, proj_region, proj_off, pi);
            let c = match (d1, d2) {
                (false, false) => std::cmp::Ordering::Equal,
                (false, true) => std::cmp::Ordering::Greater,
                (true, false) => std::cmp::Ordering::Less,
                (true, true) => {
                    let f1 = view::load_field(s, row_region, row_off, i);
                    let f2 = view::load_field(ps, proj_region, proj_off, pi);
                    compare_regions(s.field_type(i), row_region, f1, proj_region, f2, true)
                }
            };
            if c != std::cmp::Ordering::Equal {
                return c;
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// A partition-iterator transform; receives the partition index and the
/// opened input cursor.
pub type PartitionMapFn = Rc<dyn Fn(usize, Box<dyn RowCursor>) -> Result<Box<dyn RowCursor>>>;

pub struct OrderedDataset {
    typ: OrderedKeyedType,
    partitioner: Arc<OrderedPartitioner>,
    backend: Rc<dyn Backend>,
    stream: PartStream,
    broadcast: RwLock<Option<Arc<OrderedPartitioner>>>,
}

impl std::fmt::Debug for OrderedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedDataset")
            .field("typ", &self.typ)
            .finish_non_exhaustive()
    }
}

impl OrderedDataset {
    pub fn new(
        typ: OrderedKeyedType,
        partitioner: Arc<OrderedPartitioner>,
        backend: Rc<dyn Backend>,
        stream: PartStream,
    ) -> Result<Self> {
        ensure!(
            partitioner.num_partitions() == stream.n_partitions(),
            "partitioner has {} bounds but stream has {} partitions",
            partitioner.num_partitions(),
            stream.n_partitions()
        );
        ensure!(
            partitioner.pk_type().kind == typ.pk_type().kind,
            "partitioner keyed by {} cannot govern rows keyed by {}",
            partitioner.pk_type(),
            typ.pk_type()
        );
        Ok(Self {
            typ,
            partitioner,
            backend,
            stream,
            broadcast: RwLock::new(None),
        })
    }

    fn derive(
        &self,
        typ: OrderedKeyedType,
        partitioner: Arc<OrderedPartitioner>,
        stream: PartStream,
    ) -> Result<Self> {
        Self::new(typ, partitioner, self.backend.clone(), stream)
    }

    pub fn typ(&self) -> &OrderedKeyedType {
        &self.typ
    }

    pub fn partitioner(&self) -> &Arc<OrderedPartitioner> {
        &self.partitioner
    }

    pub fn backend(&self) -> &Rc<dyn Backend> {
        &self.backend
    }

    pub fn stream(&self) -> &PartStream {
        &self.stream
    }

    pub fn n_partitions(&self) -> usize {
        self.stream.n_partitions()
    }

    /// The partitioner handle shared with tasks, initialized on first use.
    pub fn broadcast_partitioner(&self) -> Arc<OrderedPartitioner> {
        if let Some(p) = self.broadcast.read().as_ref() {
            return p.clone();
        }
        let mut slot = self.broadcast.write();
        if let Some(p) = slot.as_ref() {
            return p.clone();
        }
        let p = self.partitioner.clone();
        *slot = Some(p.clone());
        p
    }

    pub fn collect(&self) -> Result<Vec<Annotation>> {
        self.backend.collect(self.typ.row_type(), &self.stream)
    }

    pub fn partition_counts(&self) -> Result<Vec<usize>> {
        let mut counts = Vec::with_capacity(self.n_partitions());
        for factory in &self.stream.parts {
            let mut cursor = factory()?;
            let mut n = 0;
            while cursor.advance()? {
                n += 1;
            }
            counts.push(n);
        }
        Ok(counts)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.partition_counts()?.into_iter().sum())
    }

    /// Applies a partition transform trusted to preserve sort order and
    /// partition-key assignment. Debug builds re-verify both.
    pub fn map_partitions_preserving(
        &self,
        new_typ: OrderedKeyedType,
        f: PartitionMapFn,
    ) -> Result<Self> {
        self.map_partitions_with_index_preserving(new_typ, f)
    }

    pub fn map_partitions_with_index_preserving(
        &self,
        new_typ: OrderedKeyedType,
        f: PartitionMapFn,
    ) -> Result<Self> {
        ensure!(
            new_typ.pk_type().kind == self.typ.pk_type().kind,
            "partition-preserving map changed the partition key type from {} to {}",
            self.typ.pk_type(),
            new_typ.pk_type()
        );
        let bounds = self.partitioner.range_bounds().to_vec();
        let parts = self
            .stream
            .parts
            .iter()
            .enumerate()
            .map(|(i, old)| {
                let old = old.clone();
                let f = f.clone();
                let typ = new_typ.clone();
                let bound = bounds[i].clone();
                Rc::new(move || {
                    let mapped = f(i, old()?)?;
                    if cfg!(debug_assertions) {
                        Ok(Box::new(VerifyCursor::new(mapped, typ.clone(), bound.clone(), i))
                            as Box<dyn RowCursor>)
                    } else {
                        Ok(mapped)
                    }
                }) as CursorFactory
            })
            .collect();
        self.derive(new_typ, self.partitioner.clone(), PartStream::new(parts))
    }

    /// Per-row transform through a compiled routine producing the new row.
    pub fn map_rows_preserving(
        &self,
        new_typ: OrderedKeyedType,
        routine: Rc<CompiledRoutine>,
    ) -> Result<Self> {
        let row_fund = self.typ.row_fund().clone();
        self.map_partitions_preserving(
            new_typ,
            Rc::new(move |_i, child| {
                Ok(Box::new(MapRowsCursor {
                    child,
                    routine: routine.clone(),
                    row_fund: row_fund.clone(),
                    region: Region::new(),
                    offset: 0,
                }) as Box<dyn RowCursor>)
            }),
        )
    }

    /// Keeps rows satisfying a compiled Bool predicate over the row.
    pub fn filter(&self, pred: Rc<CompiledRoutine>) -> Result<Self> {
        ensure!(
            matches!(pred.typ().kind, Kind::Bool),
            "filter predicate must be Bool, got {}",
            pred.typ()
        );
        let row_fund = self.typ.row_fund().clone();
        let parts = self
            .stream
            .parts
            .iter()
            .map(|old| {
                let old = old.clone();
                let pred = pred.clone();
                let row_fund = row_fund.clone();
                Rc::new(move || {
                    Ok(Box::new(FilterCursor {
                        child: old()?,
                        pred: pred.clone(),
                        row_fund: row_fund.clone(),
                        scratch: Region::new(),
                    }) as Box<dyn RowCursor>)
                }) as CursorFactory
            })
            .collect();
        self.derive(
            self.typ.clone(),
            self.partitioner.clone(),
            PartStream::new(parts),
        )
    }

    /// Bernoulli sample, deterministic in (seed, partition index).
    pub fn sample(&self, p: f64, seed: u64) -> Result<Self> {
        ensure!((0.0..=1.0).contains(&p), "sample probability {} not in [0, 1]", p);
        let parts = self
            .stream
            .parts
            .iter()
            .enumerate()
            .map(|(i, old)| {
                let old = old.clone();
                Rc::new(move || {
                    Ok(Box::new(SampleCursor::new(old()?, p, seed, i)) as Box<dyn RowCursor>)
                }) as CursorFactory
            })
            .collect();
        self.derive(
            self.typ.clone(),
            self.partitioner.clone(),
            PartStream::new(parts),
        )
    }

    /// Pairs up partitions of two identically-partitioned datasets through a
    /// caller-supplied cursor combinator.
    pub fn zip_partitions_preserving(
        &self,
        other: &OrderedDataset,
        new_typ: OrderedKeyedType,
        f: Rc<dyn Fn(usize, Box<dyn RowCursor>, Box<dyn RowCursor>) -> Result<Box<dyn RowCursor>>>,
    ) -> Result<Self> {
        ensure!(
            self.n_partitions() == other.n_partitions(),
            "zip of {} against {} partitions",
            self.n_partitions(),
            other.n_partitions()
        );
        let parts = self
            .stream
            .parts
            .iter()
            .zip(&other.stream.parts)
            .enumerate()
            .map(|(i, (a, b))| {
                let (a, b, f) = (a.clone(), b.clone(), f.clone());
                Rc::new(move || f(i, a()?, b()?)) as CursorFactory
            })
            .collect();
        self.derive(new_typ, self.partitioner.clone(), PartStream::new(parts))
    }

    /// First n rows in global key order; tail partitions drop and the range
    /// bounds truncate with them.
    pub fn head(&self, n: usize) -> Result<Self> {
        if n == 0 || self.n_partitions() == 0 {
            return self.derive(
                self.typ.clone(),
                Arc::new(OrderedPartitioner::empty(self.typ.pk_type())),
                PartStream::new(Vec::new()),
            );
        }
        let counts = self.partition_counts()?;
        let mut remaining = n;
        let mut kept = Vec::new();
        for (i, &c) in counts.iter().enumerate() {
            if c >= remaining {
                let old = self.stream.parts[i].clone();
                let limit = remaining;
                kept.push(Rc::new(move || {
                    Ok(Box::new(TakeCursor {
                        child: old()?,
                        remaining: limit,
                    }) as Box<dyn RowCursor>)
                }) as CursorFactory);
                remaining = 0;
                break;
            }
            kept.push(self.stream.parts[i].clone());
            remaining -= c;
        }
        let partitioner = Arc::new(self.partitioner.truncate(kept.len())?);
        self.derive(self.typ.clone(), partitioner, PartStream::new(kept))
    }

    /// Concatenates contiguous partition groups ending at the given indices.
    pub fn block_coalesce(&self, part_ends: &[usize]) -> Result<Self> {
        let partitioner = Arc::new(self.partitioner.coalesce_range_bounds(part_ends)?);
        let mut parts: Vec<CursorFactory> = Vec::with_capacity(part_ends.len());
        let mut start = 0;
        for &end in part_ends {
            let group: Vec<CursorFactory> = self.stream.parts[start..=end].to_vec();
            parts.push(Rc::new(move || {
                Ok(Box::new(ConcatCursor::new(group.clone())) as Box<dyn RowCursor>)
            }) as CursorFactory);
            start = end + 1;
        }
        self.derive(self.typ.clone(), partitioner, PartStream::new(parts))
    }

    /// Coalesce into evenly-sized groups without inspecting row counts.
    pub fn naive_coalesce(&self, max_partitions: usize) -> Result<Self> {
        ensure!(max_partitions >= 1, "coalesce requires at least 1 partition");
        let n = self.n_partitions();
        if max_partitions >= n {
            return self.derive(self.typ.clone(), self.partitioner.clone(), self.stream.clone());
        }
        let groups = max_partitions;
        let ends: Vec<usize> = (1..=groups).map(|g| g * n / groups - 1).collect();
        self.block_coalesce(&ends)
    }

    /// Count-balanced coalesce. With `shuffle` false and `max_partitions`
    /// at or above the current count this is the identity; otherwise picks
    /// monotone partition ends that approximately equalize row counts by
    /// binary search over cumulative sums.
    pub fn coalesce(&self, max_partitions: usize, shuffle: bool) -> Result<Self> {
        ensure!(max_partitions >= 1, "coalesce requires at least 1 partition");
        let n = self.n_partitions();
        if shuffle {
            let partitioner = coerce::partitioner_from_dataset_sample(self, max_partitions)?;
            return self.shuffle_to_partitioner(Arc::new(partitioner));
        }
        if max_partitions >= n {
            return self.derive(self.typ.clone(), self.partitioner.clone(), self.stream.clone());
        }
        let counts = self.partition_counts()?;
        let mut cumulative = Vec::with_capacity(n);
        let mut total = 0usize;
        for c in &counts {
            total += c;
            cumulative.push(total);
        }
        let mut ends = Vec::with_capacity(max_partitions);
        for k in 1..max_partitions {
            let target = (k * total).div_ceil(max_partitions);
            let found = cumulative.partition_point(|&c| c < target);
            let end = found.min(n - 1);
            // tie-advance to keep the ends strictly increasing
            let end = match ends.last() {
                Some(&prev) if end <= prev => prev + 1,
                _ => end,
            };
            if end >= n - 1 {
                break;
            }
            ends.push(end);
        }
        ends.push(n - 1);
        self.block_coalesce(&ends)
    }

    /// Keeps the selected partitions; bounds stretch over dropped gaps so
    /// the partitioner invariant holds.
    pub fn subset_partitions(&self, keep: &[usize]) -> Result<Self> {
        if keep.is_empty() {
            return self.derive(
                self.typ.clone(),
                Arc::new(OrderedPartitioner::empty(self.typ.pk_type())),
                PartStream::new(Vec::new()),
            );
        }
        let partitioner = Arc::new(self.partitioner.subset(keep)?);
        let parts = keep
            .iter()
            .map(|&i| self.stream.parts[i].clone())
            .collect();
        self.derive(self.typ.clone(), partitioner, PartStream::new(parts))
    }

    /// Rebuilds the stream against a new partitioner over the same key
    /// space: each new partition concatenates the bound-filtered slices of
    /// every old partition its range overlaps.
    pub fn constrain_to_partitioner(
        &self,
        new_partitioner: Arc<OrderedPartitioner>,
    ) -> Result<Self> {
        ensure!(
            new_partitioner.pk_type().kind == self.typ.pk_type().kind,
            "cannot constrain rows keyed by {} to a partitioner over {}",
            self.typ.pk_type(),
            new_partitioner.pk_type()
        );
        let typ = self.typ.clone();
        let mut parts: Vec<CursorFactory> = Vec::with_capacity(new_partitioner.num_partitions());
        for bound in new_partitioner.range_bounds() {
            let overlapping = self.partitioner.partition_range(bound);
            let sources: Vec<CursorFactory> = overlapping
                .iter()
                .map(|&j| self.stream.parts[j].clone())
                .collect();
            let bound = bound.clone();
            let typ2 = typ.clone();
            parts.push(Rc::new(move || {
                let concat = Box::new(ConcatCursor::new(sources.clone())) as Box<dyn RowCursor>;
                Ok(Box::new(BoundFilterCursor {
                    child: concat,
                    typ: typ2.clone(),
                    bound: bound.clone(),
                }) as Box<dyn RowCursor>)
            }) as CursorFactory);
        }
        self.derive(self.typ.clone(), new_partitioner, PartStream::new(parts))
    }

    /// Ships every row to the partition owning its key and re-sorts each
    /// partition.
    pub fn shuffle_to_partitioner(
        &self,
        new_partitioner: Arc<OrderedPartitioner>,
    ) -> Result<Self> {
        let typ = self.typ.clone();
        let part = new_partitioner.clone();
        let part_fn: crate::backend::PartitionFnForRow = Rc::new(move |region, off| {
            let pk = typ.pk_of_row(region, off);
            part.partition_for_key(&pk)
        });
        let typ2 = self.typ.clone();
        let cmp: crate::backend::RowCompare =
            Rc::new(move |r1, o1, r2, o2| typ2.compare_rows_by_key(r1, o1, r2, o2));
        let shuffled = self.backend.shuffle_by_key(
            self.typ.row_type(),
            &self.stream,
            new_partitioner.num_partitions(),
            part_fn,
            cmp,
        )?;
        self.derive(self.typ.clone(), new_partitioner, shuffled)
    }

    /// Groups maximal equal-by-key runs within each partition into
    /// (key, array-of-values) rows. Grouping never crosses partitions
    /// because the partition key is a prefix of the key.
    pub fn group_by_key(&self, values_field: &str) -> Result<Self> {
        let s = self.typ.row_struct();
        ensure!(
            s.field_index(values_field).is_none(),
            "values field `{}` collides with an existing row field",
            values_field
        );
        let value_struct = Type::struct_(
            self.typ
                .value_indices()
                .iter()
                .map(|&i| s.field(i).clone())
                .collect(),
        )
        .required();
        let mut out_fields: Vec<Field> = self
            .typ
            .key_indices()
            .iter()
            .map(|&i| s.field(i).clone())
            .collect();
        out_fields.push(Field::new(
            values_field,
            Type::array(value_struct.clone()).required(),
        ));
        let out_row = Type::struct_(out_fields).required();
        let out_typ =
            OrderedKeyedType::new(out_row, self.typ.key().to_vec(), self.typ.n_partition_key())?;

        let in_typ = self.typ.clone();
        let out_typ2 = out_typ.clone();
        let out_row_type = out_typ.row_type().clone();
        let parts = self
            .stream
            .parts
            .iter()
            .map(|old| {
                let old = old.clone();
                let in_typ = in_typ.clone();
                let out_row_type = out_row_type.clone();
                let value_struct = value_struct.clone();
                Rc::new(move || {
                    Ok(Box::new(GroupByKeyCursor::new(
                        old()?,
                        in_typ.clone(),
                        out_row_type.clone(),
                        value_struct.clone(),
                    )) as Box<dyn RowCursor>)
                }) as CursorFactory
            })
            .collect();
        self.derive(out_typ2, self.partitioner.clone(), PartStream::new(parts))
    }

    /// Keeps the first row of each equal-by-key run.
    pub fn distinct_by_key(&self) -> Result<Self> {
        let typ = self.typ.clone();
        let parts = self
            .stream
            .parts
            .iter()
            .map(|old| {
                let old = old.clone();
                let typ = typ.clone();
                Rc::new(move || {
                    Ok(Box::new(DistinctByKeyCursor::new(old()?, typ.clone()))
                        as Box<dyn RowCursor>)
                }) as CursorFactory
            })
            .collect();
        self.derive(
            self.typ.clone(),
            self.partitioner.clone(),
            PartStream::new(parts),
        )
    }

    /// Merges two datasets of identical type and partitioner with a
    /// two-pointer key merge per partition pair.
    pub fn partition_sorted_union(&self, other: &OrderedDataset) -> Result<Self> {
        ensure!(
            self.typ.row_type() == other.typ.row_type()
                && self.typ.key() == other.typ.key()
                && self.typ.n_partition_key() == other.typ.n_partition_key(),
            "sorted union requires identical types, got {} and {}",
            self.typ.row_type(),
            other.typ.row_type()
        );
        ensure!(
            self.partitioner.range_bounds() == other.partitioner.range_bounds(),
            "sorted union requires identical partitioners"
        );
        let typ = self.typ.clone();
        self.zip_partitions_preserving(
            other,
            self.typ.clone(),
            Rc::new(move |_i, a, b| {
                Ok(Box::new(MergeCursor::new(a, b, typ.clone())) as Box<dyn RowCursor>)
            }),
        )
    }

    /// Narrows to partitions whose bounds overlap the query intervals, then
    /// filters rows to partition-key membership.
    pub fn filter_intervals(&self, tree: &Rc<IntervalTree>) -> Result<Self> {
        let queries = tree.intervals();
        let keep = self.partitioner.partitions_overlapping(&queries);
        let narrowed = self.subset_partitions(&keep)?;
        let typ = narrowed.typ.clone();
        let parts = narrowed
            .stream
            .parts
            .iter()
            .map(|old| {
                let old = old.clone();
                let typ = typ.clone();
                let tree = tree.clone();
                Rc::new(move || {
                    Ok(Box::new(IntervalMembershipCursor {
                        child: old()?,
                        typ: typ.clone(),
                        tree: tree.clone(),
                    }) as Box<dyn RowCursor>)
                }) as CursorFactory
            })
            .collect();
        narrowed.derive(
            narrowed.typ.clone(),
            narrowed.partitioner.clone(),
            PartStream::new(parts),
        )
    }

    /// Runs a compiled aggregation over every row: per-partition sequence
    /// steps, partial-state combination across partitions, then the result
    /// expression.
    pub fn aggregate(&self, compiled: &crate::ir::CompiledAggregation) -> Result<Annotation> {
        let mut global: Option<Vec<Box<dyn crate::agg::RegionAggregator>>> = None;
        let row_fund = self.typ.row_fund().clone();
        for factory in &self.stream.parts {
            let mut states = compiled.new_states();
            let mut cursor = factory()?;
            let mut scratch = Region::new();
            while cursor.advance()? {
                scratch.clear();
                let staged = {
                    let (src, off) = cursor.current();
                    crate::region::copy::copy_root(&row_fund, src, off, &mut scratch)
                };
                compiled.run_seq(
                    &mut scratch,
                    &mut states,
                    (crate::ir::Prim::Offset(staged), false),
                )?;
            }
            global = Some(match global {
                None => states,
                Some(mut acc) => {
                    for (a, s) in acc.iter_mut().zip(&states) {
                        a.comb_op(s.as_ref())?;
                    }
                    acc
                }
            });
        }
        let mut states = match global {
            Some(s) => s,
            None => compiled.new_states(),
        };
        let mut region = Region::new();
        let (missing, v) = compiled.run_result(&mut region, &mut states)?;
        if missing {
            return Ok(Annotation::Missing);
        }
        Ok(match v {
            crate::ir::Prim::Bool(x) => Annotation::Bool(x),
            crate::ir::Prim::Int32(x) => Annotation::Int32(x),
            crate::ir::Prim::Int64(x) => Annotation::Int64(x),
            crate::ir::Prim::Float32(x) => Annotation::Float32(x),
            crate::ir::Prim::Float64(x) => Annotation::Float64(x),
            crate::ir::Prim::Offset(off) => {
                view::read_annotation(compiled.result_type(), &region, off)
            }
        })
    }
}
