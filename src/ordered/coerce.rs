//! Building an ordered dataset from arbitrary partitioned input.
//!
//! Each partition is scanned once for its key-range and sortedness, plus a
//! bounded reservoir of partition-key samples. The cheapest sufficient
//! strategy is then chosen:
//!
//! - **AS_IS**: every partition fully key-sorted and partition ranges
//!   non-overlapping after sorting by minimum. Boundary-equal partition
//!   keys are fixed by adjustments: the first occurrence keeps the boundary
//!   rows, later partitions' leading equal runs shift to the predecessor.
//! - **LOCAL_SORT**: partitions are partition-key sorted but runs are not
//!   key-sorted internally; the assembled partitions lazily sort each
//!   equal-PK run.
//! - **SHUFFLE**: anything else. Target ranges are cut evenly over the
//!   samples with ties collapsed so no two partitions share a partition
//!   key, and the shuffle re-establishes order.

use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;

use eyre::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::backend::{Backend, ConcatCursor, CursorFactory, PartStream, RowCursor};
use crate::interval::Interval;
use crate::ordered::cursors::{DropLeadingPkCursor, LocalKeySortCursor, TakeLeadingPkCursor};
use crate::ordered::{OrderedDataset, OrderedKeyedType, OrderedPartitioner};
use crate::region::WritableRegionValue;
use crate::vtype::{compare, Annotation, Type};

const SAMPLES_PER_PARTITION: usize = 100;
const MAX_TOTAL_SAMPLES: usize = 1_000_000;

/// Global sortedness judgement over the scanned partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sortedness {
    Unsorted,
    /// Partition-key sorted within partitions, but partition ranges
    /// interleave.
    PkSorted,
    /// Partition ranges are disjoint after sorting, but equal-PK runs are
    /// not key-sorted internally.
    TSorted,
    KSorted,
}

struct PartitionScan {
    idx: usize,
    n_rows: usize,
    min_pk: Annotation,
    max_pk: Annotation,
    pk_sorted: bool,
    k_sorted: bool,
    samples: Vec<Annotation>,
}

fn scan_partition(
    typ: &OrderedKeyedType,
    idx: usize,
    factory: &CursorFactory,
    samples_per_partition: usize,
    seed: u64,
) -> Result<Option<PartitionScan>> {
    let mut cursor = factory()?;
    let pk_type = typ.pk_type();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
    let mut prev_key = WritableRegionValue::new(typ.key_type());
    let mut prev_pk: Option<Annotation> = None;
    let mut scan: Option<PartitionScan> = None;

    while cursor.advance()? {
        let (region, off) = cursor.current();
        let pk = typ.pk_of_row(region, off);
        let key_cmp = if prev_key.is_present() {
            typ.compare_row_with_key(region, off, prev_key.region(), prev_key.offset())
        } else {
            Ordering::Greater
        };
        let pk_cmp = match &prev_pk {
            Some(p) => compare(&pk_type, &pk, p, true),
            None => Ordering::Greater,
        };
        prev_pk = Some(pk.clone());
        match scan.as_mut() {
            None => {
                scan = Some(PartitionScan {
                    idx,
                    n_rows: 1,
                    min_pk: pk.clone(),
                    max_pk: pk.clone(),
                    pk_sorted: true,
                    k_sorted: true,
                    samples: vec![pk],
                });
            }
            Some(s) => {
                s.n_rows += 1;
                if compare(&pk_type, &pk, &s.min_pk, true) == Ordering::Less {
                    s.min_pk = pk.clone();
                }
                if compare(&pk_type, &pk, &s.max_pk, true) == Ordering::Greater {
                    s.max_pk = pk.clone();
                }
                if pk_cmp == Ordering::Less {
                    s.pk_sorted = false;
                }
                if key_cmp == Ordering::Less {
                    s.k_sorted = false;
                }
                // bounded reservoir of pk samples
                if s.samples.len() < samples_per_partition {
                    s.samples.push(pk);
                } else {
                    let j = rng.gen_range(0..s.n_rows);
                    if j < samples_per_partition {
                        s.samples[j] = pk;
                    }
                }
            }
        }
        let (region, off) = cursor.current();
        let key_indices = typ.key_indices().to_vec();
        prev_key.set_select(typ.row_type(), &key_indices, region, off)?;
    }
    Ok(scan)
}

/// Builds an ordered dataset from arbitrarily-ordered partitioned input.
pub fn coerce(
    typ: OrderedKeyedType,
    backend: Rc<dyn Backend>,
    stream: PartStream,
    seed: u64,
) -> Result<OrderedDataset> {
    let pk_type = typ.pk_type();
    let k = SAMPLES_PER_PARTITION.min(
        (MAX_TOTAL_SAMPLES / stream.n_partitions().max(1)).max(1),
    );
    let mut scans = Vec::new();
    for (i, factory) in stream.parts.iter().enumerate() {
        if let Some(s) = scan_partition(&typ, i, factory, k, seed)? {
            scans.push(s);
        }
    }
    if scans.is_empty() {
        let partitioner = Arc::new(OrderedPartitioner::empty(pk_type));
        return OrderedDataset::new(typ, partitioner, backend, PartStream::new(Vec::new()));
    }

    scans.sort_by(|a, b| {
        compare(&pk_type, &a.min_pk, &b.min_pk, true)
            .then_with(|| compare(&pk_type, &a.max_pk, &b.max_pk, true))
    });

    let sortedness = classify(&pk_type, &scans);
    debug!(?sortedness, partitions = scans.len(), "coercing to ordered");

    match sortedness {
        Sortedness::KSorted => assemble(typ, backend, &stream, &scans, false),
        Sortedness::TSorted => assemble(typ, backend, &stream, &scans, true),
        Sortedness::Unsorted | Sortedness::PkSorted => {
            let n_parts = stream.n_partitions();
            let partitioner = partitioner_from_scans(&pk_type, &scans, n_parts)?;
            shuffle_into(typ, backend, &stream, Arc::new(partitioner))
        }
    }
}

fn classify(pk_type: &Type, scans: &[PartitionScan]) -> Sortedness {
    if scans.iter().any(|s| !s.pk_sorted) {
        return Sortedness::Unsorted;
    }
    for w in scans.windows(2) {
        if compare(pk_type, &w[0].max_pk, &w[1].min_pk, true) == Ordering::Greater {
            // ranges interleave beyond a shared boundary point
            return Sortedness::PkSorted;
        }
    }
    if scans.iter().all(|s| s.k_sorted) {
        Sortedness::KSorted
    } else {
        Sortedness::TSorted
    }
}

enum SegmentMode {
    Full,
    DropLeading(Annotation),
    TakeLeading(Annotation),
}

struct Segment {
    source: usize,
    mode: SegmentMode,
}

struct AssembledPart {
    segments: Vec<Segment>,
    min_pk: Annotation,
    min_inclusive: bool,
    max_pk: Annotation,
}

/// AS_IS assembly: adjusted partitions in range order, with boundary-equal
/// runs shifted to their first occurrence.
fn assemble(
    typ: OrderedKeyedType,
    backend: Rc<dyn Backend>,
    stream: &PartStream,
    scans: &[PartitionScan],
    local_sort: bool,
) -> Result<OrderedDataset> {
    let pk_type = typ.pk_type();
    let m = scans.len();
    let mut consumed = vec![false; m];
    let mut assembled: Vec<AssembledPart> = Vec::with_capacity(m);

    for i in 0..m {
        if consumed[i] {
            continue;
        }
        let own = &scans[i];
        let claimed = assembled
            .last()
            .is_some_and(|prev| compare(&pk_type, &prev.max_pk, &own.min_pk, true).is_eq());
        let mut segments = vec![Segment {
            source: own.idx,
            mode: if claimed {
                SegmentMode::DropLeading(own.min_pk.clone())
            } else {
                SegmentMode::Full
            },
        }];
        let max_pk = own.max_pk.clone();
        let mut j = i + 1;
        while j < m && compare(&pk_type, &scans[j].min_pk, &max_pk, true).is_eq() {
            segments.push(Segment {
                source: scans[j].idx,
                mode: SegmentMode::TakeLeading(max_pk.clone()),
            });
            if compare(&pk_type, &scans[j].max_pk, &max_pk, true).is_eq() {
                // the whole partition sits on the boundary point
                consumed[j] = true;
                j += 1;
            } else {
                break;
            }
        }
        assembled.push(AssembledPart {
            segments,
            min_pk: own.min_pk.clone(),
            min_inclusive: !claimed,
            max_pk,
        });
    }

    let mut bounds = Vec::with_capacity(assembled.len());
    for (i, part) in assembled.iter().enumerate() {
        let (end, includes_end) = match assembled.get(i + 1) {
            Some(next) => (next.min_pk.clone(), !next.min_inclusive),
            None => (part.max_pk.clone(), true),
        };
        bounds.push(Interval::new(
            part.min_pk.clone(),
            end,
            part.min_inclusive,
            includes_end,
        ));
    }
    let partitioner = Arc::new(OrderedPartitioner::new(pk_type, bounds)?);

    let mut parts: Vec<CursorFactory> = Vec::with_capacity(assembled.len());
    for part in assembled {
        let sources: Vec<(CursorFactory, Rc<SegmentMode>)> = part
            .segments
            .into_iter()
            .map(|seg| (stream.parts[seg.source].clone(), Rc::new(seg.mode)))
            .collect();
        let typ2 = typ.clone();
        parts.push(Rc::new(move || {
            let seg_factories: Vec<CursorFactory> = sources
                .iter()
                .map(|(factory, mode)| {
                    let factory = factory.clone();
                    let mode = mode.clone();
                    let typ = typ2.clone();
                    Rc::new(move || {
                        let child = factory()?;
                        Ok(match mode.as_ref() {
                            SegmentMode::Full => child,
                            SegmentMode::DropLeading(pk) => Box::new(DropLeadingPkCursor {
                                child,
                                typ: typ.clone(),
                                pk: pk.clone(),
                                dropped: false,
                            })
                                as Box<dyn RowCursor>,
                            SegmentMode::TakeLeading(pk) => Box::new(TakeLeadingPkCursor {
                                child,
                                typ: typ.clone(),
                                pk: pk.clone(),
                                done: false,
                            })
                                as Box<dyn RowCursor>,
                        })
                    }) as CursorFactory
                })
                .collect();
            let concat = Box::new(ConcatCursor::new(seg_factories)) as Box<dyn RowCursor>;
            Ok(if local_sort {
                Box::new(LocalKeySortCursor::new(concat, typ2.clone())) as Box<dyn RowCursor>
            } else {
                concat
            })
        }) as CursorFactory);
    }

    OrderedDataset::new(typ, partitioner, backend, PartStream::new(parts))
}

/// Evenly-spaced cut points over the pooled samples, ties collapsed so no
/// two partitions share a partition key.
fn partitioner_from_scans(
    pk_type: &Type,
    scans: &[PartitionScan],
    n_parts: usize,
) -> Result<OrderedPartitioner> {
    let mut samples: Vec<Annotation> = Vec::new();
    let mut min_pk = scans[0].min_pk.clone();
    let mut max_pk = scans[0].max_pk.clone();
    for s in scans {
        if compare(pk_type, &s.min_pk, &min_pk, true) == Ordering::Less {
            min_pk = s.min_pk.clone();
        }
        if compare(pk_type, &s.max_pk, &max_pk, true) == Ordering::Greater {
            max_pk = s.max_pk.clone();
        }
        samples.extend(s.samples.iter().cloned());
    }
    samples.sort_by(|a, b| compare(pk_type, a, b, true));
    build_partitioner(pk_type, &min_pk, &max_pk, &samples, n_parts)
}

fn build_partitioner(
    pk_type: &Type,
    min_pk: &Annotation,
    max_pk: &Annotation,
    sorted_samples: &[Annotation],
    n_parts: usize,
) -> Result<OrderedPartitioner> {
    let mut cuts: Vec<Annotation> = Vec::new();
    if n_parts > 1 && !sorted_samples.is_empty() {
        for k in 1..n_parts {
            let pos = k * sorted_samples.len() / n_parts;
            let c = sorted_samples[pos.min(sorted_samples.len() - 1)].clone();
            let in_range = compare(pk_type, &c, min_pk, true) == Ordering::Greater
                && compare(pk_type, &c, max_pk, true) != Ordering::Greater;
            let fresh = cuts
                .last()
                .map_or(true, |prev| compare(pk_type, prev, &c, true) == Ordering::Less);
            if in_range && fresh {
                cuts.push(c);
            }
        }
    }
    let mut bounds = Vec::with_capacity(cuts.len() + 1);
    let mut start = min_pk.clone();
    for c in cuts {
        bounds.push(Interval::new(start.clone(), c.clone(), true, false));
        start = c;
    }
    bounds.push(Interval::new(start, max_pk.clone(), true, true));
    // a single fully-equal range collapses to one pointlike bound
    OrderedPartitioner::new(pk_type.clone(), bounds)
}

fn shuffle_into(
    typ: OrderedKeyedType,
    backend: Rc<dyn Backend>,
    stream: &PartStream,
    partitioner: Arc<OrderedPartitioner>,
) -> Result<OrderedDataset> {
    let t1 = typ.clone();
    let p1 = partitioner.clone();
    let part_fn: crate::backend::PartitionFnForRow = Rc::new(move |region, off| {
        let pk = t1.pk_of_row(region, off);
        p1.partition_for_key(&pk)
    });
    let t2 = typ.clone();
    let cmp: crate::backend::RowCompare =
        Rc::new(move |r1, o1, r2, o2| t2.compare_rows_by_key(r1, o1, r2, o2));
    let shuffled = backend.shuffle_by_key(
        typ.row_type(),
        stream,
        partitioner.num_partitions(),
        part_fn,
        cmp,
    )?;
    OrderedDataset::new(typ, partitioner, backend, shuffled)
}

/// Samples an already-ordered dataset to derive a smaller target
/// partitioner; used by shuffling coalesce.
pub fn partitioner_from_dataset_sample(
    ds: &OrderedDataset,
    n_parts: usize,
) -> Result<OrderedPartitioner> {
    let typ = ds.typ().clone();
    let mut scans = Vec::new();
    for (i, factory) in ds.stream().parts.iter().enumerate() {
        if let Some(s) = scan_partition(&typ, i, factory, SAMPLES_PER_PARTITION, 0)? {
            scans.push(s);
        }
    }
    let pk_type = typ.pk_type();
    if scans.is_empty() {
        return Ok(OrderedPartitioner::empty(pk_type));
    }
    scans.sort_by(|a, b| compare(&pk_type, &a.min_pk, &b.min_pk, true));
    partitioner_from_scans(&pk_type, &scans, n_parts)
}
