//! # Execution Runtime Seam
//!
//! The ordered-dataset layer consumes an abstract "parallel streams"
//! capability; this module is the single place where a concrete runtime
//! binds. A partitioned stream is a vector of re-runnable cursor factories:
//! invoking a factory opens a fresh pull iterator over that partition, so
//! multi-pass operations (sampling then reassembly, counting then
//! coalescing) re-drive the same pipeline.
//!
//! ## Cursor Contract
//!
//! A [`RowCursor`] is a pull iterator over region rows. `advance` moves to
//! the next row; `current` borrows it and stays valid only until the next
//! `advance`. Each cursor owns its region and clears it between rows, so
//! per-row allocations never accumulate; consumers that need a row beyond
//! the next advance deep-copy it.
//!
//! [`LocalBackend`] runs partitions as in-process iterators, one at a time.
//! A distributed binding would implement [`Backend`] over real workers and
//! impose `Send` on the factories; the dataset layer is indifferent.

use std::cmp::Ordering;
use std::rc::Rc;

use eyre::Result;

use crate::region::{builder::write_annotation, view, Region, RowCodec};
use crate::vtype::{Annotation, Type};

/// Pull iterator over the rows of one partition.
pub trait RowCursor {
    /// Advances to the next row, returning false when exhausted.
    fn advance(&mut self) -> Result<bool>;

    /// The current row as a (region, offset) pair. Valid until the next
    /// `advance` on this cursor.
    fn current(&self) -> (&Region, usize);
}

/// Opens a fresh cursor over a partition. Factories are re-runnable.
pub type CursorFactory = Rc<dyn Fn() -> Result<Box<dyn RowCursor>>>;

/// A partition-indexed collection of row streams.
#[derive(Clone)]
pub struct PartStream {
    pub parts: Vec<CursorFactory>,
}

impl PartStream {
    pub fn new(parts: Vec<CursorFactory>) -> Self {
        Self { parts }
    }

    pub fn n_partitions(&self) -> usize {
        self.parts.len()
    }
}

/// Computes a target partition for a row during a shuffle.
pub type PartitionFnForRow = Rc<dyn Fn(&Region, usize) -> Result<usize>>;

/// Row ordering used to re-establish in-partition order after a shuffle.
pub type RowCompare = Rc<dyn Fn(&Region, usize, &Region, usize) -> Ordering>;

/// The execution runtime capability consumed by the dataset layer.
pub trait Backend {
    /// Distributes materialized rows over `n_parts` contiguous partitions.
    fn parallelize(&self, typ: &Type, rows: Vec<Annotation>, n_parts: usize)
        -> Result<PartStream>;

    /// Materializes every row, partition by partition, in partition order.
    fn collect(&self, typ: &Type, stream: &PartStream) -> Result<Vec<Annotation>>;

    /// Re-buckets rows by `part_fn` into `n_parts` partitions and sorts each
    /// output partition by `cmp`.
    fn shuffle_by_key(
        &self,
        typ: &Type,
        stream: &PartStream,
        n_parts: usize,
        part_fn: PartitionFnForRow,
        cmp: RowCompare,
    ) -> Result<PartStream>;

    /// A stream of `n_parts` empty partitions.
    fn empty(&self, n_parts: usize) -> PartStream;
}

/// In-process sequential runtime.
#[derive(Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Rc<Self> {
        Rc::new(Self)
    }
}

impl Backend for LocalBackend {
    fn parallelize(
        &self,
        typ: &Type,
        rows: Vec<Annotation>,
        n_parts: usize,
    ) -> Result<PartStream> {
        let n_parts = n_parts.max(1);
        let rows = Rc::new(rows);
        let typ = Rc::new(typ.clone());
        let per = rows.len().div_ceil(n_parts);
        let mut parts: Vec<CursorFactory> = Vec::with_capacity(n_parts);
        for p in 0..n_parts {
            let lo = (p * per).min(rows.len());
            let hi = ((p + 1) * per).min(rows.len());
            let rows = rows.clone();
            let typ = typ.clone();
            parts.push(Rc::new(move || {
                Ok(Box::new(AnnotationCursor {
                    typ: typ.clone(),
                    rows: rows.clone(),
                    next: lo,
                    end: hi,
                    region: Region::new(),
                    offset: 0,
                }) as Box<dyn RowCursor>)
            }));
        }
        Ok(PartStream::new(parts))
    }

    fn collect(&self, typ: &Type, stream: &PartStream) -> Result<Vec<Annotation>> {
        let mut out = Vec::new();
        for factory in &stream.parts {
            let mut cursor = factory()?;
            while cursor.advance()? {
                let (region, off) = cursor.current();
                out.push(view::read_annotation(typ, region, off));
            }
        }
        Ok(out)
    }

    fn shuffle_by_key(
        &self,
        typ: &Type,
        stream: &PartStream,
        n_parts: usize,
        part_fn: PartitionFnForRow,
        cmp: RowCompare,
    ) -> Result<PartStream> {
        let codec = RowCodec::new(typ);
        let mut buckets: Vec<Vec<u8>> = vec![Vec::new(); n_parts];
        let mut counts = vec![0usize; n_parts];
        for factory in &stream.parts {
            let mut cursor = factory()?;
            while cursor.advance()? {
                let (region, off) = cursor.current();
                let p = part_fn(region, off)?;
                eyre::ensure!(
                    p < n_parts,
                    "shuffle assigned partition {} of {}",
                    p,
                    n_parts
                );
                codec.encode(region, off, &mut buckets[p]);
                counts[p] += 1;
            }
        }

        let mut parts: Vec<CursorFactory> = Vec::with_capacity(n_parts);
        for (bytes, n) in buckets.into_iter().zip(counts) {
            // decode the bucket once, restore order, serve from the
            // materialized block
            let codec = RowCodec::new(typ);
            let mut region = Region::new();
            let mut offsets = Vec::with_capacity(n);
            let mut pos = 0;
            for _ in 0..n {
                offsets.push(codec.decode(&bytes, &mut pos, &mut region)?);
            }
            let region = Rc::new(region);
            {
                let r = region.clone();
                let cmp = cmp.clone();
                offsets.sort_by(|&a, &b| cmp(&r, a, &r, b));
            }
            let offsets = Rc::new(offsets);
            let region_for_factory = region.clone();
            parts.push(Rc::new(move || {
                Ok(Box::new(MaterializedCursor {
                    region: region_for_factory.clone(),
                    offsets: offsets.clone(),
                    next: 0,
                }) as Box<dyn RowCursor>)
            }));
        }
        Ok(PartStream::new(parts))
    }

    fn empty(&self, n_parts: usize) -> PartStream {
        let parts = (0..n_parts)
            .map(|_| {
                Rc::new(|| Ok(Box::new(EmptyCursor) as Box<dyn RowCursor>)) as CursorFactory
            })
            .collect();
        PartStream::new(parts)
    }
}

pub struct EmptyCursor;

impl RowCursor for EmptyCursor {
    fn advance(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn current(&self) -> (&Region, usize) {
        unreachable!("current() on an empty cursor")
    }
}

/// Builds annotations into region rows on demand.
struct AnnotationCursor {
    typ: Rc<Type>,
    rows: Rc<Vec<Annotation>>,
    next: usize,
    end: usize,
    region: Region,
    offset: usize,
}

impl RowCursor for AnnotationCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.next >= self.end {
            return Ok(false);
        }
        self.region.clear();
        self.offset = write_annotation(&mut self.region, &self.typ, &self.rows[self.next])?;
        self.next += 1;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (&self.region, self.offset)
    }
}

/// Serves rows already materialized in a shared region.
pub struct MaterializedCursor {
    pub region: Rc<Region>,
    pub offsets: Rc<Vec<usize>>,
    pub next: usize,
}

impl RowCursor for MaterializedCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.next >= self.offsets.len() {
            return Ok(false);
        }
        self.next += 1;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (self.region.as_ref(), self.offsets[self.next - 1])
    }
}

/// Chains several partitions into one stream.
pub struct ConcatCursor {
    pub factories: Vec<CursorFactory>,
    pub next_factory: usize,
    pub current: Option<Box<dyn RowCursor>>,
}

impl ConcatCursor {
    pub fn new(factories: Vec<CursorFactory>) -> Self {
        Self {
            factories,
            next_factory: 0,
            current: None,
        }
    }
}

impl RowCursor for ConcatCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(c) = self.current.as_mut() {
                if c.advance()? {
                    return Ok(true);
                }
                self.current = None;
            }
            if self.next_factory >= self.factories.len() {
                return Ok(false);
            }
            self.current = Some((self.factories[self.next_factory])()?);
            self.next_factory += 1;
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.current
            .as_ref()
            .expect("current() before advance()")
            .current()
    }
}

/// Caps a stream at `limit` rows.
pub struct TakeCursor {
    pub child: Box<dyn RowCursor>,
    pub remaining: usize,
}

impl RowCursor for TakeCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if self.child.advance()? {
            self.remaining -= 1;
            Ok(true)
        } else {
            self.remaining = 0;
            Ok(false)
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_rows(xs: &[i32]) -> Vec<Annotation> {
        xs.iter()
            .map(|&x| Annotation::Struct(vec![Annotation::Int32(x)]))
            .collect()
    }

    fn row_type() -> Type {
        Type::struct_(vec![crate::vtype::Field::new(
            "x",
            Type::int32().required(),
        )])
    }

    #[test]
    fn parallelize_then_collect_round_trips() {
        let b = LocalBackend::new();
        let t = row_type();
        let rows = int_rows(&[1, 2, 3, 4, 5]);
        let s = b.parallelize(&t, rows.clone(), 3).unwrap();
        assert_eq!(s.n_partitions(), 3);
        assert_eq!(b.collect(&t, &s).unwrap(), rows);
        // factories re-run cleanly
        assert_eq!(b.collect(&t, &s).unwrap(), rows);
    }

    #[test]
    fn shuffle_rebuckets_and_sorts_each_partition() {
        let b = LocalBackend::new();
        let t = row_type();
        let s = b.parallelize(&t, int_rows(&[5, 1, 8, 3, 2, 9]), 2).unwrap();
        let shuffled = b
            .shuffle_by_key(
                &t,
                &s,
                2,
                Rc::new(|region, off| Ok((region.load_i32(off) >= 5) as usize)),
                Rc::new(|r1, o1, r2, o2| r1.load_i32(o1).cmp(&r2.load_i32(o2))),
            )
            .unwrap();
        assert_eq!(
            b.collect(&t, &shuffled).unwrap(),
            int_rows(&[1, 2, 3, 5, 8, 9])
        );
    }
}
