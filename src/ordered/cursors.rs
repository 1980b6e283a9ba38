//! Row-cursor adapters for the ordered dataset layer.
//!
//! Every adapter follows the pull contract: one owned region per cursor,
//! cleared between produced rows. Adapters that evaluate compiled routines
//! copy the child row into their own region first, since a routine reads
//! and writes one ambient region.

use std::rc::Rc;

use eyre::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::RowCursor;
use crate::interval::{Interval, IntervalTree};
use crate::ir::{CompiledRoutine, Prim};
use crate::ordered::OrderedKeyedType;
use crate::region::{copy, Region, RegionValueBuilder, WritableRegionValue};
use crate::region::view;

/// Applies a compiled row routine to every row, producing the new row.
pub struct MapRowsCursor {
    pub child: Box<dyn RowCursor>,
    pub routine: Rc<CompiledRoutine>,
    pub row_fund: crate::vtype::Type,
    pub region: Region,
    pub offset: usize,
}

impl RowCursor for MapRowsCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.child.advance()? {
            return Ok(false);
        }
        self.region.clear();
        let staged = {
            let (src, off) = self.child.current();
            copy::copy_root(&self.row_fund, src, off, &mut self.region)
        };
        let (m, v) = self
            .routine
            .run(&mut self.region, &[(Prim::Offset(staged), false)])?;
        ensure!(!m, "row transform produced a missing row");
        self.offset = v.as_offset();
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (&self.region, self.offset)
    }
}

/// Keeps rows for which a compiled Bool predicate holds. Missing predicate
/// values drop the row.
pub struct FilterCursor {
    pub child: Box<dyn RowCursor>,
    pub pred: Rc<CompiledRoutine>,
    pub row_fund: crate::vtype::Type,
    pub scratch: Region,
}

impl RowCursor for FilterCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            self.scratch.clear();
            let staged = {
                let (src, off) = self.child.current();
                copy::copy_root(&self.row_fund, src, off, &mut self.scratch)
            };
            let (m, v) = self
                .pred
                .run(&mut self.scratch, &[(Prim::Offset(staged), false)])?;
            if !m && v.as_bool() {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Bernoulli sample of a stream, deterministic per (seed, partition).
pub struct SampleCursor {
    pub child: Box<dyn RowCursor>,
    pub rng: StdRng,
    pub p: f64,
}

impl SampleCursor {
    pub fn new(child: Box<dyn RowCursor>, p: f64, seed: u64, part_idx: usize) -> Self {
        Self {
            child,
            rng: StdRng::seed_from_u64(seed.wrapping_add(part_idx as u64)),
            p,
        }
    }
}

impl RowCursor for SampleCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            if self.rng.gen::<f64>() < self.p {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Keeps rows whose partition key lies inside a bound interval.
pub struct BoundFilterCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub bound: Interval,
}

impl RowCursor for BoundFilterCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            let (region, off) = self.child.current();
            let pk = self.typ.pk_of_row(region, off);
            if self.bound.contains(self.typ.pk_type_ref(), &pk) {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Keeps rows whose partition key lies inside any query interval.
pub struct IntervalMembershipCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub tree: Rc<IntervalTree>,
}

impl RowCursor for IntervalMembershipCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            let (region, off) = self.child.current();
            let pk = self.typ.pk_of_row(region, off);
            if self.tree.contains_point(&pk) {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Asserts the ordered-dataset invariant while passing rows through: keys
/// non-decreasing within the partition and every partition key inside the
/// partition's bound.
pub struct VerifyCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub bound: Interval,
    pub part_idx: usize,
    pub prev_key: WritableRegionValue,
}

impl VerifyCursor {
    pub fn new(
        child: Box<dyn RowCursor>,
        typ: OrderedKeyedType,
        bound: Interval,
        part_idx: usize,
    ) -> Self {
        let key_type = typ.key_type();
        Self {
            child,
            typ,
            bound,
            part_idx,
            prev_key: WritableRegionValue::new(key_type),
        }
    }
}

impl RowCursor for VerifyCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.child.advance()? {
            return Ok(false);
        }
        let (region, off) = self.child.current();
        let pk = self.typ.pk_of_row(region, off);
        ensure!(
            self.bound.contains(self.typ.pk_type_ref(), &pk),
            "partition {}: row key {:?} outside its range bound",
            self.part_idx,
            pk
        );
        if self.prev_key.is_present() {
            let cmp = self.typ.compare_row_with_key(
                region,
                off,
                self.prev_key.region(),
                self.prev_key.offset(),
            );
            ensure!(
                cmp != std::cmp::Ordering::Less,
                "partition {}: keys are not non-decreasing",
                self.part_idx
            );
        }
        let (region, off) = self.child.current();
        let key_indices = self.typ.key_indices().to_vec();
        self.prev_key
            .set_select(self.typ.row_type(), &key_indices, region, off)?;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Keeps the first row of every equal-by-key run.
pub struct DistinctByKeyCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub prev_key: WritableRegionValue,
}

impl DistinctByKeyCursor {
    pub fn new(child: Box<dyn RowCursor>, typ: OrderedKeyedType) -> Self {
        let key_type = typ.key_type();
        Self {
            child,
            typ,
            prev_key: WritableRegionValue::new(key_type),
        }
    }
}

impl RowCursor for DistinctByKeyCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            let is_new = {
                let (region, off) = self.child.current();
                !self.prev_key.is_present()
                    || self
                        .typ
                        .compare_row_with_key(
                            region,
                            off,
                            self.prev_key.region(),
                            self.prev_key.offset(),
                        )
                        .is_ne()
            };
            if is_new {
                let (region, off) = self.child.current();
                let key_indices = self.typ.key_indices().to_vec();
                self.prev_key
                    .set_select(self.typ.row_type(), &key_indices, region, off)?;
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Staircase grouping: walks maximal equal-by-key runs and emits one
/// (key fields..., values: array-of-value-structs) row per run.
pub struct GroupByKeyCursor {
    child: Box<dyn RowCursor>,
    typ: OrderedKeyedType,
    out_typ: crate::vtype::Type,
    value_struct: crate::vtype::Type,
    run_key: WritableRegionValue,
    run_values: Region,
    run_offsets: Vec<usize>,
    pending: bool,
    out_region: Region,
    out_offset: usize,
}

impl GroupByKeyCursor {
    pub fn new(
        child: Box<dyn RowCursor>,
        typ: OrderedKeyedType,
        out_typ: crate::vtype::Type,
        value_struct: crate::vtype::Type,
    ) -> Self {
        let key_type = typ.key_type();
        Self {
            child,
            typ,
            out_typ,
            value_struct,
            run_key: WritableRegionValue::new(key_type),
            run_values: Region::new(),
            run_offsets: Vec::new(),
            pending: false,
            out_region: Region::new(),
            out_offset: 0,
        }
    }

    fn stage_value(&mut self) -> Result<()> {
        let (region, off) = self.child.current();
        let value_indices = self.typ.value_indices();
        let mut rvb = RegionValueBuilder::new(&mut self.run_values, &self.value_struct);
        rvb.start_struct(true)?;
        let s = self.typ.row_struct();
        for &i in &value_indices {
            if view::is_field_defined(s, region, off, i) {
                let foff = view::load_field(s, region, off, i);
                rvb.add_region_value(s.field_type(i), region, foff)?;
            } else {
                rvb.set_missing()?;
            }
        }
        rvb.end_struct()?;
        self.run_offsets.push(rvb.end()?);
        Ok(())
    }

    fn emit_run(&mut self) -> Result<()> {
        self.out_region.clear();
        let key_struct_type = self.typ.key_type();
        let key_struct = key_struct_type.as_struct().expect("key struct");
        let mut rvb = RegionValueBuilder::new(&mut self.out_region, &self.out_typ);
        rvb.start_struct(true)?;
        for i in 0..key_struct.n_fields() {
            if view::is_field_defined(key_struct, self.run_key.region(), self.run_key.offset(), i) {
                let foff = view::load_field(
                    key_struct,
                    self.run_key.region(),
                    self.run_key.offset(),
                    i,
                );
                rvb.add_region_value(key_struct.field_type(i), self.run_key.region(), foff)?;
            } else {
                rvb.set_missing()?;
            }
        }
        rvb.start_array(self.run_offsets.len(), true)?;
        for &voff in &self.run_offsets {
            rvb.add_region_value(&self.value_struct, &self.run_values, voff)?;
        }
        rvb.end_array()?;
        rvb.end_struct()?;
        self.out_offset = rvb.end()?;
        Ok(())
    }
}

impl RowCursor for GroupByKeyCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.pending {
            if !self.child.advance()? {
                return Ok(false);
            }
            self.pending = true;
        }
        // a run opens with the pending row
        self.run_values.clear();
        self.run_offsets.clear();
        {
            let (region, off) = self.child.current();
            let key_indices = self.typ.key_indices().to_vec();
            self.run_key
                .set_select(self.typ.row_type(), &key_indices, region, off)?;
        }
        self.stage_value()?;
        loop {
            if !self.child.advance()? {
                self.pending = false;
                break;
            }
            let same = {
                let (region, off) = self.child.current();
                self.typ
                    .compare_row_with_key(
                        region,
                        off,
                        self.run_key.region(),
                        self.run_key.offset(),
                    )
                    .is_eq()
            };
            if same {
                self.stage_value()?;
            } else {
                // the fetched row opens the next run
                self.pending = true;
                break;
            }
        }
        self.emit_run()?;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (&self.out_region, self.out_offset)
    }
}

/// Two-pointer merge of equally-partitioned sorted streams.
pub struct MergeCursor {
    pub left: Box<dyn RowCursor>,
    pub right: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    left_live: bool,
    right_live: bool,
    primed: bool,
    serving_left: bool,
}

impl MergeCursor {
    pub fn new(left: Box<dyn RowCursor>, right: Box<dyn RowCursor>, typ: OrderedKeyedType) -> Self {
        Self {
            left,
            right,
            typ,
            left_live: false,
            right_live: false,
            primed: false,
            serving_left: true,
        }
    }
}

impl RowCursor for MergeCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.primed {
            self.left_live = self.left.advance()?;
            self.right_live = self.right.advance()?;
            self.primed = true;
        } else if self.serving_left {
            self.left_live = self.left.advance()?;
        } else {
            self.right_live = self.right.advance()?;
        }
        match (self.left_live, self.right_live) {
            (false, false) => Ok(false),
            (true, false) => {
                self.serving_left = true;
                Ok(true)
            }
            (false, true) => {
                self.serving_left = false;
                Ok(true)
            }
            (true, true) => {
                let (lr, lo) = self.left.current();
                let (rr, ro) = self.right.current();
                self.serving_left = self.typ.compare_rows_by_key(lr, lo, rr, ro).is_le();
                Ok(true)
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        if self.serving_left {
            self.left.current()
        } else {
            self.right.current()
        }
    }
}

/// Lazily K-sorts each maximal equal-by-PK run. Interposed by the coercion
/// path when partitions are PK-sorted but not fully key-sorted.
pub struct LocalKeySortCursor {
    child: Box<dyn RowCursor>,
    typ: OrderedKeyedType,
    run_pk: WritableRegionValue,
    run: Region,
    run_offsets: Vec<usize>,
    run_idx: usize,
    pending: bool,
}

impl LocalKeySortCursor {
    pub fn new(child: Box<dyn RowCursor>, typ: OrderedKeyedType) -> Self {
        let pk_type = typ.pk_type();
        Self {
            child,
            typ,
            run_pk: WritableRegionValue::new(pk_type),
            run: Region::new(),
            run_offsets: Vec::new(),
            run_idx: 0,
            pending: false,
        }
    }

    fn load_run(&mut self) -> Result<bool> {
        if !self.pending {
            if !self.child.advance()? {
                return Ok(false);
            }
        }
        self.pending = false;
        self.run.clear();
        self.run_offsets.clear();
        self.run_idx = 0;
        {
            let (region, off) = self.child.current();
            let pk_indices = self.typ.pk_indices().to_vec();
            self.run_pk
                .set_select(self.typ.row_type(), &pk_indices, region, off)?;
        }
        loop {
            {
                let (region, off) = self.child.current();
                let fund = self.typ.row_fund().clone();
                let staged = copy::copy_root(&fund, region, off, &mut self.run);
                self.run_offsets.push(staged);
            }
            if !self.child.advance()? {
                break;
            }
            let same = {
                let (region, off) = self.child.current();
                self.typ
                    .compare_row_with_pk(region, off, self.run_pk.region(), self.run_pk.offset())
                    .is_eq()
            };
            if !same {
                self.pending = true;
                break;
            }
        }
        let run = &self.run;
        let typ = &self.typ;
        self.run_offsets
            .sort_by(|&a, &b| typ.compare_rows_by_key(run, a, run, b));
        Ok(true)
    }
}

impl RowCursor for LocalKeySortCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.run_idx + 1 < self.run_offsets.len() {
            self.run_idx += 1;
            return Ok(true);
        }
        if !self.run_offsets.is_empty() {
            self.run_idx = self.run_offsets.len();
        }
        if !self.load_run()? {
            return Ok(false);
        }
        self.run_idx = 0;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (&self.run, self.run_offsets[self.run_idx])
    }
}

/// Drops the leading run of rows whose PK equals `pk`, then passes through.
pub struct DropLeadingPkCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub pk: crate::vtype::Annotation,
    pub dropped: bool,
}

impl RowCursor for DropLeadingPkCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.child.advance()? {
                return Ok(false);
            }
            if self.dropped {
                return Ok(true);
            }
            let (region, off) = self.child.current();
            if self.typ.pk_of_row(region, off) != self.pk {
                self.dropped = true;
                return Ok(true);
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}

/// Serves only the leading run of rows whose PK equals `pk`.
pub struct TakeLeadingPkCursor {
    pub child: Box<dyn RowCursor>,
    pub typ: OrderedKeyedType,
    pub pk: crate::vtype::Annotation,
    pub done: bool,
}

impl RowCursor for TakeLeadingPkCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if !self.child.advance()? {
            self.done = true;
            return Ok(false);
        }
        let (region, off) = self.child.current();
        if self.typ.pk_of_row(region, off) == self.pk {
            Ok(true)
        } else {
            self.done = true;
            Ok(false)
        }
    }

    fn current(&self) -> (&Region, usize) {
        self.child.current()
    }
}
