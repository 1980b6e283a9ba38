//! Ordered merge joins.
//!
//! Both sides are keyed, the right side is realigned to the left's
//! partitioner, and co-partitioned partition pairs run a streaming merge
//! join. Equal-key runs on the right are buffered in a staging region and
//! crossed against each matching left row; the "distinct" variants collapse
//! duplicate right keys to the run's first row.
//!
//! Output rows are (key fields, left value fields, right value fields);
//! fields from the side a join type can miss become optional, and the
//! missing side's fields are missing in unmatched rows.

use std::cmp::Ordering;
use std::rc::Rc;

use eyre::{bail, ensure, Result};

use crate::backend::RowCursor;
use crate::ordered::{OrderedDataset, OrderedKeyedType};
use crate::region::{view, Region, RegionValueBuilder, WritableRegionValue};
use crate::vtype::{Field, StructType, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinKind {
    fn keeps_unmatched_left(self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Outer)
    }

    fn keeps_unmatched_right(self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Outer)
    }
}

impl OrderedDataset {
    /// Merge join against `other` on the shared key. The right side is
    /// realigned to this dataset's partitioner first.
    pub fn ordered_join(&self, other: &OrderedDataset, kind: JoinKind) -> Result<OrderedDataset> {
        self.join_impl(other, kind, false)
    }

    /// Join collapsing duplicate right keys to the first row of each run.
    pub fn ordered_join_distinct(
        &self,
        other: &OrderedDataset,
        kind: JoinKind,
    ) -> Result<OrderedDataset> {
        ensure!(
            matches!(kind, JoinKind::Inner | JoinKind::Left),
            "distinct joins support inner and left only"
        );
        self.join_impl(other, kind, true)
    }

    /// The partitioner both join sides align to: the left partitioner,
    /// enlarged over the right's range when the join keeps unmatched right
    /// rows (dropping them at realignment would lose data).
    fn join_partitioner(
        &self,
        other: &OrderedDataset,
        keeps_right: bool,
    ) -> Result<std::sync::Arc<crate::ordered::OrderedPartitioner>> {
        if self.partitioner().num_partitions() == 0 {
            return Ok(other.partitioner().clone());
        }
        if keeps_right {
            if let Some(range) = other.partitioner().range() {
                return Ok(std::sync::Arc::new(self.partitioner().enlarge_to_range(
                    &range,
                    other.partitioner().pk_type(),
                )?));
            }
        }
        Ok(self.partitioner().clone())
    }

    fn join_impl(
        &self,
        other: &OrderedDataset,
        kind: JoinKind,
        distinct: bool,
    ) -> Result<OrderedDataset> {
        let spec = JoinSpec::new(self.typ(), other.typ(), kind)?;
        let base = self.join_partitioner(other, kind.keeps_unmatched_right())?;
        let left = self.constrain_to_partitioner(base.clone())?;
        let right = other.constrain_to_partitioner(base)?;
        let (ltyp, rtyp) = (self.typ().clone(), other.typ().clone());
        let out_typ = spec.out_typ.clone();
        let spec = Rc::new(spec);
        left.zip_partitions_preserving(
            &right,
            out_typ,
            Rc::new(move |_i, left, right| {
                Ok(Box::new(OrderedJoinCursor::new(
                    left,
                    right,
                    ltyp.clone(),
                    rtyp.clone(),
                    spec.clone(),
                    kind,
                    distinct,
                )) as Box<dyn RowCursor>)
            }),
        )
    }

    /// Pairwise outer zip on the key: one output row per key occurrence,
    /// carrying the left and right value structs, either possibly missing.
    /// No cross products; duplicate keys pair positionally.
    pub fn ordered_zip_join(&self, other: &OrderedDataset) -> Result<OrderedDataset> {
        let spec = ZipJoinSpec::new(self.typ(), other.typ())?;
        let base = self.join_partitioner(other, true)?;
        let left = self.constrain_to_partitioner(base.clone())?;
        let aligned = other.constrain_to_partitioner(base)?;
        let (ltyp, rtyp) = (self.typ().clone(), other.typ().clone());
        let out_typ = spec.out_typ.clone();
        let spec = Rc::new(spec);
        left.zip_partitions_preserving(
            &aligned,
            out_typ,
            Rc::new(move |_i, left, right| {
                Ok(Box::new(ZipJoinCursor {
                    left,
                    right,
                    ltyp: ltyp.clone(),
                    rtyp: rtyp.clone(),
                    spec: spec.clone(),
                    left_live: false,
                    right_live: false,
                    primed: false,
                    out_region: Region::new(),
                    out_offset: 0,
                }) as Box<dyn RowCursor>)
            }),
        )
    }
}

fn check_key_compatibility(l: &OrderedKeyedType, r: &OrderedKeyedType) -> Result<()> {
    ensure!(
        l.key().len() == r.key().len() && l.n_partition_key() == r.n_partition_key(),
        "join sides disagree on key structure: {:?} vs {:?}",
        l.key(),
        r.key()
    );
    let (ls, rs) = (l.row_struct(), r.row_struct());
    for (&li, &ri) in l.key_indices().iter().zip(r.key_indices()) {
        let (lt, rt) = (ls.field_type(li), rs.field_type(ri));
        if lt.kind != rt.kind {
            bail!(
                "join key field `{}` has type {} on the left and {} on the right",
                ls.field(li).name,
                lt,
                rt
            );
        }
    }
    Ok(())
}

struct JoinSpec {
    out_typ: OrderedKeyedType,
    out_row: Type,
    left_values: Vec<usize>,
    right_values: Vec<usize>,
}

impl JoinSpec {
    fn new(l: &OrderedKeyedType, r: &OrderedKeyedType, kind: JoinKind) -> Result<Self> {
        check_key_compatibility(l, r)?;
        let (ls, rs) = (l.row_struct(), r.row_struct());
        let mut fields: Vec<Field> = Vec::new();
        for (&li, &ri) in l.key_indices().iter().zip(r.key_indices()) {
            let lf = ls.field(li);
            let required = lf.typ.required && rs.field_type(ri).required;
            fields.push(Field::new(
                lf.name.clone(),
                lf.typ.clone().with_required(required),
            ));
        }
        let left_values = l.value_indices();
        for &i in &left_values {
            let f = ls.field(i);
            let typ = if kind.keeps_unmatched_right() {
                f.typ.clone().optional()
            } else {
                f.typ.clone()
            };
            fields.push(Field::new(f.name.clone(), typ));
        }
        let right_values = r.value_indices();
        for &i in &right_values {
            let f = rs.field(i);
            if fields.iter().any(|existing| existing.name == f.name) {
                bail!(
                    "join output field `{}` appears on both sides; rename before joining",
                    f.name
                );
            }
            let typ = if kind.keeps_unmatched_left() {
                f.typ.clone().optional()
            } else {
                f.typ.clone()
            };
            fields.push(Field::new(f.name.clone(), typ));
        }
        let out_row = Type::struct_(fields).required();
        let out_typ = OrderedKeyedType::new(out_row.clone(), l.key().to_vec(), l.n_partition_key())?;
        Ok(Self {
            out_typ,
            out_row,
            left_values,
            right_values,
        })
    }
}

struct OrderedJoinCursor {
    left: Box<dyn RowCursor>,
    right: Box<dyn RowCursor>,
    ltyp: OrderedKeyedType,
    rtyp: OrderedKeyedType,
    spec: Rc<JoinSpec>,
    kind: JoinKind,
    distinct: bool,
    left_live: bool,
    right_live: bool,
    primed: bool,
    run_key: WritableRegionValue,
    run_region: Region,
    run_offsets: Vec<usize>,
    run_idx: usize,
    crossing: bool,
    out_region: Region,
    out_offset: usize,
}

impl OrderedJoinCursor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        left: Box<dyn RowCursor>,
        right: Box<dyn RowCursor>,
        ltyp: OrderedKeyedType,
        rtyp: OrderedKeyedType,
        spec: Rc<JoinSpec>,
        kind: JoinKind,
        distinct: bool,
    ) -> Self {
        let run_key_type = rtyp.key_type();
        Self {
            left,
            right,
            ltyp,
            rtyp,
            spec,
            kind,
            distinct,
            left_live: false,
            right_live: false,
            primed: false,
            run_key: WritableRegionValue::new(run_key_type),
            run_region: Region::new(),
            run_offsets: Vec::new(),
            run_idx: 0,
            crossing: false,
            out_region: Region::new(),
            out_offset: 0,
        }
    }

    fn compare_heads(&self) -> Ordering {
        let (lr, lo) = self.left.current();
        let (rr, ro) = self.right.current();
        // key field i of each side, compared pairwise
        let ls = self.ltyp.row_struct();
        let rs = self.rtyp.row_struct();
        for (&li, &ri) in self.ltyp.key_indices().iter().zip(self.rtyp.key_indices()) {
            let d1 = view::is_field_defined(ls, lr, lo, li);
            let d2 = view::is_field_defined(rs, rr, ro, ri);
            let c = match (d1, d2) {
                (false, false) => Ordering::Equal,
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (true, true) => crate::vtype::compare_regions(
                    ls.field_type(li),
                    lr,
                    view::load_field(ls, lr, lo, li),
                    rr,
                    view::load_field(rs, rr, ro, ri),
                    true,
                ),
            };
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }

    fn buffer_run(&mut self) -> Result<()> {
        self.run_region.clear();
        self.run_offsets.clear();
        {
            let (region, off) = self.right.current();
            let key_indices = self.rtyp.key_indices().to_vec();
            self.run_key
                .set_select(self.rtyp.row_type(), &key_indices, region, off)?;
        }
        loop {
            if !self.distinct || self.run_offsets.is_empty() {
                let (region, off) = self.right.current();
                let staged = crate::region::copy::copy_root(
                    self.rtyp.row_fund(),
                    region,
                    off,
                    &mut self.run_region,
                );
                self.run_offsets.push(staged);
            }
            self.right_live = self.right.advance()?;
            if !self.right_live {
                break;
            }
            let same = {
                let (region, off) = self.right.current();
                self.rtyp
                    .compare_row_with_key(region, off, self.run_key.region(), self.run_key.offset())
                    .is_eq()
            };
            if !same {
                break;
            }
        }
        Ok(())
    }

    fn left_matches_run(&self) -> bool {
        if !self.run_key.is_present() {
            return false;
        }
        let (region, off) = self.left.current();
        self.ltyp
            .compare_row_with_key(region, off, self.run_key.region(), self.run_key.offset())
            .is_eq()
    }

    fn emit(&mut self, with_left: bool, right: Option<(usize, bool)>) -> Result<()> {
        // right: (offset, from_run); None means the right side is missing
        self.out_region.clear();
        let mut rvb = RegionValueBuilder::new(&mut self.out_region, &self.spec.out_row);
        rvb.start_struct(true)?;

        // keys come from the left row when present, else the right source
        if with_left {
            let (region, off) = self.left.current();
            let ls = self.ltyp.row_struct();
            for &i in self.ltyp.key_indices() {
                add_field(&mut rvb, ls, region, off, i)?;
            }
        } else {
            let (region, off, rs): (&Region, usize, &StructType) = match right {
                Some((roff, true)) => (&self.run_region, roff, self.rtyp.row_struct()),
                _ => {
                    let (r, o) = self.right.current();
                    (r, o, self.rtyp.row_struct())
                }
            };
            for &i in self.rtyp.key_indices() {
                add_field(&mut rvb, rs, region, off, i)?;
            }
        }

        if with_left {
            let (region, off) = self.left.current();
            let ls = self.ltyp.row_struct();
            for &i in &self.spec.left_values {
                add_field(&mut rvb, ls, region, off, i)?;
            }
        } else {
            for _ in &self.spec.left_values {
                rvb.set_missing()?;
            }
        }

        match right {
            Some((roff, from_run)) => {
                let rs = self.rtyp.row_struct();
                if from_run {
                    for &i in &self.spec.right_values {
                        add_field(&mut rvb, rs, &self.run_region, roff, i)?;
                    }
                } else {
                    let (region, off) = self.right.current();
                    for &i in &self.spec.right_values {
                        add_field(&mut rvb, rs, region, off, i)?;
                    }
                }
            }
            None => {
                for _ in &self.spec.right_values {
                    rvb.set_missing()?;
                }
            }
        }

        rvb.end_struct()?;
        self.out_offset = rvb.end()?;
        Ok(())
    }
}

fn add_field(
    rvb: &mut RegionValueBuilder<'_>,
    s: &StructType,
    region: &Region,
    off: usize,
    i: usize,
) -> Result<()> {
    if view::is_field_defined(s, region, off, i) {
        let foff = view::load_field(s, region, off, i);
        rvb.add_region_value(s.field_type(i), region, foff)
    } else {
        rvb.set_missing()
    }
}

impl RowCursor for OrderedJoinCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.primed {
            self.left_live = self.left.advance()?;
            self.right_live = self.right.advance()?;
            self.primed = true;
        }
        loop {
            if self.crossing {
                if self.run_idx < self.run_offsets.len() {
                    let roff = self.run_offsets[self.run_idx];
                    self.run_idx += 1;
                    self.emit(true, Some((roff, true)))?;
                    return Ok(true);
                }
                // current left row exhausted the run
                self.crossing = false;
                self.left_live = self.left.advance()?;
                if self.left_live && self.left_matches_run() {
                    self.crossing = true;
                    self.run_idx = 0;
                    continue;
                }
                self.run_offsets.clear();
                self.run_key.take();
                continue;
            }

            match (self.left_live, self.right_live) {
                (false, false) => return Ok(false),
                (true, right_live) => {
                    let cmp = if right_live {
                        self.compare_heads()
                    } else {
                        Ordering::Less
                    };
                    match cmp {
                        Ordering::Less => {
                            if self.kind.keeps_unmatched_left() {
                                self.emit(true, None)?;
                                self.left_live = self.left.advance()?;
                                return Ok(true);
                            }
                            self.left_live = self.left.advance()?;
                        }
                        Ordering::Greater => {
                            if self.kind.keeps_unmatched_right() {
                                self.emit(false, Some((0, false)))?;
                                self.right_live = self.right.advance()?;
                                return Ok(true);
                            }
                            self.right_live = self.right.advance()?;
                        }
                        Ordering::Equal => {
                            self.buffer_run()?;
                            self.crossing = true;
                            self.run_idx = 0;
                        }
                    }
                }
                (false, true) => {
                    if self.kind.keeps_unmatched_right() {
                        self.emit(false, Some((0, false)))?;
                        self.right_live = self.right.advance()?;
                        return Ok(true);
                    }
                    self.right_live = self.right.advance()?;
                }
            }
        }
    }

    fn current(&self) -> (&Region, usize) {
        (&self.out_region, self.out_offset)
    }
}

struct ZipJoinSpec {
    out_typ: OrderedKeyedType,
    out_row: Type,
    left_values: Vec<usize>,
    right_values: Vec<usize>,
}

impl ZipJoinSpec {
    fn new(l: &OrderedKeyedType, r: &OrderedKeyedType) -> Result<Self> {
        check_key_compatibility(l, r)?;
        let (ls, rs) = (l.row_struct(), r.row_struct());
        let left_values = l.value_indices();
        let right_values = r.value_indices();
        let left_value_struct = Type::struct_(
            left_values.iter().map(|&i| ls.field(i).clone()).collect(),
        );
        let right_value_struct = Type::struct_(
            right_values.iter().map(|&i| rs.field(i).clone()).collect(),
        );
        let mut fields: Vec<Field> = Vec::new();
        for (&li, &ri) in l.key_indices().iter().zip(r.key_indices()) {
            let lf = ls.field(li);
            let required = lf.typ.required && rs.field_type(ri).required;
            fields.push(Field::new(
                lf.name.clone(),
                lf.typ.clone().with_required(required),
            ));
        }
        fields.push(Field::new("left", left_value_struct));
        fields.push(Field::new("right", right_value_struct));
        let out_row = Type::struct_(fields).required();
        let out_typ = OrderedKeyedType::new(out_row.clone(), l.key().to_vec(), l.n_partition_key())?;
        Ok(Self {
            out_typ,
            out_row,
            left_values,
            right_values,
        })
    }
}

struct ZipJoinCursor {
    left: Box<dyn RowCursor>,
    right: Box<dyn RowCursor>,
    ltyp: OrderedKeyedType,
    rtyp: OrderedKeyedType,
    spec: Rc<ZipJoinSpec>,
    left_live: bool,
    right_live: bool,
    primed: bool,
    out_region: Region,
    out_offset: usize,
}

impl ZipJoinCursor {
    fn compare_heads(&self) -> Ordering {
        let (lr, lo) = self.left.current();
        let (rr, ro) = self.right.current();
        let ls = self.ltyp.row_struct();
        let rs = self.rtyp.row_struct();
        for (&li, &ri) in self.ltyp.key_indices().iter().zip(self.rtyp.key_indices()) {
            let d1 = view::is_field_defined(ls, lr, lo, li);
            let d2 = view::is_field_defined(rs, rr, ro, ri);
            let c = match (d1, d2) {
                (false, false) => Ordering::Equal,
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (true, true) => crate::vtype::compare_regions(
                    ls.field_type(li),
                    lr,
                    view::load_field(ls, lr, lo, li),
                    rr,
                    view::load_field(rs, rr, ro, ri),
                    true,
                ),
            };
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }

    fn emit(&mut self, with_left: bool, with_right: bool) -> Result<()> {
        self.out_region.clear();
        let mut rvb = RegionValueBuilder::new(&mut self.out_region, &self.spec.out_row);
        rvb.start_struct(true)?;
        if with_left {
            let (region, off) = self.left.current();
            let ls = self.ltyp.row_struct();
            for &i in self.ltyp.key_indices() {
                add_field(&mut rvb, ls, region, off, i)?;
            }
        } else {
            let (region, off) = self.right.current();
            let rs = self.rtyp.row_struct();
            for &i in self.rtyp.key_indices() {
                add_field(&mut rvb, rs, region, off, i)?;
            }
        }
        if with_left {
            let (region, off) = self.left.current();
            let ls = self.ltyp.row_struct();
            rvb.start_struct(true)?;
            for &i in &self.spec.left_values {
                add_field(&mut rvb, ls, region, off, i)?;
            }
            rvb.end_struct()?;
        } else {
            rvb.set_missing()?;
        }
        if with_right {
            let (region, off) = self.right.current();
            let rs = self.rtyp.row_struct();
            rvb.start_struct(true)?;
            for &i in &self.spec.right_values {
                add_field(&mut rvb, rs, region, off, i)?;
            }
            rvb.end_struct()?;
        } else {
            rvb.set_missing()?;
        }
        rvb.end_struct()?;
        self.out_offset = rvb.end()?;
        Ok(())
    }
}

impl RowCursor for ZipJoinCursor {
    fn advance(&mut self) -> Result<bool> {
        if !self.primed {
            self.left_live = self.left.advance()?;
            self.right_live = self.right.advance()?;
            self.primed = true;
        }
        match (self.left_live, self.right_live) {
            (false, false) => Ok(false),
            (true, false) => {
                self.emit(true, false)?;
                self.left_live = self.left.advance()?;
                Ok(true)
            }
            (false, true) => {
                self.emit(false, true)?;
                self.right_live = self.right.advance()?;
                Ok(true)
            }
            (true, true) => match self.compare_heads() {
                Ordering::Less => {
                    self.emit(true, false)?;
                    self.left_live = self.left.advance()?;
                    Ok(true)
                }
                Ordering::Greater => {
                    self.emit(false, true)?;
                    self.right_live = self.right.advance()?;
                    Ok(true)
                }
                Ordering::Equal => {
                    self.emit(true, true)?;
                    self.left_live = self.left.advance()?;
                    self.right_live = self.right.advance()?;
                    Ok(true)
                }
            },
        }
    }

    fn current(&self) -> (&Region, usize) {
        (&self.out_region, self.out_offset)
    }
}
