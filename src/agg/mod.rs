//! # Aggregator Protocol
//!
//! Each aggregator owns mutable state and exposes the partial-aggregation
//! protocol: a fresh zero state, a per-element `seq_op` invoked from emitted
//! code, a `comb_op` merging another partition's state, and a `result`
//! materialized through the row builder. `comb_op` is associative and
//! commutative for every aggregator here.
//!
//! Values that must outlive the source row's region (collect, take) are
//! deep-copied into a state-owned staging region at `seq_op` time.

use std::any::Any;
use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::ir::emit::Prim;
use crate::region::{copy, Region, RegionValueBuilder};
use crate::vtype::{Annotation, Kind, Type};

/// Aggregation operators applicable to an aggregable element stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    /// Number of elements, missing included.
    Count,
    /// Sum of defined elements; zero over an all-missing stream.
    Sum,
    /// Defined-and-true count over total count; missing over an empty stream.
    Fraction,
    Min,
    Max,
    /// True when any defined element is true; missing elements do not count.
    Exists,
    /// True when every defined element is true.
    Forall,
    /// Defined elements in stream order.
    Collect,
    /// First n elements in stream order, missing included.
    Take,
}

/// Per-aggregator mutable state driven by emitted code.
pub trait RegionAggregator {
    /// In-partition step for one element. `region` is the element's region.
    fn seq_op(&mut self, region: &Region, value: Prim, missing: bool) -> Result<()>;

    /// Merges another partition's state into this one.
    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()>;

    /// Materializes the result, writing containers into `region`.
    fn result(&self, region: &mut Region) -> Result<(bool, Prim)>;

    /// A fresh zero state of the same aggregator.
    fn fresh(&self) -> Box<dyn RegionAggregator>;

    fn as_any(&self) -> &dyn Any;
}

/// Result type of `op` applied to an aggregable of `input` elements.
pub fn result_type(op: AggOp, input: &Type, args: &[Annotation]) -> Result<Type> {
    match op {
        AggOp::Count => Ok(Type::int64().required()),
        AggOp::Sum => match input.kind {
            Kind::Int32 | Kind::Int64 => Ok(Type::int64().required()),
            Kind::Float32 | Kind::Float64 => Ok(Type::float64().required()),
            _ => bail!("sum is not defined for aggregable of {}", input),
        },
        AggOp::Fraction => {
            ensure!(
                matches!(input.kind, Kind::Bool),
                "fraction requires a Bool aggregable, got {}",
                input
            );
            Ok(Type::float64())
        }
        AggOp::Min | AggOp::Max => {
            ensure!(
                input.is_numeric(),
                "min/max is not defined for aggregable of {}",
                input
            );
            Ok(input.clone().optional())
        }
        AggOp::Exists | AggOp::Forall => {
            ensure!(
                matches!(input.kind, Kind::Bool),
                "exists/forall requires a Bool aggregable, got {}",
                input
            );
            Ok(Type::bool().required())
        }
        AggOp::Collect => Ok(Type::array(input.clone().required()).required()),
        AggOp::Take => {
            let n = take_count(args)?;
            let _ = n;
            Ok(Type::array(input.clone()).required())
        }
    }
}

fn take_count(args: &[Annotation]) -> Result<usize> {
    match args {
        [Annotation::Int32(n)] if *n >= 0 => Ok(*n as usize),
        [Annotation::Int32(n)] => bail!("take requires n >= 0, got {}", n),
        other => bail!("take expects one Int32 argument, got {:?}", other),
    }
}

/// Instantiates a zero-state aggregator for `op` over `input` elements.
pub fn create_aggregator(
    op: AggOp,
    input: &Type,
    args: &[Annotation],
) -> Result<Box<dyn RegionAggregator>> {
    if op != AggOp::Take {
        ensure!(
            args.is_empty(),
            "{:?} takes no constructor arguments, got {}",
            op,
            args.len()
        );
    }
    Ok(match op {
        AggOp::Count => Box::new(CountAgg { n: 0 }),
        AggOp::Sum => match input.kind {
            Kind::Int32 | Kind::Int64 => Box::new(SumIntAgg { sum: 0 }),
            Kind::Float32 | Kind::Float64 => Box::new(SumFloatAgg { sum: 0.0 }),
            _ => bail!("sum is not defined for aggregable of {}", input),
        },
        AggOp::Fraction => Box::new(FractionAgg { num: 0, denom: 0 }),
        AggOp::Min => Box::new(MinMaxAgg {
            best: None,
            is_min: true,
        }),
        AggOp::Max => Box::new(MinMaxAgg {
            best: None,
            is_min: false,
        }),
        AggOp::Exists => Box::new(ExistsAgg { found: false }),
        AggOp::Forall => Box::new(ForallAgg { all: true }),
        AggOp::Collect => Box::new(CollectAgg {
            elem: input.clone(),
            buf: Region::new(),
            items: Vec::new(),
        }),
        AggOp::Take => Box::new(TakeAgg {
            n: take_count(args)?,
            elem: input.clone(),
            buf: Region::new(),
            items: Vec::new(),
        }),
    })
}

fn downcast<'a, T: 'static>(other: &'a dyn RegionAggregator) -> Result<&'a T> {
    match other.as_any().downcast_ref::<T>() {
        Some(x) => Ok(x),
        None => bail!("comb_op between different aggregator states"),
    }
}

struct CountAgg {
    n: i64,
}

impl RegionAggregator for CountAgg {
    fn seq_op(&mut self, _region: &Region, _value: Prim, _missing: bool) -> Result<()> {
        self.n += 1;
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        self.n += downcast::<Self>(other)?.n;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        Ok((false, Prim::Int64(self.n)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(CountAgg { n: 0 })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SumIntAgg {
    sum: i64,
}

impl RegionAggregator for SumIntAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        if !missing {
            self.sum += match value {
                Prim::Int32(x) => x as i64,
                Prim::Int64(x) => x,
                other => bail!("sum aggregator fed non-integer {:?}", other),
            };
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        self.sum += downcast::<Self>(other)?.sum;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        Ok((false, Prim::Int64(self.sum)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(SumIntAgg { sum: 0 })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SumFloatAgg {
    sum: f64,
}

impl RegionAggregator for SumFloatAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        if !missing {
            self.sum += match value {
                Prim::Float32(x) => x as f64,
                Prim::Float64(x) => x,
                other => bail!("sum aggregator fed non-float {:?}", other),
            };
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        self.sum += downcast::<Self>(other)?.sum;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        Ok((false, Prim::Float64(self.sum)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(SumFloatAgg { sum: 0.0 })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct FractionAgg {
    num: i64,
    denom: i64,
}

impl RegionAggregator for FractionAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        self.denom += 1;
        if !missing && matches!(value, Prim::Bool(true)) {
            self.num += 1;
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        let o = downcast::<Self>(other)?;
        self.num += o.num;
        self.denom += o.denom;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        if self.denom == 0 {
            Ok((true, Prim::Float64(0.0)))
        } else {
            Ok((false, Prim::Float64(self.num as f64 / self.denom as f64)))
        }
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(FractionAgg { num: 0, denom: 0 })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MinMaxAgg {
    best: Option<Prim>,
    is_min: bool,
}

fn prim_cmp(a: Prim, b: Prim) -> Result<Ordering> {
    Ok(match (a, b) {
        (Prim::Int32(x), Prim::Int32(y)) => x.cmp(&y),
        (Prim::Int64(x), Prim::Int64(y)) => x.cmp(&y),
        (Prim::Float32(x), Prim::Float32(y)) => x.total_cmp(&y),
        (Prim::Float64(x), Prim::Float64(y)) => x.total_cmp(&y),
        (x, y) => bail!("min/max aggregator fed mismatched values {:?} and {:?}", x, y),
    })
}

impl RegionAggregator for MinMaxAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        if missing {
            return Ok(());
        }
        self.best = Some(match self.best {
            None => value,
            Some(best) => {
                let keep_new = match prim_cmp(value, best)? {
                    Ordering::Less => self.is_min,
                    Ordering::Greater => !self.is_min,
                    Ordering::Equal => false,
                };
                if keep_new {
                    value
                } else {
                    best
                }
            }
        });
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        let o = downcast::<Self>(other)?;
        if let Some(v) = o.best {
            self.seq_op(&Region::new(), v, false)?;
        }
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        match self.best {
            Some(v) => Ok((false, v)),
            None => Ok((true, Prim::Bool(false))),
        }
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(MinMaxAgg {
            best: None,
            is_min: self.is_min,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ExistsAgg {
    found: bool,
}

impl RegionAggregator for ExistsAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        if !missing && matches!(value, Prim::Bool(true)) {
            self.found = true;
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        self.found |= downcast::<Self>(other)?.found;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        Ok((false, Prim::Bool(self.found)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(ExistsAgg { found: false })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ForallAgg {
    all: bool,
}

impl RegionAggregator for ForallAgg {
    fn seq_op(&mut self, _region: &Region, value: Prim, missing: bool) -> Result<()> {
        if !missing && matches!(value, Prim::Bool(false)) {
            self.all = false;
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        self.all &= downcast::<Self>(other)?.all;
        Ok(())
    }

    fn result(&self, _region: &mut Region) -> Result<(bool, Prim)> {
        Ok((false, Prim::Bool(self.all)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(ForallAgg { all: true })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Copies an element value into a state-owned staging region, returning the
/// staged value offset.
fn stage_value(buf: &mut Region, elem: &Type, src: &Region, value: Prim) -> usize {
    match value {
        Prim::Offset(off) => {
            let fund = elem.fundamental();
            copy::copy_root(&fund, src, off, buf)
        }
        prim => {
            let off = buf.allocate(elem.alignment(), elem.byte_size());
            match prim {
                Prim::Bool(v) => buf.store_bool(off, v),
                Prim::Int32(v) => buf.store_i32(off, v),
                Prim::Int64(v) => buf.store_i64(off, v),
                Prim::Float32(v) => buf.store_f32(off, v),
                Prim::Float64(v) => buf.store_f64(off, v),
                Prim::Offset(_) => unreachable!(),
            }
            off
        }
    }
}

struct CollectAgg {
    elem: Type,
    buf: Region,
    items: Vec<usize>,
}

impl RegionAggregator for CollectAgg {
    fn seq_op(&mut self, region: &Region, value: Prim, missing: bool) -> Result<()> {
        if !missing {
            let off = stage_value(&mut self.buf, &self.elem, region, value);
            self.items.push(off);
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        let o = downcast::<Self>(other)?;
        for &off in &o.items {
            let staged = stage_value(&mut self.buf, &self.elem, &o.buf, Prim::Offset(off));
            // primitives staged as raw slots come back as offsets too
            self.items.push(staged);
        }
        Ok(())
    }

    fn result(&self, region: &mut Region) -> Result<(bool, Prim)> {
        let array_type = Type::array(self.elem.clone().required());
        let mut rvb = RegionValueBuilder::new(region, &array_type);
        rvb.start_array(self.items.len(), true)?;
        for &off in &self.items {
            rvb.add_region_value(&self.elem, &self.buf, off)?;
        }
        rvb.end_array()?;
        Ok((false, Prim::Offset(rvb.end()?)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(CollectAgg {
            elem: self.elem.clone(),
            buf: Region::new(),
            items: Vec::new(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TakeAgg {
    n: usize,
    elem: Type,
    buf: Region,
    items: Vec<Option<usize>>,
}

impl RegionAggregator for TakeAgg {
    fn seq_op(&mut self, region: &Region, value: Prim, missing: bool) -> Result<()> {
        if self.items.len() < self.n {
            if missing {
                self.items.push(None);
            } else {
                let off = stage_value(&mut self.buf, &self.elem, region, value);
                self.items.push(Some(off));
            }
        }
        Ok(())
    }

    fn comb_op(&mut self, other: &dyn RegionAggregator) -> Result<()> {
        let o = downcast::<Self>(other)?;
        for item in &o.items {
            if self.items.len() == self.n {
                break;
            }
            match item {
                None => self.items.push(None),
                Some(off) => {
                    let staged = stage_value(&mut self.buf, &self.elem, &o.buf, Prim::Offset(*off));
                    self.items.push(Some(staged));
                }
            }
        }
        Ok(())
    }

    fn result(&self, region: &mut Region) -> Result<(bool, Prim)> {
        let array_type = Type::array(self.elem.clone());
        let mut rvb = RegionValueBuilder::new(region, &array_type);
        rvb.start_array(self.items.len(), true)?;
        for item in &self.items {
            match item {
                None => rvb.set_missing()?,
                Some(off) => rvb.add_region_value(&self.elem, &self.buf, *off)?,
            }
        }
        rvb.end_array()?;
        Ok((false, Prim::Offset(rvb.end()?)))
    }

    fn fresh(&self) -> Box<dyn RegionAggregator> {
        Box::new(TakeAgg {
            n: self.n,
            elem: self.elem.clone(),
            buf: Region::new(),
            items: Vec::new(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
