//! # Staged Emission of Row Routines
//!
//! Lowers a typed IR tree into a [`CompiledRoutine`]: a closure tree built
//! once and run per row, reading and writing region values directly. This is
//! the staged rendition of each node's (setup, isMissing, value) triplet:
//! running a node's compiled step performs its setup exactly once and yields
//! the (missing, value) pair.
//!
//! Three invariants hold on every emitted path:
//!
//! 1. **At most one evaluation** - a sub-expression referenced more than
//!    once (let bindings, loop variables) is evaluated into a frame slot and
//!    re-read from there.
//! 2. **Unconditional setup** - a step runs its children before branching on
//!    their missingness.
//! 3. **Missingness gates value** - when a step reports missing, its value
//!    is a type-correct default that callers must not interpret.
//!
//! ## Argument convention
//!
//! A routine has one special argument, the ambient region. User inputs
//! follow as (value, missing) pairs: `In(i)` reads pair i. Aggregation
//! routines additionally carry the aggregator state vector and the ambient
//! aggregable element pair ahead of any scope pairs.
//!
//! ## Failure semantics
//!
//! Fatal conditions in emitted code (index out of bounds, zero range step,
//! range overflow, division by zero) surface as errors carrying a textual
//! message and terminate the row. Missingness never raises; it propagates
//! through the missing channel.

use std::rc::Rc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::agg::{self, RegionAggregator};
use crate::ir::functions::FunctionRegistry;
use crate::ir::{BinaryOp, ComparisonOp, Ir, UnaryOp};
use crate::region::{view, Region};
use crate::vtype::{compare_regions, Annotation, Kind, StructType, Type};

/// An emitted primitive value: what lives in a frame slot or register.
/// Container and string values are carried as offsets into the ambient
/// region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prim {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Offset(usize),
}

impl Prim {
    pub fn as_bool(self) -> bool {
        match self {
            Prim::Bool(v) => v,
            other => panic!("emitted value expected Bool, got {:?}", other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Prim::Int32(v) => v,
            other => panic!("emitted value expected Int32, got {:?}", other),
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Prim::Int64(v) => v,
            other => panic!("emitted value expected Int64, got {:?}", other),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Prim::Float64(v) => v,
            other => panic!("emitted value expected Float64, got {:?}", other),
        }
    }

    pub fn as_offset(self) -> usize {
        match self {
            Prim::Offset(v) => v,
            other => panic!("emitted value expected region offset, got {:?}", other),
        }
    }
}

/// The default written on a missing branch so no step ever observes an
/// uninitialized slot.
pub fn default_prim(t: &Type) -> Prim {
    match &t.kind {
        Kind::Bool => Prim::Bool(false),
        Kind::Int32 | Kind::Call => Prim::Int32(0),
        Kind::Int64 => Prim::Int64(0),
        Kind::Float32 => Prim::Float32(0.0),
        Kind::Float64 => Prim::Float64(0.0),
        _ => Prim::Offset(0),
    }
}

/// Reads the value at `voff` as a register value.
pub fn load_prim(t: &Type, region: &Region, voff: usize) -> Prim {
    match &t.kind {
        Kind::Bool => Prim::Bool(region.load_bool(voff)),
        Kind::Int32 | Kind::Call => Prim::Int32(region.load_i32(voff)),
        Kind::Int64 => Prim::Int64(region.load_i64(voff)),
        Kind::Float32 => Prim::Float32(region.load_f32(voff)),
        Kind::Float64 => Prim::Float64(region.load_f64(voff)),
        _ => Prim::Offset(voff),
    }
}

/// Writes a register value into a slot of type `t` within the same region.
pub fn store_prim(t: &Type, region: &mut Region, slot: usize, v: Prim) {
    match v {
        Prim::Bool(x) => region.store_bool(slot, x),
        Prim::Int32(x) => region.store_i32(slot, x),
        Prim::Int64(x) => region.store_i64(slot, x),
        Prim::Float32(x) => region.store_f32(slot, x),
        Prim::Float64(x) => region.store_f64(slot, x),
        Prim::Offset(off) => {
            if t.is_pointer() {
                region.store_offset(slot, off);
            } else {
                // inline struct value in the same region; nested offset
                // words remain valid
                region.copy_within(off, slot, t.byte_size());
            }
        }
    }
}

/// Per-invocation evaluation state.
pub struct EvalCtx<'a> {
    pub region: &'a mut Region,
    pub args: &'a [(Prim, bool)],
    pub aggs: &'a mut [Box<dyn RegionAggregator>],
    slots: Vec<(bool, Prim)>,
    agg_element: (Prim, bool),
}

type Step = Box<dyn Fn(&mut EvalCtx) -> Result<(bool, Prim)>>;

struct Emitted {
    typ: Type,
    step: Step,
}

/// A compiled row routine: result type plus an executable step.
pub struct CompiledRoutine {
    typ: Type,
    n_slots: usize,
    step: Step,
}

impl CompiledRoutine {
    pub fn typ(&self) -> &Type {
        &self.typ
    }

    /// Runs the routine over one row. `args` are the user input pairs, value
    /// then missing flag.
    pub fn run(&self, region: &mut Region, args: &[(Prim, bool)]) -> Result<(bool, Prim)> {
        let mut ctx = EvalCtx {
            region,
            args,
            aggs: &mut [],
            slots: vec![(true, Prim::Bool(false)); self.n_slots],
            agg_element: (Prim::Bool(false), true),
        };
        (self.step)(&mut ctx)
    }
}

/// A compiled aggregation: per-element sequence steps feeding aggregator
/// states, plus a result routine reading them.
pub struct CompiledAggregation {
    result_type: Type,
    elem_type: Type,
    n_slots: usize,
    prototypes: Vec<Box<dyn RegionAggregator>>,
    seq_steps: Vec<Step>,
    result_step: Step,
}

impl std::fmt::Debug for CompiledAggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledAggregation")
            .field("result_type", &self.result_type)
            .field("elem_type", &self.elem_type)
            .field("n_slots", &self.n_slots)
            .finish_non_exhaustive()
    }
}

impl CompiledAggregation {
    pub fn result_type(&self) -> &Type {
        &self.result_type
    }

    pub fn elem_type(&self) -> &Type {
        &self.elem_type
    }

    /// Fresh zero states, one per aggregator in the expression.
    pub fn new_states(&self) -> Vec<Box<dyn RegionAggregator>> {
        self.prototypes.iter().map(|p| p.fresh()).collect()
    }

    /// The in-partition step: feeds one aggregable element through every
    /// aggregator's sequence code.
    pub fn run_seq(
        &self,
        region: &mut Region,
        states: &mut [Box<dyn RegionAggregator>],
        element: (Prim, bool),
    ) -> Result<()> {
        let mut ctx = EvalCtx {
            region,
            args: &[],
            aggs: states,
            slots: vec![(true, Prim::Bool(false)); self.n_slots],
            agg_element: element,
        };
        for s in &self.seq_steps {
            (s)(&mut ctx)?;
        }
        Ok(())
    }

    /// Evaluates the result expression against combined states.
    pub fn run_result(
        &self,
        region: &mut Region,
        states: &mut [Box<dyn RegionAggregator>],
    ) -> Result<(bool, Prim)> {
        let mut ctx = EvalCtx {
            region,
            args: &[],
            aggs: states,
            slots: vec![(true, Prim::Bool(false)); self.n_slots],
            agg_element: (Prim::Bool(false), true),
        };
        (self.result_step)(&mut ctx)
    }
}

/// Compiles an IR tree into a routine over the given input types.
pub fn compile(registry: &FunctionRegistry, arg_types: &[Type], ir: &Ir) -> Result<CompiledRoutine> {
    let mut e = Emitter::new(registry, arg_types.to_vec(), None);
    let emitted = e.emit(ir)?;
    Ok(CompiledRoutine {
        typ: emitted.typ,
        n_slots: e.n_slots,
        step: emitted.step,
    })
}

/// Compiles an aggregation expression over an aggregable of `elem_type`
/// elements. `AggIn` refers to the ambient element.
pub fn compile_aggregation(
    registry: &FunctionRegistry,
    elem_type: &Type,
    ir: &Ir,
) -> Result<CompiledAggregation> {
    let mut e = Emitter::new(registry, Vec::new(), Some(elem_type.clone()));
    let emitted = e.emit(ir)?;
    let agg = e.agg.take().expect("aggregation context");
    Ok(CompiledAggregation {
        result_type: emitted.typ,
        elem_type: elem_type.clone(),
        n_slots: e.n_slots,
        prototypes: agg.prototypes,
        seq_steps: agg.seq_steps,
        result_step: emitted.step,
    })
}

struct Binding {
    slot: usize,
    typ: Type,
}

struct AggCompile {
    elem_type: Type,
    prototypes: Vec<Box<dyn RegionAggregator>>,
    seq_steps: Vec<Step>,
}

struct Emitter<'f> {
    registry: &'f FunctionRegistry,
    arg_types: Vec<Type>,
    n_slots: usize,
    env: Vec<(String, Binding)>,
    agg: Option<AggCompile>,
    in_agg_space: bool,
    fn_cache: HashMap<String, Rc<crate::ir::functions::FunctionImpl>>,
}

/// Element stream protocol shared by array comprehensions and aggregator
/// emission: the emitter drives a sink once per produced element.
trait ArraySink {
    /// Called once per emission when the source is defined, before any
    /// element, with the length when statically derivable.
    fn start(&mut self, ctx: &mut EvalCtx, known_len: Option<usize>) -> Result<()>;
    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, value: Prim) -> Result<()>;
}

type EmitFn = Box<dyn Fn(&mut EvalCtx, &mut dyn ArraySink) -> Result<bool>>;

/// The array-iterator triplet: element type plus a driver that streams
/// elements into a sink, reporting whether the source itself was missing.
struct ArrayEmitter {
    elem: Type,
    emit: EmitFn,
}

impl<'f> Emitter<'f> {
    fn new(registry: &'f FunctionRegistry, arg_types: Vec<Type>, agg_elem: Option<Type>) -> Self {
        Self {
            registry,
            arg_types,
            n_slots: 0,
            env: Vec::new(),
            agg: agg_elem.map(|elem_type| AggCompile {
                elem_type,
                prototypes: Vec::new(),
                seq_steps: Vec::new(),
            }),
            in_agg_space: false,
            fn_cache: HashMap::new(),
        }
    }

    fn new_slot(&mut self) -> usize {
        let s = self.n_slots;
        self.n_slots += 1;
        s
    }

    fn lookup(&self, name: &str) -> Result<&Binding> {
        self.env
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
            .ok_or_else(|| eyre::eyre!("undefined variable `{}`", name))
    }

    fn with_binding<T>(
        &mut self,
        name: &str,
        binding: Binding,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.env.push((name.to_string(), binding));
        let r = f(self);
        self.env.pop();
        r
    }

    fn emit(&mut self, ir: &Ir) -> Result<Emitted> {
        match ir {
            Ir::True => Ok(literal(Type::bool().required(), Prim::Bool(true))),
            Ir::False => Ok(literal(Type::bool().required(), Prim::Bool(false))),
            Ir::I32(v) => Ok(literal(Type::int32().required(), Prim::Int32(*v))),
            Ir::I64(v) => Ok(literal(Type::int64().required(), Prim::Int64(*v))),
            Ir::F32(v) => Ok(literal(Type::float32().required(), Prim::Float32(*v))),
            Ir::F64(v) => Ok(literal(Type::float64().required(), Prim::Float64(*v))),
            Ir::StrLit(s) => {
                let s = s.to_string();
                Ok(Emitted {
                    typ: Type::str().required(),
                    step: Box::new(move |ctx| {
                        let off = ctx.region.allocate(4, 4 + s.len());
                        ctx.region.store_i32(off, s.len() as i32);
                        ctx.region.store_bytes(off + 4, s.as_bytes());
                        Ok((false, Prim::Offset(off)))
                    }),
                })
            }
            Ir::NA(t) => {
                let typ = t.clone().optional();
                let d = default_prim(&typ);
                Ok(Emitted {
                    typ,
                    step: Box::new(move |_| Ok((true, d))),
                })
            }
            Ir::IsNA(x) => {
                let x = self.emit(x)?;
                Ok(Emitted {
                    typ: Type::bool().required(),
                    step: Box::new(move |ctx| {
                        let (m, _) = (x.step)(ctx)?;
                        Ok((false, Prim::Bool(m)))
                    }),
                })
            }
            Ir::If { cond, cnsq, altr } => {
                let cond = self.emit(cond)?;
                ensure!(
                    matches!(cond.typ.kind, Kind::Bool),
                    "if condition must be Bool, got {}",
                    cond.typ
                );
                let cnsq = self.emit(cnsq)?;
                let altr = self.emit(altr)?;
                let typ = cnsq
                    .typ
                    .unify(&altr.typ)?
                    .with_required(cond.typ.required && cnsq.typ.required && altr.typ.required);
                let d = default_prim(&typ);
                Ok(Emitted {
                    typ,
                    step: Box::new(move |ctx| {
                        let (cm, cv) = (cond.step)(ctx)?;
                        if cm {
                            return Ok((true, d));
                        }
                        if cv.as_bool() {
                            (cnsq.step)(ctx)
                        } else {
                            (altr.step)(ctx)
                        }
                    }),
                })
            }
            Ir::Let { name, value, body } => {
                let value = self.emit(value)?;
                let slot = self.new_slot();
                let body = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: value.typ.clone(),
                    },
                    |e| e.emit(body),
                )?;
                Ok(Emitted {
                    typ: body.typ,
                    step: Box::new(move |ctx| {
                        let (m, v) = (value.step)(ctx)?;
                        ctx.slots[slot] = (m, v);
                        (body.step)(ctx)
                    }),
                })
            }
            Ir::MapNA { name, value, body } => {
                let value = self.emit(value)?;
                let slot = self.new_slot();
                let body = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: value.typ.clone().required(),
                    },
                    |e| e.emit(body),
                )?;
                let typ = body
                    .typ
                    .clone()
                    .with_required(body.typ.required && value.typ.required);
                let d = default_prim(&typ);
                Ok(Emitted {
                    typ,
                    step: Box::new(move |ctx| {
                        let (m, v) = (value.step)(ctx)?;
                        if m {
                            return Ok((true, d));
                        }
                        ctx.slots[slot] = (false, v);
                        (body.step)(ctx)
                    }),
                })
            }
            Ir::Ref(name) => {
                let b = self.lookup(name)?;
                let slot = b.slot;
                Ok(Emitted {
                    typ: b.typ.clone(),
                    step: Box::new(move |ctx| Ok(ctx.slots[slot])),
                })
            }
            Ir::In(i) => {
                ensure!(
                    !self.in_agg_space,
                    "input references are not allowed inside an aggregator"
                );
                ensure!(
                    *i < self.arg_types.len(),
                    "input slot {} out of range; routine has {} inputs",
                    i,
                    self.arg_types.len()
                );
                let typ = self.arg_types[*i].clone();
                let i = *i;
                Ok(Emitted {
                    typ,
                    step: Box::new(move |ctx| {
                        let (v, m) = ctx.args[i];
                        Ok((m, v))
                    }),
                })
            }
            Ir::ApplyBinaryPrimOp { op, l, r } => self.emit_binary(*op, l, r),
            Ir::ApplyComparisonOp { op, l, r } => self.emit_comparison(*op, l, r),
            Ir::ApplyUnaryPrimOp { op, x } => self.emit_unary(*op, x),
            Ir::ArrayLen(a) => {
                let a = self.emit(a)?;
                ensure!(
                    matches!(a.typ.kind, Kind::Array(_)),
                    "length of non-array type {}",
                    a.typ
                );
                let required = a.typ.required;
                Ok(Emitted {
                    typ: Type::int32().with_required(required),
                    step: Box::new(move |ctx| {
                        let (m, v) = (a.step)(ctx)?;
                        if m {
                            return Ok((true, Prim::Int32(0)));
                        }
                        let len = view::load_length(ctx.region, v.as_offset());
                        Ok((false, Prim::Int32(len as i32)))
                    }),
                })
            }
            Ir::ArrayRef { a, i } => self.emit_array_ref(a, i),
            Ir::MakeArray { .. }
            | Ir::ArrayRange { .. }
            | Ir::ArrayMap { .. }
            | Ir::ArrayFilter { .. }
            | Ir::ArrayFlatMap { .. } => {
                let ae = self.emit_array_stream(ir)?;
                let typ = Type::array(ae.elem.clone()).with_required(self.array_node_required(ir)?);
                Ok(materialize_array(typ, ae))
            }
            Ir::ArrayFold { .. } => self.emit_fold(ir),
            Ir::MakeStruct(fields) => {
                let mut emitted = Vec::with_capacity(fields.len());
                for (name, v) in fields {
                    emitted.push((name.to_string(), self.emit(v)?));
                }
                let typ = Type::struct_(
                    emitted
                        .iter()
                        .map(|(n, e)| crate::vtype::Field::new(n.clone(), e.typ.clone()))
                        .collect(),
                )
                .required();
                let steps: Vec<(Type, Step)> =
                    emitted.into_iter().map(|(_, e)| (e.typ, e.step)).collect();
                Ok(emit_struct_constructor(typ, steps))
            }
            Ir::MakeTuple(values) => {
                let mut emitted = Vec::with_capacity(values.len());
                for v in values {
                    emitted.push(self.emit(v)?);
                }
                let typ = Type::tuple(emitted.iter().map(|e| e.typ.clone()).collect()).required();
                let steps: Vec<(Type, Step)> =
                    emitted.into_iter().map(|e| (e.typ, e.step)).collect();
                Ok(emit_struct_constructor(typ, steps))
            }
            Ir::InsertFields { old, fields } => self.emit_insert_fields(old, fields),
            Ir::GetField { o, name } => {
                let o = self.emit(o)?;
                let s = match o.typ.as_struct() {
                    Some(s) => s.clone(),
                    None => bail!("cannot get field `{}` of non-struct type {}", name, o.typ),
                };
                let idx = match s.field_index(name) {
                    Some(i) => i,
                    None => bail!("type {} has no field `{}`", o.typ, name),
                };
                self.emit_field_load(o, s, idx)
            }
            Ir::GetTupleElement { o, idx } => {
                let o = self.emit(o)?;
                let s = match (&o.typ.kind, o.typ.as_struct()) {
                    (Kind::Tuple(_), Some(s)) => s.clone(),
                    _ => bail!("cannot index non-tuple type {}", o.typ),
                };
                ensure!(
                    *idx < s.n_fields(),
                    "tuple index {} out of range for {}",
                    idx,
                    o.typ
                );
                self.emit_field_load(o, s, *idx)
            }
            Ir::Apply { function, args } => self.emit_apply(function, args),
            Ir::AggIn | Ir::AggMap { .. } | Ir::AggFilter { .. } | Ir::AggFlatMap { .. } => {
                bail!("aggregable expression outside an aggregation op")
            }
            Ir::ApplyAggOp { a, op, args } => self.emit_apply_agg_op(a, *op, args),
        }
    }

    fn emit_binary(&mut self, op: BinaryOp, l: &Ir, r: &Ir) -> Result<Emitted> {
        let l = self.emit(l)?;
        let r = self.emit(r)?;
        let typ = l.typ.unify(&r.typ)?;
        ensure!(
            typ.is_numeric(),
            "arithmetic on non-numeric type {}",
            typ
        );
        let d = default_prim(&typ);
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (lm, lv) = (l.step)(ctx)?;
                let (rm, rv) = (r.step)(ctx)?;
                if lm || rm {
                    return Ok((true, d));
                }
                Ok((false, apply_binary(op, lv, rv)?))
            }),
        })
    }

    fn emit_comparison(&mut self, op: ComparisonOp, l: &Ir, r: &Ir) -> Result<Emitted> {
        let l = self.emit(l)?;
        let r = self.emit(r)?;
        let operand = l.typ.unify(&r.typ)?;
        let typ = Type::bool().with_required(l.typ.required && r.typ.required);
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (lm, lv) = (l.step)(ctx)?;
                let (rm, rv) = (r.step)(ctx)?;
                if lm || rm {
                    return Ok((true, Prim::Bool(false)));
                }
                let ord = compare_prims(&operand, ctx.region, lv, rv)?;
                let b = match op {
                    ComparisonOp::Eq => ord.is_eq(),
                    ComparisonOp::NotEq => ord.is_ne(),
                    ComparisonOp::Lt => ord.is_lt(),
                    ComparisonOp::LtEq => ord.is_le(),
                    ComparisonOp::Gt => ord.is_gt(),
                    ComparisonOp::GtEq => ord.is_ge(),
                };
                Ok((false, Prim::Bool(b)))
            }),
        })
    }

    fn emit_unary(&mut self, op: UnaryOp, x: &Ir) -> Result<Emitted> {
        let x = self.emit(x)?;
        match op {
            UnaryOp::Negate => ensure!(x.typ.is_numeric(), "negation of non-numeric {}", x.typ),
            UnaryOp::Not => ensure!(
                matches!(x.typ.kind, Kind::Bool),
                "logical not of non-Bool {}",
                x.typ
            ),
        }
        let typ = x.typ.clone();
        let d = default_prim(&typ);
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (m, v) = (x.step)(ctx)?;
                if m {
                    return Ok((true, d));
                }
                let out = match (op, v) {
                    (UnaryOp::Not, Prim::Bool(b)) => Prim::Bool(!b),
                    (UnaryOp::Negate, Prim::Int32(a)) => Prim::Int32(a.wrapping_neg()),
                    (UnaryOp::Negate, Prim::Int64(a)) => Prim::Int64(a.wrapping_neg()),
                    (UnaryOp::Negate, Prim::Float32(a)) => Prim::Float32(-a),
                    (UnaryOp::Negate, Prim::Float64(a)) => Prim::Float64(-a),
                    (_, v) => panic!("unary op on unexpected value {:?}", v),
                };
                Ok((false, out))
            }),
        })
    }

    fn emit_array_ref(&mut self, a: &Ir, i: &Ir) -> Result<Emitted> {
        let a = self.emit(a)?;
        let i = self.emit(i)?;
        let elem = match &a.typ.kind {
            Kind::Array(e) => (**e).clone(),
            _ => bail!("indexing non-array type {}", a.typ),
        };
        ensure!(
            matches!(i.typ.kind, Kind::Int32),
            "array index must be Int32, got {}",
            i.typ
        );
        let typ = elem
            .clone()
            .with_required(elem.required && a.typ.required && i.typ.required);
        let d = default_prim(&typ);
        let array_type = a.typ.clone();
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (am, av) = (a.step)(ctx)?;
                let (im, iv) = (i.step)(ctx)?;
                if am || im {
                    return Ok((true, d));
                }
                let aoff = av.as_offset();
                let idx = iv.as_i32();
                let len = view::load_length(ctx.region, aoff);
                if idx < 0 || idx as usize >= len {
                    bail!("array index out of bounds: {} of {}", idx, len);
                }
                let idx = idx as usize;
                if !view::is_element_defined(&array_type, ctx.region, aoff, idx) {
                    return Ok((true, d));
                }
                let voff = view::load_element(&array_type, ctx.region, aoff, len, idx);
                Ok((false, load_prim(&elem, ctx.region, voff)))
            }),
        })
    }

    /// Requiredness of the array value produced by an array-stream node.
    fn array_node_required(&mut self, ir: &Ir) -> Result<bool> {
        Ok(match ir {
            Ir::MakeArray { .. } => true,
            Ir::ArrayRange { .. } => true,
            Ir::ArrayMap { a, .. } | Ir::ArrayFilter { a, .. } | Ir::ArrayFlatMap { a, .. } => {
                // missing source yields a missing result; requiredness is
                // settled during the stream emission below, recompute
                // conservatively here
                matches!(
                    self.peek_required(a),
                    Some(true)
                )
            }
            _ => false,
        })
    }

    // Cheap requiredness peek for stream sources; `None` when it cannot be
    // settled without a full emit.
    fn peek_required(&self, ir: &Ir) -> Option<bool> {
        match ir {
            Ir::NA(_) => Some(false),
            Ir::In(i) => self.arg_types.get(*i).map(|t| t.required),
            Ir::Ref(name) => self.lookup(name).ok().map(|b| b.typ.required),
            Ir::MakeArray { .. } | Ir::ArrayRange { .. } => Some(true),
            Ir::ArrayMap { a, .. } | Ir::ArrayFilter { a, .. } | Ir::ArrayFlatMap { a, .. } => {
                self.peek_required(a)
            }
            _ => None,
        }
    }

    /// Emits an array-producing node as a streaming iterator.
    fn emit_array_stream(&mut self, ir: &Ir) -> Result<ArrayEmitter> {
        match ir {
            Ir::MakeArray { args, elem_hint } => {
                let mut steps = Vec::with_capacity(args.len());
                let mut elem: Option<Type> = elem_hint.clone();
                for a in args {
                    let e = self.emit(a)?;
                    elem = Some(match elem {
                        None => e.typ.clone(),
                        Some(t) => t.unify(&e.typ)?,
                    });
                    steps.push(e.step);
                }
                let elem = match elem {
                    Some(t) => t,
                    None => bail!("cannot infer element type of an empty array literal"),
                };
                Ok(ArrayEmitter {
                    elem,
                    emit: Box::new(move |ctx, sink| {
                        sink.start(ctx, Some(steps.len()))?;
                        for s in &steps {
                            let (m, v) = (s)(ctx)?;
                            sink.element(ctx, m, v)?;
                        }
                        Ok(false)
                    }),
                })
            }
            Ir::ArrayRange { start, stop, step } => {
                let start = self.emit_typed(start, &Kind::Int32, "range start")?;
                let stop = self.emit_typed(stop, &Kind::Int32, "range stop")?;
                let step = self.emit_typed(step, &Kind::Int32, "range step")?;
                Ok(ArrayEmitter {
                    elem: Type::int32().required(),
                    emit: Box::new(move |ctx, sink| {
                        let (ms, vs) = (start.step)(ctx)?;
                        let (mp, vp) = (stop.step)(ctx)?;
                        let (mt, vt) = (step.step)(ctx)?;
                        if ms || mp || mt {
                            return Ok(true);
                        }
                        let (lo, hi, st) = (vs.as_i32(), vp.as_i32(), vt.as_i32());
                        if st == 0 {
                            bail!("array range cannot have step size 0");
                        }
                        let len = range_length(lo, hi, st)?;
                        sink.start(ctx, Some(len))?;
                        let mut x = lo;
                        for _ in 0..len {
                            sink.element(ctx, false, Prim::Int32(x))?;
                            x = x.wrapping_add(st);
                        }
                        Ok(false)
                    }),
                })
            }
            Ir::ArrayMap { a, name, body } => {
                let src = self.emit_array_stream(a)?;
                let slot = self.new_slot();
                let body = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit(body),
                )?;
                let body_step = Rc::new(body.step);
                Ok(ArrayEmitter {
                    elem: body.typ,
                    emit: Box::new(move |ctx, sink| {
                        let mut map_sink = MapSink {
                            inner: sink,
                            body: &body_step,
                            slot,
                        };
                        (src.emit)(ctx, &mut map_sink)
                    }),
                })
            }
            Ir::ArrayFilter { a, name, body } => {
                let src = self.emit_array_stream(a)?;
                let slot = self.new_slot();
                let pred = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit(body),
                )?;
                ensure!(
                    matches!(pred.typ.kind, Kind::Bool),
                    "filter predicate must be Bool, got {}",
                    pred.typ
                );
                let pred_step = Rc::new(pred.step);
                Ok(ArrayEmitter {
                    elem: src.elem.clone(),
                    emit: Box::new(move |ctx, sink| {
                        let mut filter_sink = FilterSink {
                            inner: sink,
                            pred: &pred_step,
                            slot,
                        };
                        (src.emit)(ctx, &mut filter_sink)
                    }),
                })
            }
            Ir::ArrayFlatMap { a, name, body } => {
                let src = self.emit_array_stream(a)?;
                let slot = self.new_slot();
                let inner = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit_array_stream(body),
                )?;
                let inner_emit = Rc::new(inner.emit);
                Ok(ArrayEmitter {
                    elem: inner.elem,
                    emit: Box::new(move |ctx, sink| {
                        let mut fm_sink = FlatMapSink {
                            inner: sink,
                            body: &inner_emit,
                            slot,
                        };
                        (src.emit)(ctx, &mut fm_sink)
                    }),
                })
            }
            // any other array-typed expression: materialize, then stream
            other => {
                let e = self.emit(other)?;
                let elem = match &e.typ.kind {
                    Kind::Array(el) => (**el).clone(),
                    _ => bail!("expected an array expression, got {}", e.typ),
                };
                let array_type = e.typ.clone();
                let elem2 = elem.clone();
                Ok(ArrayEmitter {
                    elem,
                    emit: Box::new(move |ctx, sink| {
                        let (m, v) = (e.step)(ctx)?;
                        if m {
                            return Ok(true);
                        }
                        let aoff = v.as_offset();
                        let len = view::load_length(ctx.region, aoff);
                        sink.start(ctx, Some(len))?;
                        for i in 0..len {
                            let (miss, prim) = {
                                let r = &*ctx.region;
                                if view::is_element_defined(&array_type, r, aoff, i) {
                                    let voff = view::load_element(&array_type, r, aoff, len, i);
                                    (false, load_prim(&elem2, r, voff))
                                } else {
                                    (true, default_prim(&elem2))
                                }
                            };
                            sink.element(ctx, miss, prim)?;
                        }
                        Ok(false)
                    }),
                })
            }
        }
    }

    fn emit_typed(&mut self, ir: &Ir, kind: &Kind, what: &str) -> Result<Emitted> {
        let e = self.emit(ir)?;
        ensure!(
            e.typ.kind == *kind,
            "{} must be {:?}, got {}",
            what,
            kind,
            e.typ
        );
        Ok(e)
    }

    fn emit_fold(&mut self, ir: &Ir) -> Result<Emitted> {
        let Ir::ArrayFold {
            a,
            zero,
            acc_name,
            elt_name,
            body,
        } = ir
        else {
            unreachable!()
        };
        let src = self.emit_array_stream(a)?;
        let zero = self.emit(zero)?;
        let acc_slot = self.new_slot();
        let elt_slot = self.new_slot();
        let acc_typ = zero.typ.clone().optional();
        let body = self.with_binding(
            acc_name,
            Binding {
                slot: acc_slot,
                typ: acc_typ,
            },
            |e| {
                let elt = Binding {
                    slot: elt_slot,
                    typ: src.elem.clone(),
                };
                e.with_binding(elt_name, elt, |e| e.emit(body))
            },
        )?;
        let typ = zero.typ.unify(&body.typ)?.optional();
        let d = default_prim(&typ);
        let body_step = Rc::new(body.step);
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (zm, zv) = (zero.step)(ctx)?;
                ctx.slots[acc_slot] = (zm, zv);
                let mut sink = FoldSink {
                    body: &body_step,
                    acc_slot,
                    elt_slot,
                };
                let missing = (src.emit)(ctx, &mut sink)?;
                if missing {
                    return Ok((true, d));
                }
                Ok(ctx.slots[acc_slot])
            }),
        })
    }

    fn emit_field_load(&mut self, o: Emitted, s: StructType, idx: usize) -> Result<Emitted> {
        let field_typ = s.field_type(idx).clone();
        let typ = field_typ
            .clone()
            .with_required(field_typ.required && o.typ.required);
        let d = default_prim(&typ);
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (m, v) = (o.step)(ctx)?;
                if m {
                    return Ok((true, d));
                }
                let off = v.as_offset();
                if !view::is_field_defined(&s, ctx.region, off, idx) {
                    return Ok((true, d));
                }
                let voff = view::load_field(&s, ctx.region, off, idx);
                Ok((false, load_prim(&field_typ, ctx.region, voff)))
            }),
        })
    }

    fn emit_insert_fields(&mut self, old: &Ir, fields: &[(&str, &Ir)]) -> Result<Emitted> {
        let old = self.emit(old)?;
        let old_struct = match old.typ.as_struct() {
            Some(s) => s.clone(),
            None => bail!("insert_fields on non-struct type {}", old.typ),
        };

        let mut new_emitted: Vec<(String, Emitted)> = Vec::with_capacity(fields.len());
        for (name, v) in fields {
            new_emitted.push((name.to_string(), self.emit(v)?));
        }

        // result keeps old field order; overrides replace in place, fresh
        // fields append
        let mut result_fields: Vec<crate::vtype::Field> = old_struct.fields().to_vec();
        let mut sources: Vec<FieldSource> = (0..old_struct.n_fields()).map(FieldSource::Old).collect();
        for (i, (name, e)) in new_emitted.iter().enumerate() {
            match old_struct.field_index(name) {
                Some(idx) => {
                    result_fields[idx] = crate::vtype::Field::new(name.clone(), e.typ.clone());
                    sources[idx] = FieldSource::New(i);
                }
                None => {
                    result_fields.push(crate::vtype::Field::new(name.clone(), e.typ.clone()));
                    sources.push(FieldSource::New(i));
                }
            }
        }
        let typ = Type::struct_(result_fields).with_required(old.typ.required);
        let result_struct = typ.as_struct().expect("struct type").clone();
        let d = default_prim(&typ);
        let new_steps: Vec<(Type, Step)> = new_emitted
            .into_iter()
            .map(|(_, e)| (e.typ, e.step))
            .collect();

        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let (om, ov) = (old.step)(ctx)?;
                let mut new_values = Vec::with_capacity(new_steps.len());
                for (_, s) in &new_steps {
                    new_values.push((s)(ctx)?);
                }
                if om {
                    return Ok((true, d));
                }
                let old_off = ov.as_offset();
                let block = ctx
                    .region
                    .allocate(result_struct.alignment(), result_struct.byte_size());
                for (i, src) in sources.iter().enumerate() {
                    let (m, v, ft) = match src {
                        FieldSource::New(j) => {
                            let (m, v) = new_values[*j];
                            (m, v, &new_steps[*j].0)
                        }
                        FieldSource::Old(j) => {
                            let r = &*ctx.region;
                            let ft = old_struct.field_type(*j);
                            if view::is_field_defined(&old_struct, r, old_off, *j) {
                                let voff = view::load_field(&old_struct, r, old_off, *j);
                                (false, load_prim(ft, r, voff), ft)
                            } else {
                                (true, default_prim(ft), ft)
                            }
                        }
                    };
                    write_struct_field(&result_struct, ctx.region, block, i, ft, m, v)?;
                }
                Ok((false, Prim::Offset(block)))
            }),
        })
    }

    fn emit_apply(&mut self, function: &str, args: &[&Ir]) -> Result<Emitted> {
        ensure!(
            !self.in_agg_space,
            "function applications are not allowed inside an aggregator"
        );
        let mut emitted = Vec::with_capacity(args.len());
        for a in args {
            emitted.push(self.emit(a)?);
        }
        let actual: Vec<Type> = emitted.iter().map(|e| e.typ.clone()).collect();
        let key = format!(
            "{}({})",
            function,
            actual
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let imp = match self.fn_cache.get(&key) {
            Some(imp) => imp.clone(),
            None => {
                let imp = self.registry.resolve(function, &actual)?;
                self.fn_cache.insert(key, imp.clone());
                imp
            }
        };
        let typ = imp.ret_type.clone();
        let steps: Vec<Step> = emitted.into_iter().map(|e| e.step).collect();
        Ok(Emitted {
            typ,
            step: Box::new(move |ctx| {
                let mut vals = Vec::with_capacity(steps.len());
                for s in &steps {
                    vals.push((s)(ctx)?);
                }
                (imp.f)(ctx, &vals)
            }),
        })
    }

    /// Emits an aggregator-space expression as an element stream.
    fn emit_agg_stream(&mut self, ir: &Ir) -> Result<ArrayEmitter> {
        match ir {
            Ir::AggIn => {
                let elem = self
                    .agg
                    .as_ref()
                    .expect("aggregation context")
                    .elem_type
                    .clone();
                Ok(ArrayEmitter {
                    elem,
                    emit: Box::new(|ctx, sink| {
                        sink.start(ctx, None)?;
                        let (v, m) = ctx.agg_element;
                        sink.element(ctx, m, v)?;
                        Ok(false)
                    }),
                })
            }
            Ir::AggMap { a, name, body } => {
                let src = self.emit_agg_stream(a)?;
                let slot = self.new_slot();
                let body = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit(body),
                )?;
                let body_step = Rc::new(body.step);
                Ok(ArrayEmitter {
                    elem: body.typ,
                    emit: Box::new(move |ctx, sink| {
                        let mut map_sink = MapSink {
                            inner: sink,
                            body: &body_step,
                            slot,
                        };
                        (src.emit)(ctx, &mut map_sink)
                    }),
                })
            }
            Ir::AggFilter { a, name, body } => {
                let src = self.emit_agg_stream(a)?;
                let slot = self.new_slot();
                let pred = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit(body),
                )?;
                ensure!(
                    matches!(pred.typ.kind, Kind::Bool),
                    "aggregator filter predicate must be Bool, got {}",
                    pred.typ
                );
                let pred_step = Rc::new(pred.step);
                Ok(ArrayEmitter {
                    elem: src.elem.clone(),
                    emit: Box::new(move |ctx, sink| {
                        let mut filter_sink = FilterSink {
                            inner: sink,
                            pred: &pred_step,
                            slot,
                        };
                        (src.emit)(ctx, &mut filter_sink)
                    }),
                })
            }
            Ir::AggFlatMap { a, name, body } => {
                let src = self.emit_agg_stream(a)?;
                let slot = self.new_slot();
                let inner = self.with_binding(
                    name,
                    Binding {
                        slot,
                        typ: src.elem.clone(),
                    },
                    |e| e.emit_array_stream(body),
                )?;
                let inner_emit = Rc::new(inner.emit);
                Ok(ArrayEmitter {
                    elem: inner.elem,
                    emit: Box::new(move |ctx, sink| {
                        let mut fm_sink = FlatMapSink {
                            inner: sink,
                            body: &inner_emit,
                            slot,
                        };
                        (src.emit)(ctx, &mut fm_sink)
                    }),
                })
            }
            Ir::ApplyAggOp { .. } => bail!("nested aggregations are not supported"),
            other => bail!(
                "expression {:?} is not an aggregable; expected AggIn / AggMap / AggFilter / AggFlatMap",
                std::mem::discriminant(other)
            ),
        }
    }

    fn emit_apply_agg_op(&mut self, a: &Ir, op: agg::AggOp, args: &[&Ir]) -> Result<Emitted> {
        ensure!(
            self.agg.is_some(),
            "aggregation op used outside an aggregation expression"
        );
        ensure!(!self.in_agg_space, "nested aggregations are not supported");

        self.in_agg_space = true;
        let stream = self.emit_agg_stream(a);
        self.in_agg_space = false;
        let stream = stream?;

        // constructor arguments must be computable at compile time
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            let routine = compile(self.registry, &[], arg)?;
            let mut scratch = Region::new();
            let (m, v) = routine.run(&mut scratch, &[])?;
            ensure!(!m, "aggregator constructor argument may not be missing");
            arg_values.push(prim_to_annotation(routine.typ(), &scratch, v));
        }

        let input = stream.elem.clone();
        let result_type = agg::result_type(op, &input, &arg_values)?;
        let prototype = agg::create_aggregator(op, &input, &arg_values)?;

        let agg_ctx = self.agg.as_mut().expect("aggregation context");
        let idx = agg_ctx.prototypes.len();
        agg_ctx.prototypes.push(prototype);
        agg_ctx.seq_steps.push(Box::new(move |ctx| {
            let mut sink = AggSink { idx };
            (stream.emit)(ctx, &mut sink)?;
            Ok((false, Prim::Bool(false)))
        }));

        Ok(Emitted {
            typ: result_type,
            step: Box::new(move |ctx| {
                let EvalCtx { region, aggs, .. } = ctx;
                aggs[idx].result(region)
            }),
        })
    }
}

enum FieldSource {
    Old(usize),
    New(usize),
}

fn literal(typ: Type, v: Prim) -> Emitted {
    Emitted {
        typ,
        step: Box::new(move |_| Ok((false, v))),
    }
}

fn range_length(start: i32, stop: i32, step: i32) -> Result<usize> {
    let diff = stop as i64 - start as i64;
    let st = step as i64;
    let q = diff / st;
    let r = diff % st;
    let ceil = q + if r != 0 && (r < 0) == (st < 0) { 1 } else { 0 };
    let len = ceil.max(0);
    ensure!(
        len <= i32::MAX as i64,
        "array range would have {} elements; the maximum is {}",
        len,
        i32::MAX
    );
    Ok(len as usize)
}

fn apply_binary(op: BinaryOp, l: Prim, r: Prim) -> Result<Prim> {
    use BinaryOp::*;
    Ok(match (l, r) {
        (Prim::Int32(a), Prim::Int32(b)) => Prim::Int32(match op {
            Add => a.wrapping_add(b),
            Subtract => a.wrapping_sub(b),
            Multiply => a.wrapping_mul(b),
            Divide => {
                ensure!(b != 0, "division by zero");
                a.wrapping_div(b)
            }
            FloorDivide => {
                ensure!(b != 0, "division by zero");
                floor_div_i64(a as i64, b as i64) as i32
            }
            Remainder => {
                ensure!(b != 0, "remainder by zero");
                a.wrapping_rem(b)
            }
        }),
        (Prim::Int64(a), Prim::Int64(b)) => Prim::Int64(match op {
            Add => a.wrapping_add(b),
            Subtract => a.wrapping_sub(b),
            Multiply => a.wrapping_mul(b),
            Divide => {
                ensure!(b != 0, "division by zero");
                a.wrapping_div(b)
            }
            FloorDivide => {
                ensure!(b != 0, "division by zero");
                floor_div_i64(a, b)
            }
            Remainder => {
                ensure!(b != 0, "remainder by zero");
                a.wrapping_rem(b)
            }
        }),
        (Prim::Float32(a), Prim::Float32(b)) => Prim::Float32(match op {
            Add => a + b,
            Subtract => a - b,
            Multiply => a * b,
            Divide => a / b,
            FloorDivide => (a / b).floor(),
            Remainder => a % b,
        }),
        (Prim::Float64(a), Prim::Float64(b)) => Prim::Float64(match op {
            Add => a + b,
            Subtract => a - b,
            Multiply => a * b,
            Divide => a / b,
            FloorDivide => (a / b).floor(),
            Remainder => a % b,
        }),
        (a, b) => bail!("arithmetic on mismatched operands {:?} and {:?}", a, b),
    })
}

fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn compare_prims(t: &Type, region: &Region, l: Prim, r: Prim) -> Result<std::cmp::Ordering> {
    Ok(match (l, r) {
        (Prim::Bool(a), Prim::Bool(b)) => a.cmp(&b),
        (Prim::Int32(a), Prim::Int32(b)) => a.cmp(&b),
        (Prim::Int64(a), Prim::Int64(b)) => a.cmp(&b),
        (Prim::Float32(a), Prim::Float32(b)) => a.total_cmp(&b),
        (Prim::Float64(a), Prim::Float64(b)) => a.total_cmp(&b),
        (Prim::Offset(a), Prim::Offset(b)) => compare_regions(t, region, a, region, b, true),
        (a, b) => bail!("comparison of mismatched operands {:?} and {:?}", a, b),
    })
}

fn prim_to_annotation(t: &Type, region: &Region, v: Prim) -> Annotation {
    match v {
        Prim::Bool(x) => Annotation::Bool(x),
        Prim::Int32(x) => match t.kind {
            Kind::Call => Annotation::Call(x),
            _ => Annotation::Int32(x),
        },
        Prim::Int64(x) => Annotation::Int64(x),
        Prim::Float32(x) => Annotation::Float32(x),
        Prim::Float64(x) => Annotation::Float64(x),
        Prim::Offset(off) => view::read_annotation(t, region, off),
    }
}

/// Writes one field of a freshly-allocated struct block.
fn write_struct_field(
    s: &StructType,
    region: &mut Region,
    block: usize,
    i: usize,
    field_typ: &Type,
    missing: bool,
    v: Prim,
) -> Result<()> {
    if missing {
        match s.missing_idx(i) {
            Some(bit) => region.set_bit(block, bit),
            None => bail!(
                "missing value for required field `{}`",
                s.field(i).name
            ),
        }
    } else {
        store_prim(field_typ, region, block + s.field_offset(i), v);
    }
    Ok(())
}

fn emit_struct_constructor(typ: Type, field_steps: Vec<(Type, Step)>) -> Emitted {
    let s = typ.as_struct().expect("struct type").clone();
    Emitted {
        typ,
        step: Box::new(move |ctx| {
            let mut values = Vec::with_capacity(field_steps.len());
            for (_, step) in &field_steps {
                values.push((step)(ctx)?);
            }
            let block = ctx.region.allocate(s.alignment(), s.byte_size());
            for (i, ((ft, _), (m, v))) in field_steps.iter().zip(values).enumerate() {
                write_struct_field(&s, ctx.region, block, i, ft, m, v)?;
            }
            Ok((false, Prim::Offset(block)))
        }),
    }
}

/// Materializes a streamed array through the builder protocol: preallocate
/// when the length is known, else buffer values and missing bits, then copy.
fn materialize_array(array_type: Type, ae: ArrayEmitter) -> Emitted {
    let d = default_prim(&array_type);
    let typ = array_type.clone();
    Emitted {
        typ,
        step: Box::new(move |ctx| {
            let mut sink = BuildSink {
                typ: &array_type,
                state: BuildState::Idle,
            };
            let missing = (ae.emit)(ctx, &mut sink)?;
            if missing {
                return Ok((true, d));
            }
            let off = sink.finish(ctx)?;
            Ok((false, Prim::Offset(off)))
        }),
    }
}

enum BuildState {
    Idle,
    Direct { aoff: usize, len: usize, idx: usize },
    Buffered { items: Vec<(bool, Prim)> },
}

struct BuildSink<'t> {
    typ: &'t Type,
    state: BuildState,
}

impl BuildSink<'_> {
    fn write_element(
        typ: &Type,
        ctx: &mut EvalCtx,
        aoff: usize,
        len: usize,
        idx: usize,
        missing: bool,
        v: Prim,
    ) -> Result<()> {
        let elem = typ.element_type().expect("array type");
        if missing {
            ensure!(
                !elem.required,
                "missing element for required element type {}",
                elem
            );
            ctx.region.set_bit(aoff + 4, idx);
        } else {
            let slot = typ.array_element_offset(aoff, len, idx);
            store_prim(elem, ctx.region, slot, v);
        }
        Ok(())
    }

    fn finish(self, ctx: &mut EvalCtx) -> Result<usize> {
        match self.state {
            BuildState::Idle => bail!("array stream never started"),
            BuildState::Direct { aoff, len, idx } => {
                ensure!(idx == len, "array stream emitted {} of {} elements", idx, len);
                Ok(aoff)
            }
            BuildState::Buffered { items } => {
                let len = items.len();
                let aoff = ctx
                    .region
                    .allocate(self.typ.array_content_alignment(), self.typ.array_content_size(len));
                ctx.region.store_i32(aoff, len as i32);
                for (i, (m, v)) in items.into_iter().enumerate() {
                    Self::write_element(self.typ, ctx, aoff, len, i, m, v)?;
                }
                Ok(aoff)
            }
        }
    }
}

impl ArraySink for BuildSink<'_> {
    fn start(&mut self, ctx: &mut EvalCtx, known_len: Option<usize>) -> Result<()> {
        self.state = match known_len {
            Some(len) => {
                let aoff = ctx
                    .region
                    .allocate(self.typ.array_content_alignment(), self.typ.array_content_size(len));
                ctx.region.store_i32(aoff, len as i32);
                BuildState::Direct { aoff, len, idx: 0 }
            }
            None => BuildState::Buffered { items: Vec::new() },
        };
        Ok(())
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        match &mut self.state {
            BuildState::Idle => bail!("array element before stream start"),
            BuildState::Direct { aoff, len, idx } => {
                let (aoff, len, i) = (*aoff, *len, *idx);
                *idx += 1;
                Self::write_element(self.typ, ctx, aoff, len, i, missing, v)
            }
            BuildState::Buffered { items } => {
                items.push((missing, v));
                Ok(())
            }
        }
    }
}

struct MapSink<'s> {
    inner: &'s mut dyn ArraySink,
    body: &'s Rc<Step>,
    slot: usize,
}

impl ArraySink for MapSink<'_> {
    fn start(&mut self, ctx: &mut EvalCtx, known_len: Option<usize>) -> Result<()> {
        self.inner.start(ctx, known_len)
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        ctx.slots[self.slot] = (missing, v);
        let (m2, v2) = (self.body)(ctx)?;
        self.inner.element(ctx, m2, v2)
    }
}

struct FilterSink<'s> {
    inner: &'s mut dyn ArraySink,
    pred: &'s Rc<Step>,
    slot: usize,
}

impl ArraySink for FilterSink<'_> {
    fn start(&mut self, ctx: &mut EvalCtx, _known_len: Option<usize>) -> Result<()> {
        // filtering drops the static length
        self.inner.start(ctx, None)
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        ctx.slots[self.slot] = (missing, v);
        let (pm, pv) = (self.pred)(ctx)?;
        if !pm && pv.as_bool() {
            self.inner.element(ctx, missing, v)?;
        }
        Ok(())
    }
}

struct FlatMapSink<'s> {
    inner: &'s mut dyn ArraySink,
    body: &'s Rc<EmitFn>,
    slot: usize,
}

impl ArraySink for FlatMapSink<'_> {
    fn start(&mut self, ctx: &mut EvalCtx, _known_len: Option<usize>) -> Result<()> {
        self.inner.start(ctx, None)
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        ctx.slots[self.slot] = (missing, v);
        // a missing inner array contributes no elements
        let mut forward = ForwardSink {
            inner: &mut *self.inner,
        };
        (self.body)(ctx, &mut forward)?;
        Ok(())
    }
}

/// Forwards elements, swallowing the inner stream's start notification; the
/// downstream consumer was started once by the outer stream.
struct ForwardSink<'s> {
    inner: &'s mut dyn ArraySink,
}

impl ArraySink for ForwardSink<'_> {
    fn start(&mut self, _ctx: &mut EvalCtx, _known_len: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        self.inner.element(ctx, missing, v)
    }
}

struct FoldSink<'s> {
    body: &'s Rc<Step>,
    acc_slot: usize,
    elt_slot: usize,
}

impl ArraySink for FoldSink<'_> {
    fn start(&mut self, _ctx: &mut EvalCtx, _known_len: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        ctx.slots[self.elt_slot] = (missing, v);
        let acc = (self.body)(ctx)?;
        ctx.slots[self.acc_slot] = acc;
        Ok(())
    }
}

/// Feeds elements into aggregator state `idx`.
struct AggSink {
    idx: usize,
}

impl ArraySink for AggSink {
    fn start(&mut self, _ctx: &mut EvalCtx, _known_len: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn element(&mut self, ctx: &mut EvalCtx, missing: bool, v: Prim) -> Result<()> {
        let EvalCtx { region, aggs, .. } = ctx;
        aggs[self.idx].seq_op(region, v, missing)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::agg::AggOp;
    use crate::ir::IrBuilder;
    use bumpalo::Bump;

    fn eval_ir(arg_types: &[Type], args: &[(Prim, bool)], ir: &Ir) -> Result<(bool, Annotation)> {
        let registry = FunctionRegistry::with_defaults();
        let routine = compile(&registry, arg_types, ir)?;
        let mut region = Region::new();
        let (m, v) = routine.run(&mut region, args)?;
        let a = if m {
            Annotation::Missing
        } else {
            prim_to_annotation(routine.typ(), &region, v)
        };
        Ok((m, a))
    }

    fn eval_ok(arg_types: &[Type], args: &[(Prim, bool)], ir: &Ir) -> Annotation {
        eval_ir(arg_types, args, ir).unwrap().1
    }

    fn int_array(xs: &[i32]) -> Annotation {
        Annotation::Array(xs.iter().map(|&x| Annotation::Int32(x)).collect())
    }

    #[test]
    fn array_range_with_positive_step() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.array_range(b.i32(0), b.i32(10), b.i32(3));
        assert_eq!(eval_ok(&[], &[], ir), int_array(&[0, 3, 6, 9]));
    }

    #[test]
    fn array_range_with_negative_step() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.array_range(b.i32(10), b.i32(0), b.i32(-3));
        assert_eq!(eval_ok(&[], &[], ir), int_array(&[10, 7, 4, 1]));
    }

    #[test]
    fn array_range_with_zero_step_is_fatal() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.array_range(b.i32(0), b.i32(10), b.i32(0));
        let err = eval_ir(&[], &[], ir).unwrap_err().to_string();
        assert!(err.contains("step size 0"), "unexpected error: {}", err);
    }

    #[test]
    fn array_range_is_empty_when_direction_disagrees() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.array_range(b.i32(0), b.i32(10), b.i32(-1));
        assert_eq!(eval_ok(&[], &[], ir), int_array(&[]));
    }

    #[test]
    fn conditional_recovers_missing_input() {
        // If(IsNA(x), 0, x + 1) over x in {null, 4, 7} yields {0, 5, 8}
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let x = b.in_(0);
        let ir = b.if_(b.is_na(x), b.i32(0), b.add(x, b.i32(1)));
        let t = Type::int32();
        let cases = [
            ((Prim::Int32(0), true), 0),
            ((Prim::Int32(4), false), 5),
            ((Prim::Int32(7), false), 8),
        ];
        for (arg, expected) in cases {
            assert_eq!(
                eval_ok(&[t.clone()], &[arg], ir),
                Annotation::Int32(expected)
            );
        }
    }

    #[test]
    fn missing_propagates_through_strict_nodes() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let t = Type::int32();

        let add = b.add(b.in_(0), b.i32(1));
        let (m, _) = eval_ir(&[t.clone()], &[(Prim::Int32(0), true)], add).unwrap();
        assert!(m);

        let cmp = b.compare(ComparisonOp::Lt, b.in_(0), b.i32(5));
        let (m, _) = eval_ir(&[t.clone()], &[(Prim::Int32(0), true)], cmp).unwrap();
        assert!(m);
    }

    #[test]
    fn map_na_short_circuits_and_let_binds_once() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let t = Type::int32();
        let ir = b.map_na("x", b.in_(0), b.add(b.ref_("x"), b.ref_("x")));

        assert_eq!(
            eval_ok(&[t.clone()], &[(Prim::Int32(3), false)], ir),
            Annotation::Int32(6)
        );
        let (m, _) = eval_ir(&[t], &[(Prim::Int32(0), true)], ir).unwrap();
        assert!(m);
    }

    #[test]
    fn array_ref_out_of_bounds_is_fatal_but_missing_index_is_not() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);

        let oob = b.array_ref(b.make_array(vec![b.i32(1)], None), b.i32(5));
        let err = eval_ir(&[], &[], oob).unwrap_err().to_string();
        assert!(err.contains("out of bounds"), "unexpected error: {}", err);

        let na_idx = b.array_ref(b.make_array(vec![b.i32(1)], None), b.na(Type::int32()));
        let (m, _) = eval_ir(&[], &[], na_idx).unwrap();
        assert!(m);
    }

    #[test]
    fn array_map_filter_flatmap_compose() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);

        let r = b.array_range(b.i32(0), b.i32(6), b.i32(1));
        let rem = b.binary(BinaryOp::Remainder, b.ref_("x"), b.i32(2));
        let evens = b.array_filter(r, "x", b.compare(ComparisonOp::Eq, rem, b.i32(0)));
        let mapped = b.array_map(evens, "x", b.add(b.ref_("x"), b.i32(100)));
        assert_eq!(eval_ok(&[], &[], mapped), int_array(&[100, 102, 104]));

        let outer = b.array_range(b.i32(1), b.i32(4), b.i32(1));
        let fm = b.array_flat_map(outer, "n", b.array_range(b.i32(0), b.ref_("n"), b.i32(1)));
        assert_eq!(eval_ok(&[], &[], fm), int_array(&[0, 0, 1, 0, 1, 2]));
    }

    #[test]
    fn array_fold_sums_with_missing_elements_handled_in_body() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let arr = b.make_array(vec![b.i32(1), b.na(Type::int32()), b.i32(3)], None);
        let body = b.if_(
            b.is_na(b.ref_("x")),
            b.ref_("acc"),
            b.add(b.ref_("acc"), b.ref_("x")),
        );
        let ir = b.array_fold(arr, b.i32(0), "acc", "x", body);
        assert_eq!(eval_ok(&[], &[], ir), Annotation::Int32(4));
    }

    #[test]
    fn struct_construction_access_and_insert_fields() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);

        let s = b.make_struct(vec![("a", b.i32(1)), ("b", b.na(Type::int32()))]);
        assert_eq!(eval_ok(&[], &[], b.get_field(s, "a")), Annotation::Int32(1));

        let s2 = b.insert_fields(
            b.make_struct(vec![("a", b.i32(1)), ("b", b.i32(2))]),
            vec![("b", b.i32(20)), ("c", b.i32(30))],
        );
        let ir = b.make_tuple(vec![
            b.get_field(s2, "a"),
            b.get_field(s2, "b"),
            b.get_field(s2, "c"),
        ]);
        assert_eq!(
            eval_ok(&[], &[], ir),
            Annotation::Struct(vec![
                Annotation::Int32(1),
                Annotation::Int32(20),
                Annotation::Int32(30),
            ])
        );
    }

    #[test]
    fn missing_field_of_defined_struct_reads_missing() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let s = b.make_struct(vec![("a", b.na(Type::int32()))]);
        assert_eq!(eval_ok(&[], &[], b.get_field(s, "a")), Annotation::Missing);
    }

    #[test]
    fn user_functions_resolve_by_argument_types() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        assert_eq!(
            eval_ok(&[], &[], b.apply("min", vec![b.i32(4), b.i32(9)])),
            Annotation::Int32(4)
        );
        assert_eq!(
            eval_ok(&[], &[], b.apply("len", vec![b.str_lit("actg")])),
            Annotation::Int32(4)
        );
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.binary(BinaryOp::Divide, b.i32(1), b.i32(0));
        let err = eval_ir(&[], &[], ir).unwrap_err().to_string();
        assert!(err.contains("division by zero"), "unexpected error: {}", err);
    }

    fn run_agg(
        elem_type: &Type,
        elements: &[(Prim, bool)],
        ir: &Ir,
    ) -> Result<(bool, Annotation)> {
        let registry = FunctionRegistry::with_defaults();
        let compiled = compile_aggregation(&registry, elem_type, ir)?;
        let mut states = compiled.new_states();
        let mut region = Region::new();
        for &e in elements {
            region.clear();
            compiled.run_seq(&mut region, &mut states, e)?;
        }
        region.clear();
        let (m, v) = compiled.run_result(&mut region, &mut states)?;
        let a = if m {
            Annotation::Missing
        } else {
            prim_to_annotation(compiled.result_type(), &region, v)
        };
        Ok((m, a))
    }

    #[test]
    fn sum_of_filtered_aggregable() {
        // sum(filter(a, x -> x > 0)) over [1, null, -2, 3] == 4
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let filtered = b.agg_filter(
            b.agg_in(),
            "x",
            b.compare(ComparisonOp::Gt, b.ref_("x"), b.i32(0)),
        );
        let ir = b.apply_agg_op(filtered, AggOp::Sum, vec![]);
        let elems = [
            (Prim::Int32(1), false),
            (Prim::Int32(0), true),
            (Prim::Int32(-2), false),
            (Prim::Int32(3), false),
        ];
        let (_, got) = run_agg(&Type::int32(), &elems, ir).unwrap();
        assert_eq!(got, Annotation::Int64(4));
    }

    #[test]
    fn sum_over_all_missing_is_defined_zero() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.apply_agg_op(b.agg_in(), AggOp::Sum, vec![]);
        let elems = [(Prim::Int32(0), true), (Prim::Int32(0), true)];
        let (m, got) = run_agg(&Type::int32(), &elems, ir).unwrap();
        assert!(!m);
        assert_eq!(got, Annotation::Int64(0));
    }

    #[test]
    fn agg_map_and_flat_map_feed_the_aggregator() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let elems = [(Prim::Int32(2), false), (Prim::Int32(3), false)];

        let doubled = b.agg_map(b.agg_in(), "x", b.add(b.ref_("x"), b.ref_("x")));
        let sum = b.apply_agg_op(doubled, AggOp::Sum, vec![]);
        let (_, got) = run_agg(&Type::int32(), &elems, sum).unwrap();
        assert_eq!(got, Annotation::Int64(10));

        // flat_map expands each element n into range(0, n)
        let expanded = b.agg_flat_map(
            b.agg_in(),
            "n",
            b.array_range(b.i32(0), b.ref_("n"), b.i32(1)),
        );
        let count = b.apply_agg_op(expanded, AggOp::Count, vec![]);
        let (_, got) = run_agg(&Type::int32(), &elems, count).unwrap();
        assert_eq!(got, Annotation::Int64(5));
    }

    #[test]
    fn nested_aggregation_is_rejected_at_emit_time() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let inner = b.apply_agg_op(b.agg_in(), AggOp::Count, vec![]);
        let outer = b.apply_agg_op(b.agg_map(b.agg_in(), "x", inner), AggOp::Sum, vec![]);
        let registry = FunctionRegistry::with_defaults();
        let err = compile_aggregation(&registry, &Type::int32(), outer)
            .unwrap_err()
            .to_string();
        assert!(
            err.contains("nested aggregations"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn take_aggregator_consumes_constant_arguments() {
        let arena = Bump::new();
        let b = IrBuilder::new(&arena);
        let ir = b.apply_agg_op(b.agg_in(), AggOp::Take, vec![b.i32(2)]);
        let elems = [
            (Prim::Int32(5), false),
            (Prim::Int32(6), false),
            (Prim::Int32(7), false),
        ];
        let (_, got) = run_agg(&Type::int32(), &elems, ir).unwrap();
        assert_eq!(got, int_array(&[5, 6]));
    }
}
