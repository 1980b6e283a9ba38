//! # Typed Row-Expression IR
//!
//! Expression trees over [`crate::vtype::Type`] values, arena-allocated and
//! immutable. Types are inferred bottom-up during emission; the emitter
//! ([`emit`]) lowers a tree into a specialized routine that reads and writes
//! region values directly.
//!
//! Missingness is a first-class channel: every sub-expression evaluates to a
//! (missing, value) pair and missing propagates through strict nodes.
//! `IsNA`, `MapNA`, and `InsertFields` field overrides are the recovery
//! points.
//!
//! Aggregator-space nodes (`AggIn`, `AggMap`, `AggFilter`, `AggFlatMap`)
//! describe the element stream feeding an [`ApplyAggOp`](Ir::ApplyAggOp) and
//! are only legal under one; `In` and `Apply` are rejected there, as are
//! nested aggregations.

pub mod emit;
pub mod functions;

pub use emit::{compile, compile_aggregation, CompiledAggregation, CompiledRoutine, EvalCtx, Prim};
pub use functions::FunctionRegistry;

use bumpalo::Bump;

use crate::agg::AggOp;
use crate::vtype::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Remainder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug)]
pub enum Ir<'a> {
    True,
    False,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    StrLit(&'a str),
    /// Missing value of the given type.
    NA(Type),
    IsNA(&'a Ir<'a>),
    If {
        cond: &'a Ir<'a>,
        cnsq: &'a Ir<'a>,
        altr: &'a Ir<'a>,
    },
    Let {
        name: &'a str,
        value: &'a Ir<'a>,
        body: &'a Ir<'a>,
    },
    /// Short-circuiting let: missing `value` skips `body` entirely.
    MapNA {
        name: &'a str,
        value: &'a Ir<'a>,
        body: &'a Ir<'a>,
    },
    Ref(&'a str),
    /// User input slot i: a (value, missing) argument pair.
    In(usize),
    ApplyBinaryPrimOp {
        op: BinaryOp,
        l: &'a Ir<'a>,
        r: &'a Ir<'a>,
    },
    ApplyComparisonOp {
        op: ComparisonOp,
        l: &'a Ir<'a>,
        r: &'a Ir<'a>,
    },
    ApplyUnaryPrimOp {
        op: UnaryOp,
        x: &'a Ir<'a>,
    },
    MakeArray {
        args: Vec<&'a Ir<'a>>,
        elem_hint: Option<Type>,
    },
    ArrayRef {
        a: &'a Ir<'a>,
        i: &'a Ir<'a>,
    },
    ArrayLen(&'a Ir<'a>),
    ArrayRange {
        start: &'a Ir<'a>,
        stop: &'a Ir<'a>,
        step: &'a Ir<'a>,
    },
    ArrayMap {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    ArrayFilter {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    ArrayFlatMap {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    ArrayFold {
        a: &'a Ir<'a>,
        zero: &'a Ir<'a>,
        acc_name: &'a str,
        elt_name: &'a str,
        body: &'a Ir<'a>,
    },
    MakeStruct(Vec<(&'a str, &'a Ir<'a>)>),
    InsertFields {
        old: &'a Ir<'a>,
        fields: Vec<(&'a str, &'a Ir<'a>)>,
    },
    GetField {
        o: &'a Ir<'a>,
        name: &'a str,
    },
    MakeTuple(Vec<&'a Ir<'a>>),
    GetTupleElement {
        o: &'a Ir<'a>,
        idx: usize,
    },
    /// The ambient aggregable element; only legal in aggregator space.
    AggIn,
    AggMap {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    AggFilter {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    AggFlatMap {
        a: &'a Ir<'a>,
        name: &'a str,
        body: &'a Ir<'a>,
    },
    ApplyAggOp {
        a: &'a Ir<'a>,
        op: AggOp,
        args: Vec<&'a Ir<'a>>,
    },
    Apply {
        function: &'a str,
        args: Vec<&'a Ir<'a>>,
    },
}

/// Arena-backed constructors for building IR trees by hand.
pub struct IrBuilder<'a> {
    arena: &'a Bump,
}

impl<'a> IrBuilder<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self { arena }
    }

    fn alloc(&self, ir: Ir<'a>) -> &'a Ir<'a> {
        self.arena.alloc(ir)
    }

    pub fn i32(&self, v: i32) -> &'a Ir<'a> {
        self.alloc(Ir::I32(v))
    }

    pub fn i64(&self, v: i64) -> &'a Ir<'a> {
        self.alloc(Ir::I64(v))
    }

    pub fn f64(&self, v: f64) -> &'a Ir<'a> {
        self.alloc(Ir::F64(v))
    }

    pub fn bool(&self, v: bool) -> &'a Ir<'a> {
        self.alloc(if v { Ir::True } else { Ir::False })
    }

    pub fn str_lit(&self, s: &str) -> &'a Ir<'a> {
        let s = self.arena.alloc_str(s);
        self.alloc(Ir::StrLit(s))
    }

    pub fn na(&self, t: Type) -> &'a Ir<'a> {
        self.alloc(Ir::NA(t))
    }

    pub fn is_na(&self, x: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::IsNA(x))
    }

    pub fn if_(&self, cond: &'a Ir<'a>, cnsq: &'a Ir<'a>, altr: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::If { cond, cnsq, altr })
    }

    pub fn let_(&self, name: &str, value: &'a Ir<'a>, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::Let { name, value, body })
    }

    pub fn map_na(&self, name: &str, value: &'a Ir<'a>, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::MapNA { name, value, body })
    }

    pub fn ref_(&self, name: &str) -> &'a Ir<'a> {
        self.alloc(Ir::Ref(self.arena.alloc_str(name)))
    }

    pub fn in_(&self, i: usize) -> &'a Ir<'a> {
        self.alloc(Ir::In(i))
    }

    pub fn binary(&self, op: BinaryOp, l: &'a Ir<'a>, r: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ApplyBinaryPrimOp { op, l, r })
    }

    pub fn add(&self, l: &'a Ir<'a>, r: &'a Ir<'a>) -> &'a Ir<'a> {
        self.binary(BinaryOp::Add, l, r)
    }

    pub fn compare(&self, op: ComparisonOp, l: &'a Ir<'a>, r: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ApplyComparisonOp { op, l, r })
    }

    pub fn unary(&self, op: UnaryOp, x: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ApplyUnaryPrimOp { op, x })
    }

    pub fn make_array(&self, args: Vec<&'a Ir<'a>>, elem_hint: Option<Type>) -> &'a Ir<'a> {
        self.alloc(Ir::MakeArray { args, elem_hint })
    }

    pub fn array_ref(&self, a: &'a Ir<'a>, i: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ArrayRef { a, i })
    }

    pub fn array_len(&self, a: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ArrayLen(a))
    }

    pub fn array_range(&self, start: &'a Ir<'a>, stop: &'a Ir<'a>, step: &'a Ir<'a>) -> &'a Ir<'a> {
        self.alloc(Ir::ArrayRange { start, stop, step })
    }

    pub fn array_map(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::ArrayMap { a, name, body })
    }

    pub fn array_filter(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::ArrayFilter { a, name, body })
    }

    pub fn array_flat_map(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::ArrayFlatMap { a, name, body })
    }

    pub fn array_fold(
        &self,
        a: &'a Ir<'a>,
        zero: &'a Ir<'a>,
        acc_name: &str,
        elt_name: &str,
        body: &'a Ir<'a>,
    ) -> &'a Ir<'a> {
        let acc_name = self.arena.alloc_str(acc_name);
        let elt_name = self.arena.alloc_str(elt_name);
        self.alloc(Ir::ArrayFold {
            a,
            zero,
            acc_name,
            elt_name,
            body,
        })
    }

    pub fn make_struct(&self, fields: Vec<(&str, &'a Ir<'a>)>) -> &'a Ir<'a> {
        let fields = fields
            .into_iter()
            .map(|(n, v)| (&*self.arena.alloc_str(n), v))
            .collect();
        self.alloc(Ir::MakeStruct(fields))
    }

    pub fn insert_fields(&self, old: &'a Ir<'a>, fields: Vec<(&str, &'a Ir<'a>)>) -> &'a Ir<'a> {
        let fields = fields
            .into_iter()
            .map(|(n, v)| (&*self.arena.alloc_str(n), v))
            .collect();
        self.alloc(Ir::InsertFields { old, fields })
    }

    pub fn get_field(&self, o: &'a Ir<'a>, name: &str) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::GetField { o, name })
    }

    pub fn make_tuple(&self, values: Vec<&'a Ir<'a>>) -> &'a Ir<'a> {
        self.alloc(Ir::MakeTuple(values))
    }

    pub fn get_tuple_element(&self, o: &'a Ir<'a>, idx: usize) -> &'a Ir<'a> {
        self.alloc(Ir::GetTupleElement { o, idx })
    }

    pub fn agg_in(&self) -> &'a Ir<'a> {
        self.alloc(Ir::AggIn)
    }

    pub fn agg_map(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::AggMap { a, name, body })
    }

    pub fn agg_filter(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::AggFilter { a, name, body })
    }

    pub fn agg_flat_map(&self, a: &'a Ir<'a>, name: &str, body: &'a Ir<'a>) -> &'a Ir<'a> {
        let name = self.arena.alloc_str(name);
        self.alloc(Ir::AggFlatMap { a, name, body })
    }

    pub fn apply_agg_op(&self, a: &'a Ir<'a>, op: AggOp, args: Vec<&'a Ir<'a>>) -> &'a Ir<'a> {
        self.alloc(Ir::ApplyAggOp { a, op, args })
    }

    pub fn apply(&self, function: &str, args: Vec<&'a Ir<'a>>) -> &'a Ir<'a> {
        let function = self.arena.alloc_str(function);
        self.alloc(Ir::Apply { function, args })
    }
}
