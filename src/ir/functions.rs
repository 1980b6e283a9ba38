//! User-function registry.
//!
//! Functions are registered under a name with declared argument types and
//! resolved by unifying declared kinds against actual argument types at
//! emission time. The emitter memoizes each resolved implementation per call
//! site, so repeated applications of the same signature share one routine.

use std::rc::Rc;

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::ir::emit::{EvalCtx, Prim};
use crate::region::view;
use crate::vtype::Type;

/// A resolved function implementation. Receives evaluated (missing, value)
/// argument pairs and full control over missingness of the result.
pub type FnImpl = dyn Fn(&mut EvalCtx, &[(bool, Prim)]) -> Result<(bool, Prim)>;

pub struct FunctionImpl {
    pub name: String,
    pub arg_types: Vec<Type>,
    pub ret_type: Type,
    pub f: Rc<FnImpl>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    fns: HashMap<String, Vec<Rc<FunctionImpl>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        arg_types: Vec<Type>,
        ret_type: Type,
        f: Rc<FnImpl>,
    ) {
        self.fns
            .entry(name.to_string())
            .or_default()
            .push(Rc::new(FunctionImpl {
                name: name.to_string(),
                arg_types,
                ret_type,
                f,
            }));
    }

    /// Registers a strict function: any missing argument makes the result
    /// missing and skips the body.
    pub fn register_strict<F>(&mut self, name: &str, arg_types: Vec<Type>, ret_type: Type, f: F)
    where
        F: Fn(&mut EvalCtx, &[Prim]) -> Result<Prim> + 'static,
    {
        let ret = ret_type.clone();
        let wrapped: Rc<FnImpl> = Rc::new(move |ctx, args| {
            if args.iter().any(|(m, _)| *m) {
                return Ok((true, super::emit::default_prim(&ret)));
            }
            let values: Vec<Prim> = args.iter().map(|(_, v)| *v).collect();
            Ok((false, f(ctx, &values)?))
        });
        self.register(name, arg_types, ret_type, wrapped);
    }

    pub fn resolve(&self, name: &str, actual: &[Type]) -> Result<Rc<FunctionImpl>> {
        let candidates = match self.fns.get(name) {
            Some(c) => c,
            None => bail!("no function named `{}`", name),
        };
        for c in candidates {
            if c.arg_types.len() == actual.len()
                && c.arg_types
                    .iter()
                    .zip(actual)
                    .all(|(d, a)| d.kind == a.kind)
            {
                return Ok(c.clone());
            }
        }
        bail!(
            "no overload of `{}` matches argument types ({})",
            name,
            actual
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    /// The default registry: numeric min/max/abs and string length.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();

        r.register_strict(
            "min",
            vec![Type::int32(), Type::int32()],
            Type::int32(),
            |_, a| Ok(Prim::Int32(a[0].as_i32().min(a[1].as_i32()))),
        );
        r.register_strict(
            "min",
            vec![Type::int64(), Type::int64()],
            Type::int64(),
            |_, a| Ok(Prim::Int64(a[0].as_i64().min(a[1].as_i64()))),
        );
        r.register_strict(
            "min",
            vec![Type::float64(), Type::float64()],
            Type::float64(),
            |_, a| Ok(Prim::Float64(a[0].as_f64().min(a[1].as_f64()))),
        );
        r.register_strict(
            "max",
            vec![Type::int32(), Type::int32()],
            Type::int32(),
            |_, a| Ok(Prim::Int32(a[0].as_i32().max(a[1].as_i32()))),
        );
        r.register_strict(
            "max",
            vec![Type::int64(), Type::int64()],
            Type::int64(),
            |_, a| Ok(Prim::Int64(a[0].as_i64().max(a[1].as_i64()))),
        );
        r.register_strict(
            "max",
            vec![Type::float64(), Type::float64()],
            Type::float64(),
            |_, a| Ok(Prim::Float64(a[0].as_f64().max(a[1].as_f64()))),
        );
        r.register_strict("abs", vec![Type::int32()], Type::int32(), |_, a| {
            Ok(Prim::Int32(a[0].as_i32().wrapping_abs()))
        });
        r.register_strict("abs", vec![Type::int64()], Type::int64(), |_, a| {
            Ok(Prim::Int64(a[0].as_i64().wrapping_abs()))
        });
        r.register_strict("abs", vec![Type::float64()], Type::float64(), |_, a| {
            Ok(Prim::Float64(a[0].as_f64().abs()))
        });
        r.register_strict("len", vec![Type::str()], Type::int32(), |ctx, a| {
            let off = a[0].as_offset();
            Ok(Prim::Int32(view::load_str(ctx.region, off).len() as i32))
        });

        r
    }
}
