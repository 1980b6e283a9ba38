//! Runtime annotation carrier.
//!
//! `Annotation` is the materialized, dynamically-tagged form of a region
//! value, matched against a static [`Type`](crate::vtype::Type) at the
//! boundaries of the engine: literals, JSON import/export, partitioner
//! bounds, and test assertions. Hot paths stay on (region, offset) pairs and
//! never materialize annotations.

use eyre::{bail, Result};

use crate::interval::Interval;

#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Missing,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Binary(Vec<u8>),
    Call(i32),
    Locus { contig: String, position: i32 },
    Interval(Box<Interval>),
    /// Also carries Set and Dict values in fundamental form.
    Array(Vec<Annotation>),
    /// Also carries Tuple, Locus-fundamental, and Interval-fundamental rows.
    Struct(Vec<Annotation>),
}

impl Annotation {
    pub fn is_missing(&self) -> bool {
        matches!(self, Annotation::Missing)
    }

    pub fn is_defined(&self) -> bool {
        !self.is_missing()
    }

    pub fn str(s: impl Into<String>) -> Self {
        Annotation::Str(s.into())
    }

    pub fn as_int32(&self) -> Result<i32> {
        match self {
            Annotation::Int32(x) => Ok(*x),
            other => bail!("expected Int32 annotation, got {:?}", other),
        }
    }

    pub fn as_int64(&self) -> Result<i64> {
        match self {
            Annotation::Int64(x) => Ok(*x),
            other => bail!("expected Int64 annotation, got {:?}", other),
        }
    }

    pub fn as_float64(&self) -> Result<f64> {
        match self {
            Annotation::Float64(x) => Ok(*x),
            other => bail!("expected Float64 annotation, got {:?}", other),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Annotation::Bool(x) => Ok(*x),
            other => bail!("expected Bool annotation, got {:?}", other),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Annotation::Str(s) => Ok(s),
            other => bail!("expected String annotation, got {:?}", other),
        }
    }

    pub fn as_struct(&self) -> Result<&[Annotation]> {
        match self {
            Annotation::Struct(fields) => Ok(fields),
            other => bail!("expected Struct annotation, got {:?}", other),
        }
    }

    pub fn as_array(&self) -> Result<&[Annotation]> {
        match self {
            Annotation::Array(elems) => Ok(elems),
            other => bail!("expected Array annotation, got {:?}", other),
        }
    }
}
