//! # Virtual Type System
//!
//! This module provides the canonical [`Type`] for gnomon, used across row
//! layout, expression compilation, and dataset metadata. A `Type` describes
//! both a logical kind (what values mean) and a physical layout (where bytes
//! live inside a [`crate::region::Region`]).
//!
//! ## Type Categories
//!
//! | Category | Kinds | Slot Size |
//! |----------|-------|-----------|
//! | **Primitive** | Bool, Int32, Int64, Float32, Float64, Call | 1-8 bytes |
//! | **Variable** | Str, Binary | 8-byte offset word |
//! | **Container** | Array, Set, Dict | 8-byte offset word |
//! | **Inline struct** | Struct, Tuple, Interval, Locus | sum of field slots |
//!
//! ## Requiredness
//!
//! Every type carries a `required` flag. A required value never allocates a
//! missing bit: struct headers hold one bit per *optional* field, arrays one
//! bit per element only when the element type is optional. Accessing a field
//! whose missing bit is set is undefined; callers must test
//! `is_field_defined` first.
//!
//! ## Fundamental Types
//!
//! Logical kinds that are not primitive lower to a *fundamental* on-wire
//! representation used by the codec and the row builder:
//!
//! - `Set[T]` -> `Array[T]` (sorted, deduplicated by convention)
//! - `Dict[K, V]` -> `Array[Struct{key: K, value: V}]`
//! - `Interval[P]` -> `Struct{start: P, end: P, includesStart: +Bool, includesEnd: +Bool}`
//! - `Locus` -> `Struct{contig: +Str, position: +Int32}`
//! - `Call` -> `Int32`
//!
//! ## Struct Layout
//!
//! For `Struct{f1: T1, ..., fn: Tn}` the layout is a header of
//! `ceil(n_optional / 8)` missing-bit bytes (absent when every field is
//! required) followed by field slots at precomputed aligned offsets. Offsets
//! depend only on the type, never on the data.

mod annotation;
mod ordering;
mod parse;
mod types;

pub use annotation::Annotation;
pub use ordering::{compare, compare_regions};
pub use parse::parse_type;
pub use types::{Field, Kind, StructType, Type};
