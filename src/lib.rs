//! # Gnomon - Ordered Tabular Data Engine Core
//!
//! Gnomon is the core of a distributed genomic/tabular data engine: a typed
//! row-expression compiler over a compact binary row layout, and an ordered,
//! range-partitioned dataset layer that reasons about sort order to shuffle,
//! join, and coalesce without unnecessary redistribution.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     Ordered dataset (joins, coerce)      │
//! ├──────────────────────┬───────────────────┤
//! │  Range partitioner   │  Backend seam     │
//! ├──────────────────────┴───────────────────┤
//! │   IR emitter  │  Aggregator protocol     │
//! ├──────────────────────────────────────────┤
//! │   Region memory, row builder, codec      │
//! ├──────────────────────────────────────────┤
//! │   Virtual types, orderings, intervals    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Design Pillars
//!
//! - **Offset-addressed rows**: values live in bump-allocated
//!   [`region::Region`]s at type-determined offsets; readers never copy.
//! - **First-class missingness**: every optional value is a (value, bit)
//!   pair, in row layout and in emitted code alike. Missing propagates,
//!   never throws.
//! - **Compile once, run per row**: [`ir`] lowers expression trees into
//!   specialized routines ahead of the partition loop.
//! - **Order is knowledge**: [`ordered`] tracks per-partition key ranges so
//!   most transformations preserve partitioning, and coercion picks the
//!   cheapest sufficient strategy from observed sortedness.
//!
//! ## Module Overview
//!
//! - [`vtype`]: logical types, layout, annotations, orderings
//! - [`region`]: arena memory, row builder/readers, row codec
//! - [`interval`]: endpoint-inclusive intervals and the search tree
//! - [`ir`]: expression IR, staged emitter, function registry
//! - [`agg`]: aggregator protocol and the standard aggregators
//! - [`ordered`]: partitioner, ordered dataset, joins, coercion
//! - [`backend`]: execution-runtime seam and the in-process backend
//! - [`dataset_io`]: partition files, manifest, JSON value bindings

pub mod agg;
pub mod backend;
pub mod dataset_io;
pub mod interval;
pub mod ir;
pub mod ordered;
pub mod region;
pub mod vtype;

pub use backend::{Backend, LocalBackend};
pub use ordered::{coerce, JoinKind, OrderedDataset, OrderedKeyedType, OrderedPartitioner};
pub use vtype::{Annotation, Field, Type};
