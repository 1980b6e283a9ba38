//! # RegionValueBuilder - Row Construction
//!
//! Builds a region value slot by slot against a target type. The builder
//! tracks a stack of open containers; typed adders write at the current slot
//! and advance, `set_missing` sets the current slot's missing bit instead.
//! `add_annotation` is the unchecked generic path used by import and tests;
//! hot paths use the typed adders.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rvb = RegionValueBuilder::new(&mut region, &row_type);
//! rvb.start_struct(true)?;
//! rvb.add_int(42)?;
//! rvb.set_missing()?;
//! rvb.end_struct()?;
//! let offset = rvb.end()?;
//! ```
//!
//! The produced bytes exactly match the target type's layout. Building into
//! a cleared region starts at offset 0.

use eyre::{bail, ensure, Result};

use crate::region::{copy, Region};
use crate::vtype::{compare, Annotation, Kind, StructType, Type};

enum Frame {
    Struct {
        typ: StructType,
        off: usize,
        idx: usize,
    },
    Array {
        typ: Type,
        off: usize,
        len: usize,
        idx: usize,
    },
}

pub struct RegionValueBuilder<'r> {
    region: &'r mut Region,
    root: Type,
    frames: Vec<Frame>,
    start: Option<usize>,
}

impl<'r> RegionValueBuilder<'r> {
    /// Starts building a value of `typ` (any logical type; layout follows
    /// its fundamental representation).
    pub fn new(region: &'r mut Region, typ: &Type) -> Self {
        Self {
            region,
            root: typ.fundamental(),
            frames: Vec::new(),
            start: None,
        }
    }

    fn current_type(&self) -> &Type {
        match self.frames.last() {
            None => &self.root,
            Some(Frame::Struct { typ, idx, .. }) => typ.field_type(*idx),
            Some(Frame::Array { typ, .. }) => typ.element_type().expect("array frame"),
        }
    }

    fn current_slot(&self) -> usize {
        match self.frames.last() {
            None => unreachable!("no open container"),
            Some(Frame::Struct { typ, off, idx }) => off + typ.field_offset(*idx),
            Some(Frame::Array { typ, off, len, idx }) => typ.array_element_offset(*off, *len, *idx),
        }
    }

    fn advance(&mut self) {
        match self.frames.last_mut() {
            None => {}
            Some(Frame::Struct { idx, .. }) | Some(Frame::Array { idx, .. }) => *idx += 1,
        }
    }

    /// Allocates the slot for a primitive write: root values allocate fresh,
    /// nested values resolve to their parent's current slot.
    fn value_slot(&mut self, alignment: usize, size: usize) -> usize {
        if self.frames.is_empty() {
            let off = self.region.allocate(alignment, size);
            self.start = Some(off);
            off
        } else {
            self.current_slot()
        }
    }

    pub fn start_struct(&mut self, init: bool) -> Result<()> {
        let st = match &self.current_type().kind {
            Kind::Struct(s) | Kind::Tuple(s) => s.clone(),
            other => bail!("start_struct on non-struct type {:?}", other),
        };
        let off = if self.frames.is_empty() {
            let off = self.region.allocate(st.alignment(), st.byte_size());
            self.start = Some(off);
            off
        } else {
            self.current_slot()
        };
        if init {
            for b in 0..st.n_missing_bytes() {
                self.region.store_byte(off + b, 0);
            }
        }
        self.frames.push(Frame::Struct { typ: st, off, idx: 0 });
        Ok(())
    }

    pub fn end_struct(&mut self) -> Result<()> {
        match self.frames.pop() {
            Some(Frame::Struct { typ, idx, .. }) => {
                ensure!(
                    idx == typ.n_fields(),
                    "struct ended after {} of {} fields",
                    idx,
                    typ.n_fields()
                );
                self.advance();
                Ok(())
            }
            _ => bail!("end_struct without matching start_struct"),
        }
    }

    pub fn start_array(&mut self, len: usize, init: bool) -> Result<()> {
        let at = self.current_type().clone();
        ensure!(
            matches!(at.kind, Kind::Array(_)),
            "start_array on non-array type {}",
            at
        );
        let aoff = self
            .region
            .allocate(at.array_content_alignment(), at.array_content_size(len));
        self.region.store_i32(aoff, len as i32);
        if init {
            for b in 0..at.array_n_missing_bytes(len) {
                self.region.store_byte(aoff + 4 + b, 0);
            }
        }
        if self.frames.is_empty() {
            self.start = Some(aoff);
        } else {
            let slot = self.current_slot();
            self.region.store_offset(slot, aoff);
        }
        self.frames.push(Frame::Array {
            typ: at,
            off: aoff,
            len,
            idx: 0,
        });
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<()> {
        match self.frames.pop() {
            Some(Frame::Array { len, idx, .. }) => {
                ensure!(idx == len, "array ended after {} of {} elements", idx, len);
                self.advance();
                Ok(())
            }
            _ => bail!("end_array without matching start_array"),
        }
    }

    /// Marks the current slot missing and advances.
    pub fn set_missing(&mut self) -> Result<()> {
        match self.frames.last() {
            None => bail!("cannot write a missing value at the root"),
            Some(Frame::Struct { typ, off, idx }) => match typ.missing_idx(*idx) {
                Some(bit) => self.region.set_bit(*off, bit),
                None => bail!(
                    "cannot set required field `{}` missing",
                    typ.field(*idx).name
                ),
            },
            Some(Frame::Array { typ, off, idx, .. }) => {
                let elem = typ.element_type().expect("array frame");
                ensure!(!elem.required, "cannot set required array element missing");
                self.region.set_bit(*off + 4, *idx);
            }
        }
        self.advance();
        Ok(())
    }

    pub fn add_bool(&mut self, v: bool) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Bool));
        let slot = self.value_slot(1, 1);
        self.region.store_bool(slot, v);
        self.advance();
        Ok(())
    }

    pub fn add_int(&mut self, v: i32) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Int32));
        let slot = self.value_slot(4, 4);
        self.region.store_i32(slot, v);
        self.advance();
        Ok(())
    }

    pub fn add_long(&mut self, v: i64) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Int64));
        let slot = self.value_slot(8, 8);
        self.region.store_i64(slot, v);
        self.advance();
        Ok(())
    }

    pub fn add_float(&mut self, v: f32) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Float32));
        let slot = self.value_slot(4, 4);
        self.region.store_f32(slot, v);
        self.advance();
        Ok(())
    }

    pub fn add_double(&mut self, v: f64) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Float64));
        let slot = self.value_slot(8, 8);
        self.region.store_f64(slot, v);
        self.advance();
        Ok(())
    }

    pub fn add_string(&mut self, v: &str) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Str));
        self.add_bytes_content(v.as_bytes())
    }

    pub fn add_binary(&mut self, v: &[u8]) -> Result<()> {
        debug_assert!(matches!(self.current_type().kind, Kind::Binary));
        self.add_bytes_content(v)
    }

    fn add_bytes_content(&mut self, bytes: &[u8]) -> Result<()> {
        let content = self.region.allocate(4, 4 + bytes.len());
        self.region.store_i32(content, bytes.len() as i32);
        self.region.store_bytes(content + 4, bytes);
        if self.frames.is_empty() {
            self.start = Some(content);
        } else {
            let slot = self.current_slot();
            self.region.store_offset(slot, content);
        }
        self.advance();
        Ok(())
    }

    /// Writes a raw offset word at the current slot. The offset must point
    /// at content of the slot's type inside the same region.
    pub fn add_offset(&mut self, content: usize) -> Result<()> {
        ensure!(!self.frames.is_empty(), "add_offset at the root");
        let slot = self.current_slot();
        self.region.store_offset(slot, content);
        self.advance();
        Ok(())
    }

    /// Deep-copies a value from another region into the current slot.
    ///
    /// `src_off` addresses the value itself (content offset for pointer
    /// kinds), as returned by the view readers.
    pub fn add_region_value(&mut self, src_type: &Type, src: &Region, src_off: usize) -> Result<()> {
        let fund = src_type.fundamental();
        if self.frames.is_empty() {
            self.start = Some(copy::copy_root(&fund, src, src_off, self.region));
        } else {
            let slot = self.current_slot();
            if fund.is_pointer() {
                let content = copy::copy_root(&fund, src, src_off, self.region);
                self.region.store_offset(slot, content);
            } else {
                match &fund.kind {
                    Kind::Struct(s) | Kind::Tuple(s) => {
                        copy::copy_struct_body(s, src, src_off, self.region, slot)
                    }
                    _ => self
                        .region
                        .copy_raw_from(src, src_off, slot, fund.byte_size()),
                }
            }
        }
        self.advance();
        Ok(())
    }

    /// Generic annotation writer. The annotation must inhabit `typ`; this is
    /// the unchecked import/export path.
    pub fn add_annotation(&mut self, typ: &Type, a: &Annotation) -> Result<()> {
        if a.is_missing() {
            return self.set_missing();
        }
        match (&typ.kind, a) {
            (Kind::Bool, Annotation::Bool(v)) => self.add_bool(*v),
            (Kind::Int32, Annotation::Int32(v)) => self.add_int(*v),
            (Kind::Int64, Annotation::Int64(v)) => self.add_long(*v),
            (Kind::Float32, Annotation::Float32(v)) => self.add_float(*v),
            (Kind::Float64, Annotation::Float64(v)) => self.add_double(*v),
            (Kind::Str, Annotation::Str(v)) => self.add_string(v),
            (Kind::Binary, Annotation::Binary(v)) => self.add_binary(v),
            (Kind::Call, Annotation::Call(v)) => {
                // Call lowers to Int32
                let slot = self.value_slot(4, 4);
                self.region.store_i32(slot, *v);
                self.advance();
                Ok(())
            }
            (Kind::Locus, Annotation::Locus { contig, position }) => {
                self.start_struct(true)?;
                self.add_string(contig)?;
                self.add_int(*position)?;
                self.end_struct()
            }
            (Kind::Interval(point), Annotation::Interval(iv)) => {
                self.start_struct(true)?;
                self.add_annotation(point, &iv.start)?;
                self.add_annotation(point, &iv.end)?;
                self.add_bool(iv.includes_start)?;
                self.add_bool(iv.includes_end)?;
                self.end_struct()
            }
            (Kind::Array(elem), Annotation::Array(xs)) => {
                self.start_array(xs.len(), true)?;
                for x in xs {
                    self.add_annotation(elem, x)?;
                }
                self.end_array()
            }
            (Kind::Set(elem), Annotation::Array(xs)) => {
                // sets are stored sorted and deduplicated
                let mut sorted: Vec<&Annotation> = xs.iter().collect();
                sorted.sort_by(|x, y| compare(elem, x, y, true));
                sorted.dedup_by(|x, y| compare(elem, x, y, true).is_eq());
                self.start_array(sorted.len(), true)?;
                for x in sorted {
                    self.add_annotation(elem, x)?;
                }
                self.end_array()
            }
            (Kind::Dict(key, value), Annotation::Array(kvs)) => {
                let kv_type = Type::struct_(vec![
                    crate::vtype::Field::new("key", (**key).clone()),
                    crate::vtype::Field::new("value", (**value).clone()),
                ])
                .required();
                let mut sorted: Vec<&Annotation> = kvs.iter().collect();
                sorted.sort_by(|x, y| compare(&kv_type, x, y, true));
                self.start_array(sorted.len(), true)?;
                for kv in sorted {
                    self.add_annotation(&kv_type, kv)?;
                }
                self.end_array()
            }
            (Kind::Struct(s), Annotation::Struct(values))
            | (Kind::Tuple(s), Annotation::Struct(values)) => {
                ensure!(
                    s.n_fields() == values.len(),
                    "annotation has {} fields, type {} expects {}",
                    values.len(),
                    typ,
                    s.n_fields()
                );
                let field_types: Vec<Type> =
                    s.fields().iter().map(|f| f.typ.clone()).collect();
                self.start_struct(true)?;
                for (ft, v) in field_types.iter().zip(values) {
                    self.add_annotation(ft, v)?;
                }
                self.end_struct()
            }
            (kind, a) => bail!("annotation {:?} does not inhabit type kind {:?}", a, kind),
        }
    }

    /// Finishes the build, returning the root value offset.
    pub fn end(&mut self) -> Result<usize> {
        ensure!(
            self.frames.is_empty(),
            "end() with {} unclosed containers",
            self.frames.len()
        );
        match self.start {
            Some(off) => Ok(off),
            None => bail!("end() before any value was written"),
        }
    }
}

/// Writes an annotation as a fresh value in `region`, returning its offset.
pub fn write_annotation(region: &mut Region, typ: &Type, a: &Annotation) -> Result<usize> {
    let mut rvb = RegionValueBuilder::new(region, typ);
    rvb.add_annotation(typ, a)?;
    rvb.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::view::read_annotation;
    use crate::vtype::Field;

    fn round_trip(typ: &Type, a: &Annotation) {
        let mut region = Region::new();
        let off = write_annotation(&mut region, typ, a).unwrap();
        let back = read_annotation(typ, &region, off);
        assert_eq!(&back, a, "round-trip mismatch for type {}", typ);
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(&Type::int32(), &Annotation::Int32(-7));
        round_trip(&Type::int64(), &Annotation::Int64(1 << 40));
        round_trip(&Type::float64(), &Annotation::Float64(2.5));
        round_trip(&Type::bool(), &Annotation::Bool(true));
        round_trip(&Type::str(), &Annotation::str("gattaca"));
        round_trip(&Type::binary(), &Annotation::Binary(vec![0, 255, 3]));
        round_trip(&Type::call(), &Annotation::Call(2));
    }

    #[test]
    fn struct_with_missing_field_round_trips() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32()),
            Field::new("b", Type::str()),
            Field::new("c", Type::float64()),
        ]);
        round_trip(
            &t,
            &Annotation::Struct(vec![
                Annotation::Int32(1),
                Annotation::Missing,
                Annotation::Float64(3.25),
            ]),
        );
    }

    #[test]
    fn nested_arrays_round_trip() {
        let t = Type::array(Type::array(Type::int32()));
        round_trip(
            &t,
            &Annotation::Array(vec![
                Annotation::Array(vec![Annotation::Int32(1), Annotation::Missing]),
                Annotation::Missing,
                Annotation::Array(vec![]),
            ]),
        );
    }

    #[test]
    fn locus_and_interval_round_trip() {
        round_trip(
            &Type::locus(),
            &Annotation::Locus {
                contig: "22".to_string(),
                position: 16050036,
            },
        );
        round_trip(
            &Type::interval(Type::int32().required()),
            &Annotation::Interval(Box::new(crate::interval::Interval::new(
                Annotation::Int32(5),
                Annotation::Int32(10),
                true,
                false,
            ))),
        );
    }

    #[test]
    fn set_is_stored_sorted_and_deduplicated() {
        let t = Type::set(Type::int32().required());
        let mut region = Region::new();
        let off = write_annotation(
            &mut region,
            &t,
            &Annotation::Array(vec![
                Annotation::Int32(3),
                Annotation::Int32(1),
                Annotation::Int32(3),
            ]),
        )
        .unwrap();
        let back = read_annotation(&t, &region, off);
        assert_eq!(
            back,
            Annotation::Array(vec![Annotation::Int32(1), Annotation::Int32(3)])
        );
    }

    #[test]
    fn setting_required_field_missing_is_an_error() {
        let t = Type::struct_(vec![Field::new("a", Type::int32().required())]);
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(&mut region, &t);
        rvb.start_struct(true).unwrap();
        assert!(rvb.set_missing().is_err());
    }

    #[test]
    fn add_region_value_copies_across_regions() {
        let t = Type::struct_(vec![
            Field::new("s", Type::str()),
            Field::new("xs", Type::array(Type::int32())),
        ]);
        let a = Annotation::Struct(vec![
            Annotation::str("chr1"),
            Annotation::Array(vec![Annotation::Int32(4), Annotation::Missing]),
        ]);
        let mut src = Region::new();
        let src_off = write_annotation(&mut src, &t, &a).unwrap();

        let mut dst = Region::new();
        dst.allocate(1, 13); // non-zero base so offsets differ
        let mut rvb = RegionValueBuilder::new(&mut dst, &t);
        rvb.add_region_value(&t, &src, src_off).unwrap();
        let off = rvb.end().unwrap();

        assert_eq!(read_annotation(&t, &dst, off), a);
    }

    #[test]
    fn builder_in_cleared_region_starts_at_offset_zero() {
        let t = Type::struct_(vec![Field::new("a", Type::int64().required())]);
        let mut region = Region::new();
        region.allocate(1, 57);
        region.clear();
        let off =
            write_annotation(&mut region, &t, &Annotation::Struct(vec![Annotation::Int64(9)]))
                .unwrap();
        assert_eq!(off, 0);
    }
}
