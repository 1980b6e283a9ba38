//! Zero-copy readers for region values.
//!
//! Offsets returned by `load_field` and `load_element` address the value
//! itself: pointer kinds are dereferenced, inline kinds resolve to their
//! slot. Accessing a field or element whose missing bit is set is undefined;
//! callers test `is_field_defined` / `is_element_defined` first.

use crate::interval::Interval;
use crate::region::Region;
use crate::vtype::{Annotation, Kind, StructType, Type};

/// Offset of field i's value, dereferencing pointer slots.
pub fn load_field(s: &StructType, region: &Region, off: usize, i: usize) -> usize {
    let slot = off + s.field_offset(i);
    if s.field_type(i).is_pointer() {
        region.load_offset(slot)
    } else {
        slot
    }
}

pub fn is_field_defined(s: &StructType, region: &Region, off: usize, i: usize) -> bool {
    match s.missing_idx(i) {
        None => true,
        Some(bit) => !region.load_bit(off, bit),
    }
}

pub fn is_field_missing(s: &StructType, region: &Region, off: usize, i: usize) -> bool {
    !is_field_defined(s, region, off, i)
}

/// Length of the array whose content starts at `aoff`.
pub fn load_length(region: &Region, aoff: usize) -> usize {
    region.load_i32(aoff) as usize
}

pub fn is_element_defined(array_type: &Type, region: &Region, aoff: usize, i: usize) -> bool {
    let elem = array_type.element_type().expect("array type");
    elem.required || !region.load_bit(aoff + 4, i)
}

/// Offset of element i's value, dereferencing pointer slots.
pub fn load_element(array_type: &Type, region: &Region, aoff: usize, len: usize, i: usize) -> usize {
    let elem = array_type.element_type().expect("array type");
    let slot = array_type.array_element_offset(aoff, len, i);
    if elem.is_pointer() {
        region.load_offset(slot)
    } else {
        slot
    }
}

/// Borrowed view of string content at a (dereferenced) string offset.
pub fn load_str(region: &Region, off: usize) -> &str {
    let len = region.load_i32(off) as usize;
    std::str::from_utf8(region.load_bytes(off + 4, len)).expect("region string is valid utf-8")
}

pub fn load_binary(region: &Region, off: usize) -> &[u8] {
    let len = region.load_i32(off) as usize;
    region.load_bytes(off + 4, len)
}

/// Materializes the value at `off` as a logical annotation.
pub fn read_annotation(t: &Type, region: &Region, off: usize) -> Annotation {
    match &t.kind {
        Kind::Bool => Annotation::Bool(region.load_bool(off)),
        Kind::Int32 => Annotation::Int32(region.load_i32(off)),
        Kind::Int64 => Annotation::Int64(region.load_i64(off)),
        Kind::Float32 => Annotation::Float32(region.load_f32(off)),
        Kind::Float64 => Annotation::Float64(region.load_f64(off)),
        Kind::Str => Annotation::Str(load_str(region, off).to_string()),
        Kind::Binary => Annotation::Binary(load_binary(region, off).to_vec()),
        Kind::Call => Annotation::Call(region.load_i32(off)),
        Kind::Locus => {
            let fund = t.fundamental();
            let s = fund.as_struct().expect("locus fundamental");
            let contig = load_str(region, load_field(s, region, off, 0)).to_string();
            let position = region.load_i32(load_field(s, region, off, 1));
            Annotation::Locus { contig, position }
        }
        Kind::Interval(point) => {
            let fund = t.fundamental();
            let s = fund.as_struct().expect("interval fundamental");
            let start = if is_field_defined(s, region, off, 0) {
                read_annotation(point, region, load_field(s, region, off, 0))
            } else {
                Annotation::Missing
            };
            let end = if is_field_defined(s, region, off, 1) {
                read_annotation(point, region, load_field(s, region, off, 1))
            } else {
                Annotation::Missing
            };
            let includes_start = region.load_bool(load_field(s, region, off, 2));
            let includes_end = region.load_bool(load_field(s, region, off, 3));
            Annotation::Interval(Box::new(Interval::new(
                start,
                end,
                includes_start,
                includes_end,
            )))
        }
        Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
            let fund = t.fundamental();
            let elem = fund.element_type().expect("array fundamental");
            let logical_elem = logical_element_type(t);
            let len = load_length(region, off);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                if is_element_defined(&fund, region, off, i) {
                    let eoff = load_element(&fund, region, off, len, i);
                    out.push(read_annotation(logical_elem.as_ref().unwrap_or(elem), region, eoff));
                } else {
                    out.push(Annotation::Missing);
                }
            }
            Annotation::Array(out)
        }
        Kind::Struct(s) | Kind::Tuple(s) => {
            let mut out = Vec::with_capacity(s.n_fields());
            for i in 0..s.n_fields() {
                if is_field_defined(s, region, off, i) {
                    let foff = load_field(s, region, off, i);
                    out.push(read_annotation(s.field_type(i), region, foff));
                } else {
                    out.push(Annotation::Missing);
                }
            }
            Annotation::Struct(out)
        }
    }
}

// Set elements keep their logical type; Dict elements materialize as the
// fundamental key/value struct.
fn logical_element_type(t: &Type) -> Option<Type> {
    match &t.kind {
        Kind::Array(e) | Kind::Set(e) => Some((**e).clone()),
        _ => None,
    }
}
