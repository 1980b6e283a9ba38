//! Extended orderings over annotations and over raw region values.
//!
//! Both orderings are total. Missing sorts greatest or least per the
//! `missing_greatest` flag, applied at every nesting level. Floats use the
//! IEEE total order so sorting is deterministic in the presence of NaN.
//! Interval values order by (start, !includesStart, end, includesEnd);
//! structs are lexicographic over fields; arrays are elementwise with length
//! as the tiebreak.
//!
//! The region-value ordering compares two (region, offset) pairs without
//! materializing annotations and must agree with the logical ordering on any
//! value written by the row builder.

use std::cmp::Ordering;

use crate::region::Region;
use crate::vtype::{Annotation, Kind, Type};

/// Compares two annotations of the same logical type.
pub fn compare(typ: &Type, a: &Annotation, b: &Annotation, missing_greatest: bool) -> Ordering {
    match (a, b) {
        (Annotation::Missing, Annotation::Missing) => Ordering::Equal,
        (Annotation::Missing, _) => missing_side(missing_greatest),
        (_, Annotation::Missing) => missing_side(missing_greatest).reverse(),
        _ => compare_defined(typ, a, b, missing_greatest),
    }
}

fn missing_side(missing_greatest: bool) -> Ordering {
    if missing_greatest {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

fn compare_defined(typ: &Type, a: &Annotation, b: &Annotation, mg: bool) -> Ordering {
    match (&typ.kind, a, b) {
        (Kind::Bool, Annotation::Bool(x), Annotation::Bool(y)) => x.cmp(y),
        (Kind::Int32, Annotation::Int32(x), Annotation::Int32(y)) => x.cmp(y),
        (Kind::Int64, Annotation::Int64(x), Annotation::Int64(y)) => x.cmp(y),
        (Kind::Float32, Annotation::Float32(x), Annotation::Float32(y)) => x.total_cmp(y),
        (Kind::Float64, Annotation::Float64(x), Annotation::Float64(y)) => x.total_cmp(y),
        (Kind::Str, Annotation::Str(x), Annotation::Str(y)) => x.cmp(y),
        (Kind::Binary, Annotation::Binary(x), Annotation::Binary(y)) => x.cmp(y),
        (Kind::Call, Annotation::Call(x), Annotation::Call(y)) => x.cmp(y),
        (
            Kind::Locus,
            Annotation::Locus {
                contig: c1,
                position: p1,
            },
            Annotation::Locus {
                contig: c2,
                position: p2,
            },
        ) => c1.cmp(c2).then_with(|| p1.cmp(p2)),
        (Kind::Interval(point), Annotation::Interval(x), Annotation::Interval(y)) => {
            compare(point, &x.start, &y.start, mg)
                .then_with(|| (!x.includes_start).cmp(&!y.includes_start))
                .then_with(|| compare(point, &x.end, &y.end, mg))
                .then_with(|| x.includes_end.cmp(&y.includes_end))
        }
        (Kind::Array(elem), Annotation::Array(xs), Annotation::Array(ys))
        | (Kind::Set(elem), Annotation::Array(xs), Annotation::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let c = compare(elem, x, y, mg);
                if c != Ordering::Equal {
                    return c;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Kind::Dict(..), Annotation::Array(_), Annotation::Array(_)) => {
            let fund = typ.fundamental();
            let elem = fund.element_type().expect("dict fundamental");
            compare_defined(&Type::array(elem.clone()), a, b, mg)
        }
        (Kind::Struct(s), Annotation::Struct(xs), Annotation::Struct(ys))
        | (Kind::Tuple(s), Annotation::Struct(xs), Annotation::Struct(ys)) => {
            for (field, (x, y)) in s.fields().iter().zip(xs.iter().zip(ys.iter())) {
                let c = compare(&field.typ, x, y, mg);
                if c != Ordering::Equal {
                    return c;
                }
            }
            Ordering::Equal
        }
        _ => panic!(
            "annotation does not inhabit type {} in comparison: {:?} vs {:?}",
            typ, a, b
        ),
    }
}

/// Compares two region values of the same logical type without
/// materializing them. Agrees with [`compare`] on any value produced by the
/// row builder.
///
/// Offsets address the value itself: for pointer kinds (strings, binaries,
/// arrays) the offset is the content start, matching what `load_field`
/// returns.
pub fn compare_regions(
    typ: &Type,
    r1: &Region,
    o1: usize,
    r2: &Region,
    o2: usize,
    missing_greatest: bool,
) -> Ordering {
    let mg = missing_greatest;
    match &typ.kind {
        Kind::Bool => r1.load_bool(o1).cmp(&r2.load_bool(o2)),
        Kind::Int32 | Kind::Call => r1.load_i32(o1).cmp(&r2.load_i32(o2)),
        Kind::Int64 => r1.load_i64(o1).cmp(&r2.load_i64(o2)),
        Kind::Float32 => r1.load_f32(o1).total_cmp(&r2.load_f32(o2)),
        Kind::Float64 => r1.load_f64(o1).total_cmp(&r2.load_f64(o2)),
        Kind::Str | Kind::Binary => {
            let l1 = r1.load_i32(o1) as usize;
            let l2 = r2.load_i32(o2) as usize;
            r1.load_bytes(o1 + 4, l1).cmp(r2.load_bytes(o2 + 4, l2))
        }
        Kind::Locus => {
            // fundamental field order (contig, position) is the sort order
            let fund = typ.fundamental();
            let s = fund.as_struct().expect("locus fundamental");
            compare_struct_fields(s, &[0, 1], &[false, false], r1, o1, r2, o2, mg)
        }
        Kind::Interval(_) => {
            // (start, !includesStart, end, includesEnd): field 2 inverted,
            // fields visited out of layout order
            let fund = typ.fundamental();
            let s = fund.as_struct().expect("interval fundamental");
            compare_struct_fields(s, &[0, 2, 1, 3], &[false, true, false, false], r1, o1, r2, o2, mg)
        }
        Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
            let fund = typ.fundamental();
            let elem = fund.element_type().expect("array fundamental");
            let l1 = r1.load_i32(o1) as usize;
            let l2 = r2.load_i32(o2) as usize;
            for i in 0..l1.min(l2) {
                let d1 = elem.required || !r1.load_bit(o1 + 4, i);
                let d2 = elem.required || !r2.load_bit(o2 + 4, i);
                let c = match (d1, d2) {
                    (false, false) => Ordering::Equal,
                    (false, true) => missing_side(mg),
                    (true, false) => missing_side(mg).reverse(),
                    (true, true) => {
                        let s1 = fund.array_element_offset(o1, l1, i);
                        let s2 = fund.array_element_offset(o2, l2, i);
                        compare_regions(elem, r1, deref(elem, r1, s1), r2, deref(elem, r2, s2), mg)
                    }
                };
                if c != Ordering::Equal {
                    return c;
                }
            }
            l1.cmp(&l2)
        }
        Kind::Struct(s) | Kind::Tuple(s) => {
            for i in 0..s.n_fields() {
                let ft = s.field_type(i);
                let d1 = is_field_defined_raw(s, r1, o1, i);
                let d2 = is_field_defined_raw(s, r2, o2, i);
                let c = match (d1, d2) {
                    (false, false) => Ordering::Equal,
                    (false, true) => missing_side(mg),
                    (true, false) => missing_side(mg).reverse(),
                    (true, true) => {
                        let s1 = o1 + s.field_offset(i);
                        let s2 = o2 + s.field_offset(i);
                        compare_regions(ft, r1, deref(ft, r1, s1), r2, deref(ft, r2, s2), mg)
                    }
                };
                if c != Ordering::Equal {
                    return c;
                }
            }
            Ordering::Equal
        }
    }
}

/// Compares selected fields of a struct layout in the given visit order,
/// optionally inverting Bool fields.
#[allow(clippy::too_many_arguments)]
fn compare_struct_fields(
    s: &crate::vtype::StructType,
    order: &[usize],
    invert: &[bool],
    r1: &Region,
    o1: usize,
    r2: &Region,
    o2: usize,
    mg: bool,
) -> Ordering {
    for (&i, &inv) in order.iter().zip(invert) {
        let ft = s.field_type(i);
        let d1 = is_field_defined_raw(s, r1, o1, i);
        let d2 = is_field_defined_raw(s, r2, o2, i);
        let c = match (d1, d2) {
            (false, false) => Ordering::Equal,
            (false, true) => missing_side(mg),
            (true, false) => missing_side(mg).reverse(),
            (true, true) => {
                let s1 = o1 + s.field_offset(i);
                let s2 = o2 + s.field_offset(i);
                let c = compare_regions(ft, r1, deref(ft, r1, s1), r2, deref(ft, r2, s2), mg);
                if inv {
                    c.reverse()
                } else {
                    c
                }
            }
        };
        if c != Ordering::Equal {
            return c;
        }
    }
    Ordering::Equal
}

fn deref(t: &Type, region: &Region, slot: usize) -> usize {
    if t.is_pointer() {
        region.load_offset(slot)
    } else {
        slot
    }
}

fn is_field_defined_raw(s: &crate::vtype::StructType, region: &Region, off: usize, i: usize) -> bool {
    match s.missing_idx(i) {
        None => true,
        Some(bit) => !region.load_bit(off, bit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::vtype::Field;

    #[test]
    fn missing_sorts_per_flag() {
        let t = Type::int32();
        let m = Annotation::Missing;
        let v = Annotation::Int32(3);
        assert_eq!(compare(&t, &m, &v, true), Ordering::Greater);
        assert_eq!(compare(&t, &m, &v, false), Ordering::Less);
        assert_eq!(compare(&t, &m, &m, true), Ordering::Equal);
    }

    #[test]
    fn struct_ordering_is_lexicographic() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32()),
            Field::new("b", Type::str()),
        ]);
        let x = Annotation::Struct(vec![Annotation::Int32(1), Annotation::str("z")]);
        let y = Annotation::Struct(vec![Annotation::Int32(2), Annotation::str("a")]);
        assert_eq!(compare(&t, &x, &y, true), Ordering::Less);
        let z = Annotation::Struct(vec![Annotation::Int32(1), Annotation::str("a")]);
        assert_eq!(compare(&t, &x, &z, true), Ordering::Greater);
    }

    #[test]
    fn interval_ordering_prefers_inclusive_start() {
        let t = Type::interval(Type::int32().required());
        let a = Annotation::Interval(Box::new(Interval::new(
            Annotation::Int32(0),
            Annotation::Int32(10),
            true,
            false,
        )));
        let b = Annotation::Interval(Box::new(Interval::new(
            Annotation::Int32(0),
            Annotation::Int32(10),
            false,
            false,
        )));
        assert_eq!(compare(&t, &a, &b, true), Ordering::Less);
    }

    #[test]
    fn array_ordering_breaks_ties_by_length() {
        let t = Type::array(Type::int32().required());
        let a = Annotation::Array(vec![Annotation::Int32(1), Annotation::Int32(2)]);
        let b = Annotation::Array(vec![Annotation::Int32(1)]);
        assert_eq!(compare(&t, &a, &b, true), Ordering::Greater);
    }
}
