//! # Row Value Round-Trip and Ordering Agreement
//!
//! For any type-checked annotation, write-then-read through the row builder
//! must reproduce a structurally equal annotation, and the raw region
//! ordering must agree with the logical ordering on the written values.

use gnomon::interval::Interval;
use gnomon::region::builder::write_annotation;
use gnomon::region::view::read_annotation;
use gnomon::region::Region;
use gnomon::vtype::{compare, compare_regions};
use gnomon::{Annotation, Field, Type};

fn value_matrix() -> Vec<(Type, Vec<Annotation>)> {
    vec![
        (
            Type::int32(),
            vec![
                Annotation::Int32(-5),
                Annotation::Int32(0),
                Annotation::Int32(7),
            ],
        ),
        (
            Type::str(),
            vec![
                Annotation::str(""),
                Annotation::str("a"),
                Annotation::str("ab"),
                Annotation::str("b"),
            ],
        ),
        (
            Type::struct_(vec![
                Field::new("contig", Type::str().required()),
                Field::new("pos", Type::int32()),
            ]),
            vec![
                Annotation::Struct(vec![Annotation::str("1"), Annotation::Int32(100)]),
                Annotation::Struct(vec![Annotation::str("1"), Annotation::Missing]),
                Annotation::Struct(vec![Annotation::str("2"), Annotation::Int32(5)]),
            ],
        ),
        (
            Type::array(Type::int32()),
            vec![
                Annotation::Array(vec![]),
                Annotation::Array(vec![Annotation::Int32(1)]),
                Annotation::Array(vec![Annotation::Int32(1), Annotation::Missing]),
                Annotation::Array(vec![Annotation::Int32(2)]),
            ],
        ),
        (
            Type::interval(Type::int32().required()),
            vec![
                Annotation::Interval(Box::new(Interval::new(
                    Annotation::Int32(0),
                    Annotation::Int32(5),
                    true,
                    false,
                ))),
                Annotation::Interval(Box::new(Interval::new(
                    Annotation::Int32(0),
                    Annotation::Int32(9),
                    false,
                    true,
                ))),
                Annotation::Interval(Box::new(Interval::new(
                    Annotation::Int32(3),
                    Annotation::Int32(4),
                    true,
                    true,
                ))),
            ],
        ),
    ]
}

#[test]
fn write_then_read_is_identity() {
    for (t, values) in value_matrix() {
        for a in &values {
            assert!(t.type_check(a), "matrix value must inhabit {}", t);
            let mut region = Region::new();
            let off = write_annotation(&mut region, &t, a).expect("write");
            assert_eq!(&read_annotation(&t, &region, off), a, "type {}", t);
        }
    }
}

#[test]
fn region_ordering_agrees_with_logical_ordering() {
    for (t, values) in value_matrix() {
        let mut region = Region::new();
        let offsets: Vec<usize> = values
            .iter()
            .map(|a| write_annotation(&mut region, &t, a).expect("write"))
            .collect();
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                let logical = compare(&t, a, b, true);
                let raw = compare_regions(&t, &region, offsets[i], &region, offsets[j], true);
                assert_eq!(
                    logical, raw,
                    "orderings disagree on {} for {:?} vs {:?}",
                    t, a, b
                );
            }
        }
    }
}
