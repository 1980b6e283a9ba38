//! # Ordered Merge Join Tests
//!
//! Verifies the join multiset law: for every key, the output rows equal the
//! chosen join type's definition against the two inputs restricted to that
//! key. Expected results are computed by brute force over the materialized
//! inputs and compared as sorted multisets.

mod common;

use common::ordered_from_rows;
use gnomon::{Annotation, JoinKind, OrderedDataset};

fn left_input() -> OrderedDataset {
    // duplicate key 2 on the left
    ordered_from_rows(vec![(1, 10), (2, 20), (2, 21), (4, 40)], 2)
}

fn right_rows() -> Vec<(i32, i32)> {
    // duplicate key 2 on the right, plus keys outside the left range
    vec![(2, 200), (2, 201), (3, 300), (5, 500)]
}

/// The right side carries its value as `w` so join outputs have distinct
/// field names.
fn right_input() -> OrderedDataset {
    build_right(right_rows())
}

fn build_right(rows: Vec<(i32, i32)>) -> OrderedDataset {
    use gnomon::backend::Backend;
    use gnomon::{coerce, Field, LocalBackend, OrderedKeyedType, Type};
    let backend = LocalBackend::new();
    let row_type = Type::struct_(vec![
        Field::new("k", Type::int32().required()),
        Field::new("w", Type::int32().required()),
    ])
    .required();
    let typ = OrderedKeyedType::new(row_type.clone(), vec!["k".to_string()], 1).expect("typ");
    let annotations = rows
        .into_iter()
        .map(|(k, w)| Annotation::Struct(vec![Annotation::Int32(k), Annotation::Int32(w)]))
        .collect();
    let stream = backend
        .parallelize(&row_type, annotations, 2)
        .expect("parallelize");
    coerce(typ, backend, stream, 0).expect("coerce")
}

type JoinRow = (i32, Option<i32>, Option<i32>);

fn expected_join(kind: JoinKind) -> Vec<JoinRow> {
    let left = vec![(1, 10), (2, 20), (2, 21), (4, 40)];
    let right = right_rows();
    let mut out: Vec<JoinRow> = Vec::new();
    for &(lk, lv) in &left {
        let matches: Vec<i32> = right
            .iter()
            .filter(|&&(rk, _)| rk == lk)
            .map(|&(_, rv)| rv)
            .collect();
        if matches.is_empty() {
            if matches!(kind, JoinKind::Left | JoinKind::Outer) {
                out.push((lk, Some(lv), None));
            }
        } else {
            for rv in matches {
                out.push((lk, Some(lv), Some(rv)));
            }
        }
    }
    if matches!(kind, JoinKind::Right | JoinKind::Outer) {
        for &(rk, rv) in &right {
            if !left.iter().any(|&(lk, _)| lk == rk) {
                out.push((rk, None, Some(rv)));
            }
        }
    }
    out.sort_unstable();
    out
}

fn materialize_join(ds: &OrderedDataset) -> Vec<JoinRow> {
    let mut out: Vec<JoinRow> = ds
        .collect()
        .expect("collect")
        .iter()
        .map(|row| {
            let f = row.as_struct().expect("struct");
            let opt = |a: &Annotation| match a {
                Annotation::Missing => None,
                other => Some(other.as_int32().expect("int")),
            };
            (f[0].as_int32().expect("k"), opt(&f[1]), opt(&f[2]))
        })
        .collect();
    out.sort_unstable();
    out
}

#[test]
fn inner_join_crosses_equal_key_runs() {
    let joined = left_input()
        .ordered_join(&right_input(), JoinKind::Inner)
        .expect("join");
    assert_eq!(materialize_join(&joined), expected_join(JoinKind::Inner));
    // 2 left rows x 2 right rows on key 2
    assert_eq!(joined.count().expect("count"), 4);
}

#[test]
fn left_join_keeps_unmatched_left_rows_with_missing_right() {
    let joined = left_input()
        .ordered_join(&right_input(), JoinKind::Left)
        .expect("join");
    assert_eq!(materialize_join(&joined), expected_join(JoinKind::Left));
}

#[test]
fn right_join_keeps_unmatched_right_rows_with_missing_left() {
    let joined = left_input()
        .ordered_join(&right_input(), JoinKind::Right)
        .expect("join");
    assert_eq!(materialize_join(&joined), expected_join(JoinKind::Right));
}

#[test]
fn outer_join_keeps_both_sides() {
    let joined = left_input()
        .ordered_join(&right_input(), JoinKind::Outer)
        .expect("join");
    assert_eq!(materialize_join(&joined), expected_join(JoinKind::Outer));
}

#[test]
fn distinct_join_collapses_duplicate_right_keys() {
    let joined = left_input()
        .ordered_join_distinct(&right_input(), JoinKind::Left)
        .expect("join");
    let got = materialize_join(&joined);
    // key 2: each left row pairs the run's first right row only
    let expected = vec![
        (1, Some(10), None),
        (2, Some(20), Some(200)),
        (2, Some(21), Some(200)),
        (4, Some(40), None),
    ];
    assert_eq!(got, expected);
}

#[test]
fn distinct_join_rejects_right_and_outer_kinds() {
    assert!(left_input()
        .ordered_join_distinct(&right_input(), JoinKind::Outer)
        .is_err());
}

#[test]
fn join_rejects_colliding_value_field_names() {
    // both sides carry a value field named `v`
    let a = ordered_from_rows(vec![(1, 10)], 1);
    let b = ordered_from_rows(vec![(1, 20)], 1);
    let err = a.ordered_join(&b, JoinKind::Inner).unwrap_err();
    assert!(err.to_string().contains("both sides"), "got: {}", err);
}

#[test]
fn zip_join_pairs_keys_without_cross_products() {
    let joined = left_input()
        .ordered_zip_join(&right_input())
        .expect("zip join");
    // keys: 1 (left only), 2, 2 (paired), 3 (right only), 4 (left only),
    // 5 (right only)
    assert_eq!(joined.count().expect("count"), 6);
    let rows = joined.collect().expect("collect");
    let mut paired = 0;
    for row in &rows {
        let f = row.as_struct().expect("struct");
        let has_left = f[1].is_defined();
        let has_right = f[2].is_defined();
        assert!(has_left || has_right);
        if has_left && has_right {
            paired += 1;
        }
    }
    assert_eq!(paired, 2);
}
