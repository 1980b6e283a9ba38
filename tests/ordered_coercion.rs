//! # Ordered Coercion Integration Tests
//!
//! Exercises the three construction strategies for an ordered dataset:
//! AS_IS for fully sorted non-overlapping input, LOCAL_SORT when partition
//! keys are grouped but runs are internally unsorted, and SHUFFLE for
//! everything else. Each result is checked against the dataset invariant
//! directly: per-partition monotonicity and bound membership.

mod common;

use common::{assert_ordered_invariant, collect_pairs, ordered_from_rows};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[test]
fn shuffled_input_takes_the_shuffle_path() {
    // 10 input partitions of fully shuffled keys over an Int32 pk
    let mut rows: Vec<(i32, i32)> = (0..1000).map(|k| (k, k * 7)).collect();
    rows.shuffle(&mut StdRng::seed_from_u64(7));
    let ds = ordered_from_rows(rows, 10);

    assert_eq!(ds.n_partitions(), 10);
    let range = ds.partitioner().range().expect("non-empty range");
    assert_eq!(
        range.start,
        gnomon::Annotation::Struct(vec![gnomon::Annotation::Int32(0)])
    );
    assert_eq!(
        range.end,
        gnomon::Annotation::Struct(vec![gnomon::Annotation::Int32(999)])
    );
    assert!(range.includes_start && range.includes_end);

    assert_ordered_invariant(&ds);
    let got = collect_pairs(&ds);
    let expected: Vec<(i32, i32)> = (0..1000).map(|k| (k, k * 7)).collect();
    assert_eq!(got, expected);
}

#[test]
fn sorted_non_overlapping_input_is_adopted_as_is() {
    // 4 partitions already in global key order
    let rows: Vec<(i32, i32)> = (0..400).map(|k| (k, -k)).collect();
    let ds = ordered_from_rows(rows.clone(), 4);
    assert_eq!(ds.n_partitions(), 4);
    assert_ordered_invariant(&ds);
    assert_eq!(collect_pairs(&ds), rows);
}

#[test]
fn boundary_equal_partitions_are_adjusted_not_shuffled() {
    // partition 0 ends with key 99; partition 1 begins with more key-99 rows
    let mut rows: Vec<(i32, i32)> = (0..100).map(|k| (k, 0)).collect();
    rows.push((99, 1));
    rows.push((99, 2));
    rows.extend((100..200).map(|k| (k, 0)));
    // 202 rows over 2 partitions of 101 each: the boundary key straddles
    let ds = ordered_from_rows(rows, 2);
    assert_ordered_invariant(&ds);
    assert_eq!(ds.count().expect("count"), 202);
    let keys: Vec<i32> = collect_pairs(&ds).iter().map(|&(k, _)| k).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
}

#[test]
fn pk_grouped_but_key_unsorted_input_gets_a_local_sort() {
    // key = (k, v), partition key = k: rows arrive grouped and sorted by k,
    // but v is out of order inside each k-run
    use gnomon::backend::Backend;
    use gnomon::{coerce, Field, LocalBackend, OrderedKeyedType, Type};

    let row = Type::struct_(vec![
        Field::new("k", Type::int32().required()),
        Field::new("v", Type::int32().required()),
    ])
    .required();
    let typ =
        OrderedKeyedType::new(row.clone(), vec!["k".to_string(), "v".to_string()], 1).unwrap();

    let mut rows = Vec::new();
    for k in 0..20 {
        for v in [3, 1, 2] {
            rows.push(gnomon::Annotation::Struct(vec![
                gnomon::Annotation::Int32(k),
                gnomon::Annotation::Int32(v),
            ]));
        }
    }
    let backend = LocalBackend::new();
    let stream = backend.parallelize(&row, rows, 2).unwrap();
    let ds = coerce(typ, backend, stream, 0).unwrap();

    assert_ordered_invariant(&ds);
    let got = collect_pairs(&ds);
    let mut expected = Vec::new();
    for k in 0..20 {
        for v in [1, 2, 3] {
            expected.push((k, v));
        }
    }
    assert_eq!(got, expected);
}

#[test]
fn coercion_of_empty_input_yields_an_empty_dataset() {
    let ds = ordered_from_rows(Vec::new(), 4);
    assert_eq!(ds.n_partitions(), 0);
    assert!(ds.partitioner().range().is_none());
    assert!(collect_pairs(&ds).is_empty());
}

#[test]
fn single_partition_unsorted_input_round_trips() {
    let rows = vec![(5, 50), (1, 10), (3, 30), (2, 20), (4, 40)];
    let ds = ordered_from_rows(rows, 1);
    assert_ordered_invariant(&ds);
    assert_eq!(
        collect_pairs(&ds),
        vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]
    );
}

#[test]
fn duplicate_keys_survive_coercion_with_count_preserved() {
    let mut rows = Vec::new();
    for k in 0..50 {
        for dup in 0..4 {
            rows.push((k % 10, dup));
        }
    }
    rows.shuffle(&mut StdRng::seed_from_u64(3));
    let n = rows.len();
    let ds = ordered_from_rows(rows, 5);
    assert_ordered_invariant(&ds);
    assert_eq!(ds.count().expect("count"), n);
}
