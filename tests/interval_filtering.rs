//! # Interval Filtering Tests
//!
//! A 20-partition dataset keyed by (contig, position) is filtered by query
//! intervals. Only partitions whose bounds overlap a query may be opened,
//! and every surviving row must lie inside one of the requested intervals.

mod common;

use std::rc::Rc;

use gnomon::backend::Backend;
use gnomon::interval::{Interval, IntervalTree};
use gnomon::{coerce, Annotation, Field, LocalBackend, OrderedKeyedType, Type};

fn locus_typ() -> OrderedKeyedType {
    let row = Type::struct_(vec![
        Field::new("contig", Type::str().required()),
        Field::new("position", Type::int32().required()),
    ])
    .required();
    OrderedKeyedType::new(
        row,
        vec!["contig".to_string(), "position".to_string()],
        2,
    )
    .expect("keyed type")
}

fn pk(contig: &str, position: i32) -> Annotation {
    Annotation::Struct(vec![Annotation::str(contig), Annotation::Int32(position)])
}

#[test]
fn filter_intervals_narrows_partitions_and_rows() {
    let backend = LocalBackend::new();
    let typ = locus_typ();

    // contigs 1..4, positions 1..=250 each, in key order over 20 partitions
    let mut rows = Vec::new();
    for contig in ["1", "2", "3", "4"] {
        for position in 1..=250 {
            rows.push(pk(contig, position));
        }
    }
    let stream = backend
        .parallelize(typ.row_type(), rows, 20)
        .expect("parallelize");
    let ds = coerce(typ.clone(), backend, stream, 11).expect("coerce");
    assert_eq!(ds.n_partitions(), 20);

    let queries = vec![
        Interval::new(pk("1", 100), pk("1", 200), true, true),
        Interval::new(pk("2", 50), pk("2", 150), true, true),
    ];
    let tree = Rc::new(IntervalTree::from_unsorted(
        typ.pk_type(),
        queries.iter().cloned().enumerate().map(|(i, iv)| (iv, i)).collect(),
    ));

    let overlapping = ds.partitioner().partitions_overlapping(&queries);
    let filtered = ds.filter_intervals(&tree).expect("filter_intervals");
    // only partitions the interval tree reported are loaded
    assert_eq!(filtered.n_partitions(), overlapping.len());
    assert!(filtered.n_partitions() < ds.n_partitions());

    let out = filtered.collect().expect("collect");
    // 101 positions on contig 1 plus 101 on contig 2
    assert_eq!(out.len(), 202);
    for row in out {
        let f = row.as_struct().expect("struct").to_vec();
        let contig = f[0].as_str().expect("contig").to_string();
        let position = f[1].as_int32().expect("position");
        let inside = (contig == "1" && (100..=200).contains(&position))
            || (contig == "2" && (50..=150).contains(&position));
        assert!(inside, "row ({}, {}) escaped the filter", contig, position);
    }
}

#[test]
fn disjoint_queries_produce_an_empty_dataset() {
    let backend = LocalBackend::new();
    let typ = locus_typ();
    let rows: Vec<Annotation> = (1..=100).map(|p| pk("1", p)).collect();
    let stream = backend
        .parallelize(typ.row_type(), rows, 4)
        .expect("parallelize");
    let ds = coerce(typ.clone(), backend, stream, 0).expect("coerce");

    let tree = Rc::new(IntervalTree::from_unsorted(
        typ.pk_type(),
        vec![(Interval::new(pk("9", 0), pk("9", 10), true, true), 0)],
    ));
    let filtered = ds.filter_intervals(&tree).expect("filter_intervals");
    assert_eq!(filtered.n_partitions(), 0);
    assert_eq!(filtered.count().expect("count"), 0);
}
