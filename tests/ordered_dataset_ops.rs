//! # Ordered Dataset Operation Tests
//!
//! Covers partitioner-preserving operations (map, filter, group-by-key,
//! distinct, sorted union) and the deterministic repartitioning family
//! (head, coalesce, subset). The sorted-union scenario mirrors a genomic
//! layout: keys of (contig, position) split at fixed positions.

mod common;

use std::rc::Rc;
use std::sync::Arc;

use bumpalo::Bump;
use common::{assert_ordered_invariant, collect_pairs, int_keyed_type, ordered_from_rows};
use gnomon::backend::Backend;
use gnomon::interval::Interval;
use gnomon::ir::{compile, FunctionRegistry, IrBuilder};
use gnomon::{
    coerce, Annotation, Field, LocalBackend, OrderedDataset, OrderedKeyedType,
    OrderedPartitioner, Type,
};

#[test]
fn head_truncates_rows_and_range_bounds_together() {
    let rows: Vec<(i32, i32)> = (0..100).map(|k| (k, k)).collect();
    let ds = ordered_from_rows(rows, 5);
    let h = ds.head(37).expect("head");
    assert_eq!(h.count().expect("count"), 37);
    assert!(h.n_partitions() <= ds.n_partitions());
    assert_ordered_invariant(&h);
    assert_eq!(
        collect_pairs(&h),
        (0..37).map(|k| (k, k)).collect::<Vec<_>>()
    );

    // head past the end keeps everything
    assert_eq!(ds.head(1_000_000).expect("head").count().expect("count"), 100);
}

#[test]
fn coalesce_at_or_above_current_count_is_identity() {
    let ds = ordered_from_rows((0..60).map(|k| (k, 0)).collect(), 6);
    let same = ds.coalesce(6, false).expect("coalesce");
    assert_eq!(same.n_partitions(), 6);
    assert_eq!(collect_pairs(&same), collect_pairs(&ds));
}

#[test]
fn coalesce_below_current_count_balances_without_losing_rows() {
    let ds = ordered_from_rows((0..90).map(|k| (k, k)).collect(), 9);
    let c = ds.coalesce(4, false).expect("coalesce");
    assert!(c.n_partitions() <= 4);
    assert_eq!(c.count().expect("count"), 90);
    assert_ordered_invariant(&c);
    assert_eq!(collect_pairs(&c), collect_pairs(&ds));
}

#[test]
fn shuffling_coalesce_rebalances_and_preserves_content() {
    let ds = ordered_from_rows((0..200).map(|k| (k, k)).collect(), 10);
    let c = ds.coalesce(3, true).expect("coalesce");
    assert!(c.n_partitions() <= 3);
    assert_ordered_invariant(&c);
    assert_eq!(collect_pairs(&c), collect_pairs(&ds));
}

#[test]
fn subset_partitions_keeps_only_selected_ranges() {
    let ds = ordered_from_rows((0..100).map(|k| (k, 0)).collect(), 5);
    let expected: usize = {
        let counts = ds.partition_counts().expect("counts");
        counts[1] + counts[3]
    };
    let s = ds.subset_partitions(&[1, 3]).expect("subset");
    assert_eq!(s.n_partitions(), 2);
    assert_eq!(s.count().expect("count"), expected);
    assert_ordered_invariant(&s);
}

#[test]
fn group_by_key_emits_one_row_per_run() {
    let mut rows = Vec::new();
    for k in 0..20 {
        for dup in 0..3 {
            rows.push((k, dup * 100));
        }
    }
    let ds = ordered_from_rows(rows, 4);
    let grouped = ds.group_by_key("values").expect("group");
    assert_eq!(grouped.count().expect("count"), 20);
    for row in grouped.collect().expect("collect") {
        let fields = row.as_struct().expect("struct");
        let values = fields[1].as_array().expect("values array");
        assert_eq!(values.len(), 3, "every key has exactly three rows");
    }
}

#[test]
fn distinct_by_key_keeps_first_of_each_run() {
    let rows = vec![(1, 10), (1, 11), (2, 20), (3, 30), (3, 31), (3, 32)];
    let ds = ordered_from_rows(rows, 2);
    let d = ds.distinct_by_key().expect("distinct");
    assert_eq!(collect_pairs(&d), vec![(1, 10), (2, 20), (3, 30)]);
}

#[test]
fn filter_through_a_compiled_predicate() {
    let ds = ordered_from_rows((0..50).map(|k| (k, k)).collect(), 4);
    let arena = Bump::new();
    let b = IrBuilder::new(&arena);
    // keep rows with v % 2 == 0
    let pred_ir = b.compare(
        gnomon::ir::ComparisonOp::Eq,
        b.binary(
            gnomon::ir::BinaryOp::Remainder,
            b.get_field(b.in_(0), "v"),
            b.i32(2),
        ),
        b.i32(0),
    );
    let registry = FunctionRegistry::with_defaults();
    let pred = compile(&registry, &[ds.typ().row_type().clone()], pred_ir).expect("compile");
    let filtered = ds.filter(Rc::new(pred)).expect("filter");
    assert_eq!(
        collect_pairs(&filtered),
        (0..50)
            .filter(|k| k % 2 == 0)
            .map(|k| (k, k))
            .collect::<Vec<_>>()
    );
}

#[test]
fn map_rows_preserving_holds_the_ordering_invariant() {
    let ds = ordered_from_rows((0..40).map(|k| (k, k)).collect(), 4);
    let arena = Bump::new();
    let b = IrBuilder::new(&arena);
    // key-preserving transform: v := v * 10
    let mapped_ir = b.insert_fields(
        b.in_(0),
        vec![(
            "v",
            b.binary(
                gnomon::ir::BinaryOp::Multiply,
                b.get_field(b.in_(0), "v"),
                b.i32(10),
            ),
        )],
    );
    let registry = FunctionRegistry::with_defaults();
    let routine = compile(&registry, &[ds.typ().row_type().clone()], mapped_ir).expect("compile");
    let new_row = routine.typ().clone();
    let new_typ = OrderedKeyedType::new(new_row, vec!["k".to_string()], 1).expect("typ");
    let mapped = ds
        .map_rows_preserving(new_typ, Rc::new(routine))
        .expect("map");
    assert_ordered_invariant(&mapped);
    assert_eq!(
        collect_pairs(&mapped),
        (0..40).map(|k| (k, k * 10)).collect::<Vec<_>>()
    );
}

#[test]
fn sample_is_deterministic_and_partitioner_preserving() {
    let ds = ordered_from_rows((0..500).map(|k| (k, 0)).collect(), 5);
    let s1 = ds.sample(0.2, 99).expect("sample");
    let s2 = ds.sample(0.2, 99).expect("sample");
    assert_eq!(collect_pairs(&s1), collect_pairs(&s2));
    assert_eq!(s1.n_partitions(), ds.n_partitions());
    let n = s1.count().expect("count");
    assert!(n > 20 && n < 250, "sample of ~100 rows, got {}", n);
}

// --- genomic sorted-union scenario: PK = (contig, position) ---

fn locus_keyed_type() -> OrderedKeyedType {
    let row = Type::struct_(vec![
        Field::new("contig", Type::str().required()),
        Field::new("position", Type::int32().required()),
        Field::new("side", Type::int32().required()),
    ])
    .required();
    OrderedKeyedType::new(
        row,
        vec!["contig".to_string(), "position".to_string()],
        2,
    )
    .expect("keyed type")
}

fn locus_pk(contig: &str, position: i32) -> Annotation {
    Annotation::Struct(vec![Annotation::str(contig), Annotation::Int32(position)])
}

fn locus_rows(positions: impl Iterator<Item = i32>, side: i32) -> Vec<Annotation> {
    positions
        .map(|p| {
            Annotation::Struct(vec![
                Annotation::str("1"),
                Annotation::Int32(p),
                Annotation::Int32(side),
            ])
        })
        .collect()
}

#[test]
fn partition_sorted_union_interleaves_identically_partitioned_inputs() {
    let backend = LocalBackend::new();
    let typ = locus_keyed_type();

    // contig "1", positions 1..=1000, split at {250, 500, 750, 1000}
    let bounds = vec![
        Interval::new(locus_pk("1", 1), locus_pk("1", 250), true, false),
        Interval::new(locus_pk("1", 250), locus_pk("1", 500), true, false),
        Interval::new(locus_pk("1", 500), locus_pk("1", 750), true, false),
        Interval::new(locus_pk("1", 750), locus_pk("1", 1000), true, true),
    ];
    let partitioner =
        Arc::new(OrderedPartitioner::new(typ.pk_type(), bounds).expect("partitioner"));

    let make = |side: i32, positions: Vec<i32>| -> OrderedDataset {
        let stream = backend
            .parallelize(typ.row_type(), locus_rows(positions.into_iter(), side), 1)
            .expect("parallelize");
        let ds = coerce(typ.clone(), backend.clone(), stream, 0).expect("coerce");
        ds.constrain_to_partitioner(partitioner.clone())
            .expect("constrain")
    };

    let evens = make(0, (1..=1000).filter(|p| p % 2 == 0).collect());
    let odds = make(1, (1..=1000).filter(|p| p % 2 == 1).collect());
    assert_eq!(evens.n_partitions(), 4);
    assert_eq!(odds.n_partitions(), 4);

    let union = evens.partition_sorted_union(&odds).expect("union");
    assert_eq!(
        union.count().expect("count"),
        evens.count().expect("count") + odds.count().expect("count")
    );
    assert_ordered_invariant(&union);

    let positions: Vec<i32> = union
        .collect()
        .expect("collect")
        .iter()
        .map(|row| row.as_struct().expect("struct")[1].as_int32().expect("pos"))
        .collect();
    assert_eq!(positions, (1..=1000).collect::<Vec<_>>());
}

#[test]
fn sorted_union_rejects_mismatched_partitioners() {
    let a = ordered_from_rows((0..100).map(|k| (k, 0)).collect(), 4);
    let b = ordered_from_rows((0..100).map(|k| (k, 0)).collect(), 2);
    assert!(a.partition_sorted_union(&b).is_err());
}

#[test]
fn dataset_aggregation_combines_partial_states_across_partitions() {
    let ds = ordered_from_rows((0..100).map(|k| (k, k)).collect(), 8);
    let arena = Bump::new();
    let b = IrBuilder::new(&arena);
    // sum(filter(v, v -> v % 2 == 0)) over the rows
    let v = b.agg_map(b.agg_in(), "row", b.get_field(b.ref_("row"), "v"));
    let even = b.agg_filter(v, "x", {
        let rem = b.binary(gnomon::ir::BinaryOp::Remainder, b.ref_("x"), b.i32(2));
        b.compare(gnomon::ir::ComparisonOp::Eq, rem, b.i32(0))
    });
    let ir = b.apply_agg_op(even, gnomon::agg::AggOp::Sum, vec![]);
    let registry = FunctionRegistry::with_defaults();
    let compiled = gnomon::ir::compile_aggregation(&registry, ds.typ().row_type(), ir)
        .expect("compile aggregation");
    let got = ds.aggregate(&compiled).expect("aggregate");
    let expected: i64 = (0..100).filter(|v| v % 2 == 0).sum();
    assert_eq!(got, Annotation::Int64(expected));
}

#[test]
fn int_keyed_type_reports_its_structure() {
    let typ = int_keyed_type();
    assert_eq!(typ.key(), &["k".to_string()]);
    assert_eq!(typ.n_partition_key(), 1);
    assert_eq!(typ.pk_type().to_string(), "+Struct{k:+Int32}");
}
