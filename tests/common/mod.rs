//! Shared helpers for ordered-dataset integration tests.
#![allow(dead_code)]

use std::rc::Rc;

use gnomon::backend::Backend;
use gnomon::{coerce, Annotation, Field, LocalBackend, OrderedDataset, OrderedKeyedType, Type};

/// Row type Struct{k: +Int32, v: +Int32} keyed and partitioned by `k`.
pub fn int_keyed_type() -> OrderedKeyedType {
    let row = Type::struct_(vec![
        Field::new("k", Type::int32().required()),
        Field::new("v", Type::int32().required()),
    ])
    .required();
    OrderedKeyedType::new(row, vec!["k".to_string()], 1).expect("keyed type")
}

pub fn int_row(k: i32, v: i32) -> Annotation {
    Annotation::Struct(vec![Annotation::Int32(k), Annotation::Int32(v)])
}

/// Coerces (k, v) rows spread over `n_parts` input partitions into an
/// ordered dataset.
pub fn ordered_from_rows(rows: Vec<(i32, i32)>, n_parts: usize) -> OrderedDataset {
    let backend = LocalBackend::new();
    let typ = int_keyed_type();
    let annotations: Vec<Annotation> = rows.iter().map(|&(k, v)| int_row(k, v)).collect();
    let stream = backend
        .parallelize(typ.row_type(), annotations, n_parts)
        .expect("parallelize");
    coerce(typ, backend, stream, 42).expect("coerce")
}

/// Materializes (k, v) pairs back out of a dataset of the int keyed type.
pub fn collect_pairs(ds: &OrderedDataset) -> Vec<(i32, i32)> {
    ds.collect()
        .expect("collect")
        .into_iter()
        .map(|row| {
            let fields = row.as_struct().expect("row struct").to_vec();
            (
                fields[0].as_int32().expect("k"),
                fields[1].as_int32().expect("v"),
            )
        })
        .collect()
}

/// Checks the ordered-dataset invariant directly: per-partition key
/// monotonicity and partition-key membership in the assigned bound.
pub fn assert_ordered_invariant(ds: &OrderedDataset) {
    let typ = ds.typ().clone();
    let pk_type = typ.pk_type();
    let bounds = ds.partitioner().range_bounds().to_vec();
    for (i, factory) in ds.stream().parts.iter().enumerate() {
        let mut cursor = factory().expect("open partition");
        let mut prev: Option<Annotation> = None;
        while cursor.advance().expect("advance") {
            let (region, off) = cursor.current();
            let pk = typ.pk_of_row(region, off);
            assert!(
                bounds[i].contains(&pk_type, &pk),
                "partition {}: pk {:?} outside bound",
                i,
                pk
            );
            if let Some(p) = &prev {
                assert!(
                    gnomon::vtype::compare(&pk_type, p, &pk, true) != std::cmp::Ordering::Greater,
                    "partition {}: pk order regressed",
                    i
                );
            }
            prev = Some(pk);
        }
    }
}

/// A dataset aligned to an explicit partitioner, for tests that need two
/// identically-partitioned inputs.
pub fn aligned_to(
    ds: &OrderedDataset,
    partitioner: std::sync::Arc<gnomon::OrderedPartitioner>,
) -> OrderedDataset {
    ds.constrain_to_partitioner(partitioner).expect("constrain")
}

#[allow(dead_code)]
pub fn backend() -> Rc<LocalBackend> {
    LocalBackend::new()
}
