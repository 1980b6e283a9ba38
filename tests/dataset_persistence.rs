//! # Partition-Set Persistence Tests
//!
//! Write-then-read round trips through partition files and the JSON
//! manifest, including the range bounds and type descriptor.

mod common;

use common::{assert_ordered_invariant, collect_pairs, ordered_from_rows};
use gnomon::dataset_io::{read_dataset, write_dataset};
use gnomon::LocalBackend;
use tempfile::TempDir;

#[test]
fn write_then_read_restores_rows_bounds_and_type() {
    let ds = ordered_from_rows((0..200).map(|k| (k, k * 3)).collect(), 8);
    let dir = TempDir::new().expect("temp dir");
    write_dataset(&ds, dir.path()).expect("write");

    let restored = read_dataset(dir.path(), LocalBackend::new()).expect("read");
    assert_eq!(restored.n_partitions(), ds.n_partitions());
    assert_eq!(
        restored.partitioner().range_bounds(),
        ds.partitioner().range_bounds()
    );
    assert_eq!(
        restored.typ().row_type().to_string(),
        ds.typ().row_type().to_string()
    );
    assert_eq!(restored.typ().key(), ds.typ().key());
    assert_eq!(collect_pairs(&restored), collect_pairs(&ds));
    assert_ordered_invariant(&restored);
}

#[test]
fn manifest_records_part_files_in_partition_order() {
    let ds = ordered_from_rows((0..30).map(|k| (k, 0)).collect(), 3);
    let dir = TempDir::new().expect("temp dir");
    write_dataset(&ds, dir.path()).expect("write");

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("manifest.json")).expect("manifest"),
    )
    .expect("json");
    let files: Vec<&str> = manifest["partFiles"]
        .as_array()
        .expect("partFiles")
        .iter()
        .map(|v| v.as_str().expect("name"))
        .collect();
    assert_eq!(files, vec!["part-00000", "part-00001", "part-00002"]);
    assert_eq!(manifest["codec"], "rowbin.1");
    assert_eq!(
        manifest["rangeBounds"].as_array().expect("bounds").len(),
        3
    );
    let first = &manifest["rangeBounds"][0];
    assert!(first["includeStart"].as_bool().expect("includeStart"));
}

#[test]
fn reading_a_corrupt_partition_file_fails_cleanly() {
    let ds = ordered_from_rows((0..10).map(|k| (k, 0)).collect(), 1);
    let dir = TempDir::new().expect("temp dir");
    write_dataset(&ds, dir.path()).expect("write");
    std::fs::write(dir.path().join("part-00000"), b"short").expect("corrupt");

    let restored = read_dataset(dir.path(), LocalBackend::new()).expect("manifest still reads");
    let err = restored.collect().unwrap_err();
    assert!(
        err.to_string().contains("header") || err.to_string().contains("truncated"),
        "unexpected error: {}",
        err
    );
}

#[test]
fn truncated_dataset_round_trips() {
    let ds = ordered_from_rows((0..30).map(|k| (k, 0)).collect(), 3);
    let dir = TempDir::new().expect("temp dir");
    write_dataset(&ds.head(10).expect("head"), dir.path()).expect("write");
    let restored = read_dataset(dir.path(), LocalBackend::new()).expect("read");
    assert_eq!(restored.count().expect("count"), 10);
}
