//! # Partition-Set Persistence
//!
//! Writes an ordered dataset as one file per partition plus a JSON
//! manifest, and restores it with memory-mapped reads.
//!
//! ## Layout
//!
//! ```text
//! {dir}/
//! ├── manifest.json    # type, key, codec, partFiles, rangeBounds
//! ├── part-00000       # partition 0
//! ├── part-00001
//! └── ...
//! ```
//!
//! Partition files carry a fixed header then codec-framed rows:
//!
//! ```text
//! PartFile := [row_count: u64 le] [data_size: u64 le] [Row]*
//! ```
//!
//! The manifest is written last, so a directory with a manifest is
//! complete. Range bounds serialize as
//! `{start, end, includeStart, includeEnd}` with endpoints encoded per the
//! partition-key type.

pub mod json;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CursorFactory, PartStream, RowCursor};
use crate::dataset_io::json::{export_annotation, import_annotation, WarningLimiter};
use crate::interval::Interval;
use crate::ordered::{OrderedDataset, OrderedKeyedType, OrderedPartitioner};
use crate::region::codec::CODEC_ID;
use crate::region::{Region, RowCodec};
use crate::vtype::{parse_type, Type};

const PART_HEADER_SIZE: usize = 16;

#[derive(Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "type")]
    type_descriptor: String,
    key: Vec<String>,
    #[serde(rename = "partitionKey")]
    n_partition_key: usize,
    codec: String,
    #[serde(rename = "partFiles")]
    part_files: Vec<String>,
    #[serde(rename = "rangeBounds")]
    range_bounds: Vec<serde_json::Value>,
}

fn part_file_name(i: usize) -> String {
    format!("part-{:05}", i)
}

/// Writes the dataset under `dir`: partition files named by index, then the
/// manifest.
pub fn write_dataset(ds: &OrderedDataset, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).wrap_err_with(|| format!("creating {}", dir.display()))?;
    let codec = RowCodec::new(ds.typ().row_type());

    let mut part_files = Vec::with_capacity(ds.n_partitions());
    for (i, factory) in ds.stream().parts.iter().enumerate() {
        let name = part_file_name(i);
        let path = dir.join(&name);
        write_partition(&codec, factory, &path)
            .wrap_err_with(|| format!("writing partition {} to {}", i, path.display()))?;
        part_files.push(name);
    }

    let pk_type = ds.typ().pk_type();
    let range_bounds = ds
        .partitioner()
        .range_bounds()
        .iter()
        .map(|b| {
            serde_json::json!({
                "start": export_annotation(&pk_type, &b.start),
                "end": export_annotation(&pk_type, &b.end),
                "includeStart": b.includes_start,
                "includeEnd": b.includes_end,
            })
        })
        .collect();

    let manifest = Manifest {
        type_descriptor: ds.typ().row_type().to_string(),
        key: ds.typ().key().to_vec(),
        n_partition_key: ds.typ().n_partition_key(),
        codec: CODEC_ID.to_string(),
        part_files,
        range_bounds,
    };
    let manifest_path = dir.join("manifest.json");
    fs::write(
        &manifest_path,
        serde_json::to_string_pretty(&manifest).wrap_err("serializing manifest")?,
    )
    .wrap_err_with(|| format!("writing {}", manifest_path.display()))?;
    Ok(())
}

fn write_partition(codec: &RowCodec, factory: &CursorFactory, path: &Path) -> Result<()> {
    let mut data = Vec::new();
    let mut cursor = factory()?;
    let mut row_count: u64 = 0;
    while cursor.advance()? {
        let (region, off) = cursor.current();
        codec.encode(region, off, &mut data);
        row_count += 1;
    }
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    w.write_all(&row_count.to_le_bytes())?;
    w.write_all(&(data.len() as u64).to_le_bytes())?;
    w.write_all(&data)?;
    w.flush()?;
    Ok(())
}

/// Restores a dataset written by [`write_dataset`]. Partition files are
/// memory-mapped and decoded row by row on demand.
pub fn read_dataset(dir: impl AsRef<Path>, backend: Rc<dyn Backend>) -> Result<OrderedDataset> {
    let dir = dir.as_ref();
    let manifest_path = dir.join("manifest.json");
    let manifest: Manifest = serde_json::from_str(
        &fs::read_to_string(&manifest_path)
            .wrap_err_with(|| format!("reading {}", manifest_path.display()))?,
    )
    .wrap_err("parsing manifest")?;
    ensure!(
        manifest.codec == CODEC_ID,
        "unsupported codec `{}`; this build reads `{}`",
        manifest.codec,
        CODEC_ID
    );

    let row_type = parse_type(&manifest.type_descriptor)?;
    let typ = OrderedKeyedType::new(row_type.clone(), manifest.key, manifest.n_partition_key)?;
    let pk_type = typ.pk_type();

    let mut warnings = WarningLimiter::default();
    let mut bounds = Vec::with_capacity(manifest.range_bounds.len());
    for (i, b) in manifest.range_bounds.iter().enumerate() {
        bounds.push(import_bound(&pk_type, b, &mut warnings).wrap_err_with(|| {
            format!("range bound {} in {}", i, manifest_path.display())
        })?);
    }
    ensure!(
        bounds.len() == manifest.part_files.len(),
        "manifest lists {} partitions but {} range bounds",
        manifest.part_files.len(),
        bounds.len()
    );
    let partitioner = Arc::new(OrderedPartitioner::new(pk_type, bounds)?);

    let mut parts: Vec<CursorFactory> = Vec::with_capacity(manifest.part_files.len());
    for name in &manifest.part_files {
        let path: PathBuf = dir.join(name);
        let row_type = row_type.clone();
        parts.push(Rc::new(move || {
            Ok(Box::new(PartFileCursor::open(&path, &row_type)?) as Box<dyn RowCursor>)
        }) as CursorFactory);
    }

    OrderedDataset::new(typ, partitioner, backend, PartStream::new(parts))
}

fn import_bound(
    pk_type: &Type,
    v: &serde_json::Value,
    warnings: &mut WarningLimiter,
) -> Result<Interval> {
    let obj = match v.as_object() {
        Some(o) => o,
        None => eyre::bail!("range bound {} is not an object", v),
    };
    let start = import_annotation(
        pk_type,
        obj.get("start").unwrap_or(&serde_json::Value::Null),
        warnings,
    )?;
    let end = import_annotation(
        pk_type,
        obj.get("end").unwrap_or(&serde_json::Value::Null),
        warnings,
    )?;
    let includes_start = obj
        .get("includeStart")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| eyre::eyre!("range bound is missing includeStart"))?;
    let includes_end = obj
        .get("includeEnd")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| eyre::eyre!("range bound is missing includeEnd"))?;
    Ok(Interval::new(start, end, includes_start, includes_end))
}

/// Decodes rows from a memory-mapped partition file.
struct PartFileCursor {
    mmap: Mmap,
    codec: RowCodec,
    pos: usize,
    remaining: u64,
    region: Region,
    offset: usize,
}

impl PartFileCursor {
    fn open(path: &Path, row_type: &Type) -> Result<Self> {
        let file =
            File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .wrap_err_with(|| format!("mapping {}", path.display()))?;
        ensure!(
            mmap.len() >= PART_HEADER_SIZE,
            "partition file {} too small for its header",
            path.display()
        );
        let row_count = u64::from_le_bytes(mmap[0..8].try_into().expect("header"));
        let data_size = u64::from_le_bytes(mmap[8..16].try_into().expect("header"));
        ensure!(
            mmap.len() as u64 == PART_HEADER_SIZE as u64 + data_size,
            "partition file {} length disagrees with its header",
            path.display()
        );
        Ok(Self {
            mmap,
            codec: RowCodec::new(row_type),
            pos: PART_HEADER_SIZE,
            remaining: row_count,
            region: Region::new(),
            offset: 0,
        })
    }
}

impl RowCursor for PartFileCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.region.clear();
        self.offset = self
            .codec
            .decode(&self.mmap, &mut self.pos, &mut self.region)?;
        self.remaining -= 1;
        Ok(true)
    }

    fn current(&self) -> (&Region, usize) {
        (&self.region, self.offset)
    }
}
