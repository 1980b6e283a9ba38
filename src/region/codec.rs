//! Type-directed row serialization.
//!
//! Encodes a region value into a self-contained byte stream and restores it
//! into a fresh region, rewriting offset words. Missing fields and elements
//! contribute no payload beyond their bit. Used for cross-partition
//! transport, shuffle staging, and partition files.
//!
//! Stream format, per value:
//!
//! ```text
//! primitive  := little-endian value bytes
//! str/binary := [len: u32] [bytes]
//! struct     := [missing bits] [field]*        (defined fields only)
//! array      := [len: u32] [missing bits] [element]*  (defined only)
//! ```

use eyre::{ensure, Result};

use crate::region::Region;
use crate::vtype::{Kind, StructType, Type};

/// Codec identifier recorded in partition-set manifests.
pub const CODEC_ID: &str = "rowbin.1";

pub struct RowCodec {
    fund: Type,
}

impl RowCodec {
    pub fn new(typ: &Type) -> Self {
        Self {
            fund: typ.fundamental(),
        }
    }

    /// Appends the encoding of the value at `off` to `out`.
    pub fn encode(&self, region: &Region, off: usize, out: &mut Vec<u8>) {
        encode_value(&self.fund, region, off, out);
    }

    pub fn encode_to_vec(&self, region: &Region, off: usize) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(region, off, &mut out);
        out
    }

    /// Decodes one value from `bytes` starting at `*pos`, advancing `*pos`.
    /// Returns the restored value's offset in `region`.
    pub fn decode(&self, bytes: &[u8], pos: &mut usize, region: &mut Region) -> Result<usize> {
        decode_value(&self.fund, bytes, pos, region)
    }
}

fn encode_value(t: &Type, region: &Region, voff: usize, out: &mut Vec<u8>) {
    match &t.kind {
        Kind::Bool => out.push(region.load_byte(voff)),
        Kind::Int32 | Kind::Float32 => out.extend_from_slice(region.load_bytes(voff, 4)),
        Kind::Int64 | Kind::Float64 => out.extend_from_slice(region.load_bytes(voff, 8)),
        Kind::Str | Kind::Binary => {
            let len = region.load_i32(voff) as usize;
            out.extend_from_slice(&(len as u32).to_le_bytes());
            out.extend_from_slice(region.load_bytes(voff + 4, len));
        }
        Kind::Array(elem) => {
            let len = region.load_i32(voff) as usize;
            out.extend_from_slice(&(len as u32).to_le_bytes());
            let n_mb = t.array_n_missing_bytes(len);
            out.extend_from_slice(region.load_bytes(voff + 4, n_mb));
            for i in 0..len {
                if elem.required || !region.load_bit(voff + 4, i) {
                    let slot = t.array_element_offset(voff, len, i);
                    let eoff = if elem.is_pointer() {
                        region.load_offset(slot)
                    } else {
                        slot
                    };
                    encode_value(elem, region, eoff, out);
                }
            }
        }
        Kind::Struct(s) | Kind::Tuple(s) => encode_struct(s, region, voff, out),
        other => unreachable!("non-fundamental kind {:?} in codec", other),
    }
}

fn encode_struct(s: &StructType, region: &Region, off: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(region.load_bytes(off, s.n_missing_bytes()));
    for i in 0..s.n_fields() {
        let defined = match s.missing_idx(i) {
            None => true,
            Some(bit) => !region.load_bit(off, bit),
        };
        if defined {
            let ft = s.field_type(i);
            let slot = off + s.field_offset(i);
            let voff = if ft.is_pointer() {
                region.load_offset(slot)
            } else {
                slot
            };
            encode_value(ft, region, voff, out);
        }
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    ensure!(
        *pos + n <= bytes.len(),
        "row stream truncated: need {} bytes at position {}, have {}",
        n,
        *pos,
        bytes.len()
    );
    let s = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> Result<usize> {
    let b = take(bytes, pos, 4)?;
    Ok(u32::from_le_bytes(b.try_into().unwrap()) as usize)
}

fn decode_value(t: &Type, bytes: &[u8], pos: &mut usize, region: &mut Region) -> Result<usize> {
    match &t.kind {
        Kind::Struct(s) | Kind::Tuple(s) => {
            let off = region.allocate(s.alignment(), s.byte_size());
            decode_struct_body(s, bytes, pos, region, off)?;
            Ok(off)
        }
        Kind::Str | Kind::Binary => decode_bytes_content(bytes, pos, region),
        Kind::Array(_) => decode_array_content(t, bytes, pos, region),
        _ => {
            let size = t.byte_size();
            let off = region.allocate(t.alignment(), size);
            let src = take(bytes, pos, size)?;
            region.store_bytes(off, src);
            Ok(off)
        }
    }
}

fn decode_into_slot(
    t: &Type,
    bytes: &[u8],
    pos: &mut usize,
    region: &mut Region,
    slot: usize,
) -> Result<()> {
    match &t.kind {
        Kind::Struct(s) | Kind::Tuple(s) => decode_struct_body(s, bytes, pos, region, slot),
        Kind::Str | Kind::Binary => {
            let content = decode_bytes_content(bytes, pos, region)?;
            region.store_offset(slot, content);
            Ok(())
        }
        Kind::Array(_) => {
            let content = decode_array_content(t, bytes, pos, region)?;
            region.store_offset(slot, content);
            Ok(())
        }
        _ => {
            let size = t.byte_size();
            let src = take(bytes, pos, size)?;
            region.store_bytes(slot, src);
            Ok(())
        }
    }
}

fn decode_struct_body(
    s: &StructType,
    bytes: &[u8],
    pos: &mut usize,
    region: &mut Region,
    off: usize,
) -> Result<()> {
    let header = take(bytes, pos, s.n_missing_bytes())?.to_vec();
    region.store_bytes(off, &header);
    for i in 0..s.n_fields() {
        let defined = match s.missing_idx(i) {
            None => true,
            Some(bit) => (header[bit / 8] & (1 << (bit % 8))) == 0,
        };
        if defined {
            decode_into_slot(s.field_type(i), bytes, pos, region, off + s.field_offset(i))?;
        }
    }
    Ok(())
}

fn decode_bytes_content(bytes: &[u8], pos: &mut usize, region: &mut Region) -> Result<usize> {
    let len = take_u32(bytes, pos)?;
    let content = take(bytes, pos, len)?.to_vec();
    let off = region.allocate(4, 4 + len);
    region.store_i32(off, len as i32);
    region.store_bytes(off + 4, &content);
    Ok(off)
}

fn decode_array_content(
    t: &Type,
    bytes: &[u8],
    pos: &mut usize,
    region: &mut Region,
) -> Result<usize> {
    let elem = t.element_type().expect("array type");
    let len = take_u32(bytes, pos)?;
    let n_mb = t.array_n_missing_bytes(len);
    let header = take(bytes, pos, n_mb)?.to_vec();
    let aoff = region.allocate(t.array_content_alignment(), t.array_content_size(len));
    region.store_i32(aoff, len as i32);
    region.store_bytes(aoff + 4, &header);
    for i in 0..len {
        let defined = elem.required || (header[i / 8] & (1 << (i % 8))) == 0;
        if defined {
            decode_into_slot(elem, bytes, pos, region, t.array_element_offset(aoff, len, i))?;
        }
    }
    Ok(aoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::builder::write_annotation;
    use crate::region::view::read_annotation;
    use crate::vtype::{Annotation, Field};

    fn round_trip(typ: &Type, a: &Annotation) {
        let codec = RowCodec::new(typ);
        let mut src = Region::new();
        let off = write_annotation(&mut src, typ, a).unwrap();
        let bytes = codec.encode_to_vec(&src, off);

        let mut dst = Region::new();
        let mut pos = 0;
        let off2 = codec.decode(&bytes, &mut pos, &mut dst).unwrap();
        assert_eq!(pos, bytes.len(), "decode must consume the full encoding");
        assert_eq!(read_annotation(typ, &dst, off2), *a);
    }

    #[test]
    fn codec_round_trips_nested_rows() {
        let t = Type::struct_(vec![
            Field::new("locus", Type::locus().required()),
            Field::new("alleles", Type::array(Type::str().required())),
            Field::new("qual", Type::float64()),
        ]);
        round_trip(
            &t,
            &Annotation::Struct(vec![
                Annotation::Locus {
                    contig: "1".into(),
                    position: 12345,
                },
                Annotation::Array(vec![Annotation::str("A"), Annotation::str("T")]),
                Annotation::Missing,
            ]),
        );
    }

    #[test]
    fn missing_fields_take_no_payload() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int64()),
            Field::new("b", Type::int64()),
        ]);
        let codec = RowCodec::new(&t);
        let mut r = Region::new();
        let off = write_annotation(
            &mut r,
            &t,
            &Annotation::Struct(vec![Annotation::Missing, Annotation::Missing]),
        )
        .unwrap();
        let bytes = codec.encode_to_vec(&r, off);
        assert_eq!(bytes.len(), 1); // header byte only
    }

    #[test]
    fn decode_rejects_truncated_stream() {
        let t = Type::struct_(vec![Field::new("a", Type::int64().required())]);
        let codec = RowCodec::new(&t);
        let mut r = Region::new();
        let mut pos = 0;
        assert!(codec.decode(&[1, 2, 3], &mut pos, &mut r).is_err());
    }
}
