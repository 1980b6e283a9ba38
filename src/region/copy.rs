//! Cross-region deep copy.
//!
//! Copies a value between regions, rewriting offset words so the copy is
//! self-contained in the destination. All types here are fundamental; callers
//! lower logical types first. Blocks with no nested offset words are copied
//! with a single raw byte copy.

use crate::region::Region;
use crate::vtype::{Kind, StructType, Type};

/// True when the value layout embeds offset words anywhere.
pub(crate) fn contains_pointers(t: &Type) -> bool {
    match &t.kind {
        Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => true,
        Kind::Struct(s) | Kind::Tuple(s) => s.fields().iter().any(|f| contains_pointers(&f.typ)),
        _ => false,
    }
}

/// Copies the value at `voff` into `dst`, returning the new value offset.
pub(crate) fn copy_root(t: &Type, src: &Region, voff: usize, dst: &mut Region) -> usize {
    if t.is_pointer() {
        copy_pointer(t, src, voff, dst)
    } else {
        let off = dst.allocate(t.alignment(), t.byte_size());
        match &t.kind {
            Kind::Struct(s) | Kind::Tuple(s) => copy_struct_body(s, src, voff, dst, off),
            _ => dst.copy_raw_from(src, voff, off, t.byte_size()),
        }
        off
    }
}

/// Copies one slot's value; `dst_slot` must already be allocated.
pub(crate) fn copy_slot(t: &Type, src: &Region, src_slot: usize, dst: &mut Region, dst_slot: usize) {
    if t.is_pointer() {
        let content = src.load_offset(src_slot);
        let new_content = copy_pointer(t, src, content, dst);
        dst.store_offset(dst_slot, new_content);
    } else {
        match &t.kind {
            Kind::Struct(s) | Kind::Tuple(s) => copy_struct_body(s, src, src_slot, dst, dst_slot),
            _ => dst.copy_raw_from(src, src_slot, dst_slot, t.byte_size()),
        }
    }
}

pub(crate) fn copy_struct_body(
    s: &StructType,
    src: &Region,
    soff: usize,
    dst: &mut Region,
    doff: usize,
) {
    let flat = !s.fields().iter().any(|f| contains_pointers(&f.typ));
    if flat {
        dst.copy_raw_from(src, soff, doff, s.byte_size());
        return;
    }
    dst.copy_raw_from(src, soff, doff, s.n_missing_bytes());
    for (i, f) in s.fields().iter().enumerate() {
        let defined = match s.missing_idx(i) {
            None => true,
            Some(bit) => !src.load_bit(soff, bit),
        };
        if defined {
            copy_slot(
                &f.typ,
                src,
                soff + s.field_offset(i),
                dst,
                doff + s.field_offset(i),
            );
        }
    }
}

fn copy_pointer(t: &Type, src: &Region, content: usize, dst: &mut Region) -> usize {
    match &t.kind {
        Kind::Str | Kind::Binary => {
            let len = src.load_i32(content) as usize;
            let off = dst.allocate(4, 4 + len);
            dst.copy_raw_from(src, content, off, 4 + len);
            off
        }
        Kind::Array(elem) => {
            let len = src.load_i32(content) as usize;
            let size = t.array_content_size(len);
            let off = dst.allocate(t.array_content_alignment(), size);
            if !contains_pointers(elem) {
                dst.copy_raw_from(src, content, off, size);
                return off;
            }
            // header (length + missing bits), then per-element fixup
            dst.copy_raw_from(src, content, off, t.array_elements_offset(len));
            for i in 0..len {
                let defined = elem.required || !src.load_bit(content + 4, i);
                if defined {
                    copy_slot(
                        elem,
                        src,
                        t.array_element_offset(content, len, i),
                        dst,
                        t.array_element_offset(off, len, i),
                    );
                }
            }
            off
        }
        other => unreachable!("copy_pointer on non-pointer kind {:?}", other),
    }
}
