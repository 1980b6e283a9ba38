//! Logical kinds, requiredness, and physical layout.
//!
//! `StructType` precomputes field offsets and missing-bit indices the way a
//! schema precomputes column offsets: layout questions are O(1) at access
//! time and depend only on the type.

use std::fmt;

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::vtype::Annotation;

/// A named struct field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub typ: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: Type) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

/// Struct layout with precomputed offsets.
///
/// `missing_idx[i]` is the bit index of field i's missing bit within the
/// header, or `None` when the field is required (no bit allocated).
#[derive(Debug, Clone)]
pub struct StructType {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    missing_idx: Vec<Option<usize>>,
    field_offsets: Vec<usize>,
    n_missing_bytes: usize,
    byte_size: usize,
    alignment: usize,
}

impl PartialEq for StructType {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl StructType {
    pub fn new(fields: Vec<Field>) -> Self {
        let mut by_name = HashMap::with_capacity(fields.len());
        let mut missing_idx = Vec::with_capacity(fields.len());
        let mut n_bits = 0usize;
        for (i, f) in fields.iter().enumerate() {
            by_name.insert(f.name.clone(), i);
            if f.typ.required {
                missing_idx.push(None);
            } else {
                missing_idx.push(Some(n_bits));
                n_bits += 1;
            }
        }
        let n_missing_bytes = n_bits.div_ceil(8);

        let mut field_offsets = Vec::with_capacity(fields.len());
        let mut offset = n_missing_bytes;
        let mut alignment = 1usize;
        for f in &fields {
            let a = f.typ.alignment();
            alignment = alignment.max(a);
            offset = align_up(offset, a);
            field_offsets.push(offset);
            offset += f.typ.byte_size();
        }
        let byte_size = align_up(offset, alignment);

        Self {
            fields,
            by_name,
            missing_idx,
            field_offsets,
            n_missing_bytes,
            byte_size,
            alignment,
        }
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn field_type(&self, i: usize) -> &Type {
        &self.fields[i].typ
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn field_offset(&self, i: usize) -> usize {
        self.field_offsets[i]
    }

    /// Missing-bit index for field i, `None` when the field is required.
    pub fn missing_idx(&self, i: usize) -> Option<usize> {
        self.missing_idx[i]
    }

    pub fn n_missing_bytes(&self) -> usize {
        self.n_missing_bytes
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

/// The logical kind of a [`Type`].
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Binary,
    Call,
    Locus,
    Interval(Box<Type>),
    Array(Box<Type>),
    Set(Box<Type>),
    Dict(Box<Type>, Box<Type>),
    Struct(StructType),
    Tuple(StructType),
}

/// A logical type plus a requiredness flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub kind: Kind,
    pub required: bool,
}

fn align_up(off: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (off + alignment - 1) & !(alignment - 1)
}

impl Type {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    pub fn bool() -> Self {
        Self::new(Kind::Bool)
    }

    pub fn int32() -> Self {
        Self::new(Kind::Int32)
    }

    pub fn int64() -> Self {
        Self::new(Kind::Int64)
    }

    pub fn float32() -> Self {
        Self::new(Kind::Float32)
    }

    pub fn float64() -> Self {
        Self::new(Kind::Float64)
    }

    pub fn str() -> Self {
        Self::new(Kind::Str)
    }

    pub fn binary() -> Self {
        Self::new(Kind::Binary)
    }

    pub fn call() -> Self {
        Self::new(Kind::Call)
    }

    pub fn locus() -> Self {
        Self::new(Kind::Locus)
    }

    pub fn interval(point: Type) -> Self {
        Self::new(Kind::Interval(Box::new(point)))
    }

    pub fn array(elem: Type) -> Self {
        Self::new(Kind::Array(Box::new(elem)))
    }

    pub fn set(elem: Type) -> Self {
        Self::new(Kind::Set(Box::new(elem)))
    }

    pub fn dict(key: Type, value: Type) -> Self {
        Self::new(Kind::Dict(Box::new(key), Box::new(value)))
    }

    pub fn struct_(fields: Vec<Field>) -> Self {
        Self::new(Kind::Struct(StructType::new(fields)))
    }

    pub fn tuple(types: Vec<Type>) -> Self {
        let fields = types
            .into_iter()
            .enumerate()
            .map(|(i, t)| Field::new(i.to_string(), t))
            .collect();
        Self::new(Kind::Tuple(StructType::new(fields)))
    }

    /// Marks this type required. Required values never allocate a missing bit.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Same kind with the given requiredness.
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self.kind,
            Kind::Bool | Kind::Int32 | Kind::Int64 | Kind::Float32 | Kind::Float64 | Kind::Call
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            Kind::Int32 | Kind::Int64 | Kind::Float32 | Kind::Float64
        )
    }

    /// True when the slot holds an 8-byte offset word into region memory.
    pub fn is_pointer(&self) -> bool {
        matches!(
            self.kind,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _)
        )
    }

    /// The on-wire representation used by the row codec and builder.
    ///
    /// Identity for primitives, strings, and structs of fundamentals; Set,
    /// Dict, Interval, Locus, and Call lower to their container/struct/int
    /// representations. Requiredness is preserved.
    pub fn fundamental(&self) -> Type {
        let required = self.required;
        let t = match &self.kind {
            Kind::Bool
            | Kind::Int32
            | Kind::Int64
            | Kind::Float32
            | Kind::Float64
            | Kind::Str
            | Kind::Binary => self.clone(),
            Kind::Call => Type::int32(),
            Kind::Locus => Type::struct_(vec![
                Field::new("contig", Type::str().required()),
                Field::new("position", Type::int32().required()),
            ]),
            Kind::Interval(point) => {
                let p = point.fundamental();
                Type::struct_(vec![
                    Field::new("start", p.clone()),
                    Field::new("end", p),
                    Field::new("includesStart", Type::bool().required()),
                    Field::new("includesEnd", Type::bool().required()),
                ])
            }
            Kind::Array(elem) => Type::array(elem.fundamental()),
            Kind::Set(elem) => Type::array(elem.fundamental()),
            Kind::Dict(key, value) => Type::array(
                Type::struct_(vec![
                    Field::new("key", key.fundamental()),
                    Field::new("value", value.fundamental()),
                ])
                .required(),
            ),
            Kind::Struct(s) => Type::struct_(
                s.fields()
                    .iter()
                    .map(|f| Field::new(f.name.clone(), f.typ.fundamental()))
                    .collect(),
            ),
            Kind::Tuple(s) => Type::new(Kind::Tuple(StructType::new(
                s.fields()
                    .iter()
                    .map(|f| Field::new(f.name.clone(), f.typ.fundamental()))
                    .collect(),
            ))),
        };
        t.with_required(required)
    }

    /// Size of this type's value slot in bytes.
    pub fn byte_size(&self) -> usize {
        match &self.kind {
            Kind::Bool => 1,
            Kind::Int32 | Kind::Float32 | Kind::Call => 4,
            Kind::Int64 | Kind::Float64 => 8,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => 8,
            Kind::Locus | Kind::Interval(_) => self.fundamental_struct_size(),
            Kind::Struct(s) | Kind::Tuple(s) => s.byte_size(),
        }
    }

    pub fn alignment(&self) -> usize {
        match &self.kind {
            Kind::Bool => 1,
            Kind::Int32 | Kind::Float32 | Kind::Call => 4,
            Kind::Int64 | Kind::Float64 => 8,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => 8,
            Kind::Locus | Kind::Interval(_) => {
                match self.fundamental().kind {
                    Kind::Struct(s) => s.alignment(),
                    _ => unreachable!(),
                }
            }
            Kind::Struct(s) | Kind::Tuple(s) => s.alignment(),
        }
    }

    fn fundamental_struct_size(&self) -> usize {
        match self.fundamental().kind {
            Kind::Struct(s) => s.byte_size(),
            _ => unreachable!(),
        }
    }

    /// Struct layout view; `None` for non-struct fundamentals.
    pub fn as_struct(&self) -> Option<&StructType> {
        match &self.kind {
            Kind::Struct(s) | Kind::Tuple(s) => Some(s),
            _ => None,
        }
    }

    /// Element type of an array-fundamental type.
    pub fn element_type(&self) -> Option<&Type> {
        match &self.kind {
            Kind::Array(e) | Kind::Set(e) => Some(e),
            _ => None,
        }
    }

    pub fn interval_point_type(&self) -> Option<&Type> {
        match &self.kind {
            Kind::Interval(p) => Some(p),
            _ => None,
        }
    }

    // Array content layout. These are defined for array-fundamental types
    // only; offsets are relative to the array content start.

    pub fn array_n_missing_bytes(&self, len: usize) -> usize {
        let elem = self.element_type().expect("array type");
        if elem.required {
            0
        } else {
            len.div_ceil(8)
        }
    }

    pub fn array_elem_stride(&self) -> usize {
        let elem = self.element_type().expect("array type");
        align_up(elem.byte_size(), elem.alignment())
    }

    pub fn array_elements_offset(&self, len: usize) -> usize {
        let elem = self.element_type().expect("array type");
        align_up(4 + self.array_n_missing_bytes(len), elem.alignment())
    }

    pub fn array_content_size(&self, len: usize) -> usize {
        self.array_elements_offset(len) + len * self.array_elem_stride()
    }

    pub fn array_content_alignment(&self) -> usize {
        let elem = self.element_type().expect("array type");
        elem.alignment().max(4)
    }

    pub fn array_element_offset(&self, aoff: usize, len: usize, i: usize) -> usize {
        aoff + self.array_elements_offset(len) + i * self.array_elem_stride()
    }

    /// Checks that an annotation inhabits this type.
    pub fn type_check(&self, a: &Annotation) -> bool {
        match a {
            Annotation::Missing => !self.required,
            Annotation::Bool(_) => matches!(self.kind, Kind::Bool),
            Annotation::Int32(_) => matches!(self.kind, Kind::Int32),
            Annotation::Int64(_) => matches!(self.kind, Kind::Int64),
            Annotation::Float32(_) => matches!(self.kind, Kind::Float32),
            Annotation::Float64(_) => matches!(self.kind, Kind::Float64),
            Annotation::Str(_) => matches!(self.kind, Kind::Str),
            Annotation::Binary(_) => matches!(self.kind, Kind::Binary),
            Annotation::Call(_) => matches!(self.kind, Kind::Call),
            Annotation::Locus { .. } => matches!(self.kind, Kind::Locus),
            Annotation::Interval(iv) => match &self.kind {
                Kind::Interval(p) => p.type_check(&iv.start) && p.type_check(&iv.end),
                _ => false,
            },
            Annotation::Array(elems) => match &self.kind {
                Kind::Array(e) | Kind::Set(e) => elems.iter().all(|x| e.type_check(x)),
                Kind::Dict(k, v) => elems.iter().all(|x| match x {
                    Annotation::Struct(kv) if kv.len() == 2 => {
                        k.type_check(&kv[0]) && v.type_check(&kv[1])
                    }
                    _ => false,
                }),
                _ => false,
            },
            Annotation::Struct(values) => match &self.kind {
                Kind::Struct(s) | Kind::Tuple(s) => {
                    s.n_fields() == values.len()
                        && s.fields()
                            .iter()
                            .zip(values)
                            .all(|(f, v)| f.typ.type_check(v))
                }
                Kind::Locus => false,
                _ => false,
            },
        }
    }

    /// Unifies two types for branch joins: kinds (including nested
    /// requiredness, which determines layout) must match exactly; top-level
    /// requiredness meets.
    pub fn unify(&self, other: &Type) -> Result<Type> {
        if self.kind != other.kind {
            bail!("cannot unify types {} and {}", self, other);
        }
        Ok(self.clone().with_required(self.required && other.required))
    }

    /// The struct type holding a prefix of this struct's fields.
    ///
    /// Used to project a partition key out of a full key.
    pub fn select_fields(&self, names: &[String]) -> Result<Type> {
        let s = match self.as_struct() {
            Some(s) => s,
            None => bail!("select_fields on non-struct type {}", self),
        };
        let mut fields = Vec::with_capacity(names.len());
        for n in names {
            match s.field_index(n) {
                Some(i) => fields.push(s.field(i).clone()),
                None => bail!("no field `{}` in {}", n, self),
            }
        }
        Ok(Type::struct_(fields).with_required(self.required))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.required {
            write!(f, "+")?;
        }
        match &self.kind {
            Kind::Bool => write!(f, "Bool"),
            Kind::Int32 => write!(f, "Int32"),
            Kind::Int64 => write!(f, "Int64"),
            Kind::Float32 => write!(f, "Float32"),
            Kind::Float64 => write!(f, "Float64"),
            Kind::Str => write!(f, "String"),
            Kind::Binary => write!(f, "Binary"),
            Kind::Call => write!(f, "Call"),
            Kind::Locus => write!(f, "Locus"),
            Kind::Interval(p) => write!(f, "Interval[{}]", p),
            Kind::Array(e) => write!(f, "Array[{}]", e),
            Kind::Set(e) => write!(f, "Set[{}]", e),
            Kind::Dict(k, v) => write!(f, "Dict[{},{}]", k, v),
            Kind::Struct(s) => {
                write!(f, "Struct{{")?;
                for (i, field) in s.fields().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", field.name, field.typ)?;
                }
                write!(f, "}}")
            }
            Kind::Tuple(s) => {
                write!(f, "Tuple[")?;
                for (i, field) in s.fields().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", field.typ)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_precomputes_aligned_offsets() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32()),
            Field::new("b", Type::int64()),
            Field::new("c", Type::bool()),
        ]);
        let s = t.as_struct().unwrap();
        // one missing byte for three optional fields, then aligned slots
        assert_eq!(s.n_missing_bytes(), 1);
        assert_eq!(s.field_offset(0), 4);
        assert_eq!(s.field_offset(1), 8);
        assert_eq!(s.field_offset(2), 16);
        assert_eq!(s.alignment(), 8);
        assert_eq!(s.byte_size(), 24);
    }

    #[test]
    fn all_required_struct_has_no_missing_header() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32().required()),
            Field::new("b", Type::int32().required()),
        ]);
        let s = t.as_struct().unwrap();
        assert_eq!(s.n_missing_bytes(), 0);
        assert_eq!(s.field_offset(0), 0);
        assert_eq!(s.field_offset(1), 4);
        assert_eq!(s.missing_idx(0), None);
    }

    #[test]
    fn missing_bits_skip_required_fields() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32().required()),
            Field::new("b", Type::int32()),
            Field::new("c", Type::int32().required()),
            Field::new("d", Type::int32()),
        ]);
        let s = t.as_struct().unwrap();
        assert_eq!(s.missing_idx(0), None);
        assert_eq!(s.missing_idx(1), Some(0));
        assert_eq!(s.missing_idx(2), None);
        assert_eq!(s.missing_idx(3), Some(1));
    }

    #[test]
    fn array_layout_accounts_for_element_requiredness() {
        let opt = Type::array(Type::int32());
        assert_eq!(opt.array_n_missing_bytes(9), 2);
        assert_eq!(opt.array_elements_offset(9), 8);

        let req = Type::array(Type::int32().required());
        assert_eq!(req.array_n_missing_bytes(9), 0);
        assert_eq!(req.array_elements_offset(9), 4);
        assert_eq!(req.array_content_size(9), 4 + 9 * 4);
    }

    #[test]
    fn interval_fundamental_is_endpoint_struct() {
        let t = Type::interval(Type::int32().required());
        let fund = t.fundamental();
        let s = fund.as_struct().unwrap();
        assert_eq!(s.n_fields(), 4);
        assert_eq!(s.field(0).name, "start");
        assert_eq!(s.field(2).name, "includesStart");
        assert!(s.field_type(2).required);
    }

    #[test]
    fn dict_lowers_to_array_of_key_value_structs() {
        let t = Type::dict(Type::str().required(), Type::int32());
        let fund = t.fundamental();
        let elem = fund.element_type().unwrap();
        let s = elem.as_struct().unwrap();
        assert_eq!(s.field(0).name, "key");
        assert_eq!(s.field(1).name, "value");
    }

    #[test]
    fn display_round_trips_requiredness_marker() {
        let t = Type::struct_(vec![
            Field::new("a", Type::int32().required()),
            Field::new("b", Type::array(Type::float64())),
        ]);
        assert_eq!(t.to_string(), "Struct{a:+Int32,b:Array[Float64]}");
    }

    #[test]
    fn type_check_rejects_missing_for_required() {
        let t = Type::int32().required();
        assert!(!t.type_check(&Annotation::Missing));
        assert!(t.type_check(&Annotation::Int32(5)));
        assert!(Type::int32().type_check(&Annotation::Missing));
    }
}
