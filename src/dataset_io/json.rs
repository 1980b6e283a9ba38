//! JSON bindings for annotations.
//!
//! Import is lenient where the taxonomy calls for it: integers parse from
//! JSON numbers and numeric strings, floats additionally accept
//! `"Infinity"`, `"-Infinity"`, and `"NaN"`, unknown struct fields and
//! unrecognized interval shapes warn and coerce to missing. A null for a
//! required field is a fatal error. Warnings are rate-limited per importer.

use eyre::{bail, Result};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::interval::Interval;
use crate::vtype::{Annotation, Kind, Type};

/// Rate-limits import warnings; one context per partition or manifest.
pub struct WarningLimiter {
    emitted: usize,
    limit: usize,
}

impl Default for WarningLimiter {
    fn default() -> Self {
        Self {
            emitted: 0,
            limit: 10,
        }
    }
}

impl WarningLimiter {
    pub fn new(limit: usize) -> Self {
        Self { emitted: 0, limit }
    }

    fn warn(&mut self, msg: &str) {
        if self.emitted < self.limit {
            warn!("{}", msg);
        } else if self.emitted == self.limit {
            warn!("suppressing further JSON import warnings");
        }
        self.emitted += 1;
    }
}

pub fn export_annotation(t: &Type, a: &Annotation) -> Value {
    match (a, &t.kind) {
        (Annotation::Missing, _) => Value::Null,
        (Annotation::Bool(b), _) => json!(b),
        (Annotation::Int32(x), _) => json!(x),
        (Annotation::Int64(x), _) => json!(x),
        (Annotation::Float32(x), _) => export_float(*x as f64),
        (Annotation::Float64(x), _) => export_float(*x),
        (Annotation::Str(s), _) => json!(s),
        (Annotation::Binary(b), _) => Value::Array(b.iter().map(|&x| json!(x)).collect()),
        (Annotation::Call(c), _) => json!(c),
        (Annotation::Locus { contig, position }, _) => {
            json!({ "contig": contig, "position": position })
        }
        (Annotation::Interval(iv), Kind::Interval(point)) => json!({
            "start": export_annotation(point, &iv.start),
            "end": export_annotation(point, &iv.end),
            "includeStart": iv.includes_start,
            "includeEnd": iv.includes_end,
        }),
        (Annotation::Array(xs), Kind::Array(elem)) | (Annotation::Array(xs), Kind::Set(elem)) => {
            Value::Array(xs.iter().map(|x| export_annotation(elem, x)).collect())
        }
        (Annotation::Array(kvs), Kind::Dict(key, value)) => Value::Array(
            kvs.iter()
                .map(|kv| match kv {
                    Annotation::Struct(pair) if pair.len() == 2 => json!({
                        "key": export_annotation(key, &pair[0]),
                        "value": export_annotation(value, &pair[1]),
                    }),
                    other => panic!("dict entry is not a key/value struct: {:?}", other),
                })
                .collect(),
        ),
        (Annotation::Struct(values), Kind::Struct(s)) => {
            let mut obj = Map::new();
            for (f, v) in s.fields().iter().zip(values) {
                obj.insert(f.name.clone(), export_annotation(&f.typ, v));
            }
            Value::Object(obj)
        }
        (Annotation::Struct(values), Kind::Tuple(s)) => Value::Array(
            s.fields()
                .iter()
                .zip(values)
                .map(|(f, v)| export_annotation(&f.typ, v))
                .collect(),
        ),
        (a, k) => panic!("annotation {:?} does not inhabit type kind {:?}", a, k),
    }
}

fn export_float(x: f64) -> Value {
    if x.is_infinite() {
        json!(if x > 0.0 { "Infinity" } else { "-Infinity" })
    } else if x.is_nan() {
        json!("NaN")
    } else {
        json!(x)
    }
}

pub fn import_annotation(t: &Type, v: &Value, warnings: &mut WarningLimiter) -> Result<Annotation> {
    if v.is_null() {
        if t.required {
            bail!("null is not a valid value for required type {}", t);
        }
        return Ok(Annotation::Missing);
    }
    match &t.kind {
        Kind::Bool => match v {
            Value::Bool(b) => Ok(Annotation::Bool(*b)),
            other => bail!("expected a JSON boolean for {}, got {}", t, other),
        },
        Kind::Int32 => Ok(Annotation::Int32(import_i64(t, v)?.try_into().map_err(
            |_| eyre::eyre!("{} out of range for {}", v, t),
        )?)),
        Kind::Int64 => Ok(Annotation::Int64(import_i64(t, v)?)),
        Kind::Float32 => Ok(Annotation::Float32(import_f64(t, v)? as f32)),
        Kind::Float64 => Ok(Annotation::Float64(import_f64(t, v)?)),
        Kind::Str => match v {
            Value::String(s) => Ok(Annotation::Str(s.clone())),
            other => bail!("expected a JSON string for {}, got {}", t, other),
        },
        Kind::Binary => match v {
            Value::Array(xs) => {
                let mut bytes = Vec::with_capacity(xs.len());
                for x in xs {
                    let b = x
                        .as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| eyre::eyre!("binary element {} is not a byte", x))?;
                    bytes.push(b);
                }
                Ok(Annotation::Binary(bytes))
            }
            other => bail!("expected a JSON byte array for {}, got {}", t, other),
        },
        Kind::Call => Ok(Annotation::Call(import_i64(t, v)?.try_into().map_err(
            |_| eyre::eyre!("{} out of range for {}", v, t),
        )?)),
        Kind::Locus => match v {
            Value::Object(obj) => {
                let contig = obj
                    .get("contig")
                    .and_then(Value::as_str)
                    .ok_or_else(|| eyre::eyre!("locus is missing a string `contig`"))?;
                let position = obj
                    .get("position")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| eyre::eyre!("locus is missing an integer `position`"))?;
                Ok(Annotation::Locus {
                    contig: contig.to_string(),
                    position: position
                        .try_into()
                        .map_err(|_| eyre::eyre!("locus position {} out of range", position))?,
                })
            }
            other => bail!("expected a JSON object for {}, got {}", t, other),
        },
        Kind::Interval(point) => match v {
            Value::Object(obj)
                if obj.contains_key("start")
                    && obj.contains_key("end")
                    && obj.contains_key("includeStart")
                    && obj.contains_key("includeEnd") =>
            {
                let start = import_annotation(point, &obj["start"], warnings)?;
                let end = import_annotation(point, &obj["end"], warnings)?;
                let includes_start = obj["includeStart"]
                    .as_bool()
                    .ok_or_else(|| eyre::eyre!("interval includeStart is not a boolean"))?;
                let includes_end = obj["includeEnd"]
                    .as_bool()
                    .ok_or_else(|| eyre::eyre!("interval includeEnd is not a boolean"))?;
                Ok(Annotation::Interval(Box::new(Interval::new(
                    start,
                    end,
                    includes_start,
                    includes_end,
                ))))
            }
            other => {
                warnings.warn(&format!(
                    "unrecognized interval shape {}; treating as missing",
                    other
                ));
                if t.required {
                    bail!("missing interval for required type {}", t);
                }
                Ok(Annotation::Missing)
            }
        },
        Kind::Array(elem) | Kind::Set(elem) => match v {
            Value::Array(xs) => {
                let mut out = Vec::with_capacity(xs.len());
                for x in xs {
                    out.push(import_annotation(elem, x, warnings)?);
                }
                Ok(Annotation::Array(out))
            }
            other => bail!("expected a JSON array for {}, got {}", t, other),
        },
        Kind::Dict(key, value) => match v {
            Value::Array(kvs) => {
                let mut out = Vec::with_capacity(kvs.len());
                for kv in kvs {
                    let obj = kv
                        .as_object()
                        .ok_or_else(|| eyre::eyre!("dict entry {} is not an object", kv))?;
                    let k = import_annotation(
                        key,
                        obj.get("key").unwrap_or(&Value::Null),
                        warnings,
                    )?;
                    let val = import_annotation(
                        value,
                        obj.get("value").unwrap_or(&Value::Null),
                        warnings,
                    )?;
                    out.push(Annotation::Struct(vec![k, val]));
                }
                Ok(Annotation::Array(out))
            }
            other => bail!("expected a JSON array for {}, got {}", t, other),
        },
        Kind::Struct(s) => match v {
            Value::Object(obj) => {
                for name in obj.keys() {
                    if s.field_index(name).is_none() {
                        warnings.warn(&format!(
                            "unknown field `{}` during import of {}; ignoring",
                            name, t
                        ));
                    }
                }
                let mut values = Vec::with_capacity(s.n_fields());
                for f in s.fields() {
                    let fv = obj.get(&f.name).unwrap_or(&Value::Null);
                    values.push(import_annotation(&f.typ, fv, warnings)?);
                }
                Ok(Annotation::Struct(values))
            }
            other => bail!("expected a JSON object for {}, got {}", t, other),
        },
        Kind::Tuple(s) => match v {
            Value::Array(xs) if xs.len() == s.n_fields() => {
                let mut values = Vec::with_capacity(s.n_fields());
                for (f, x) in s.fields().iter().zip(xs) {
                    values.push(import_annotation(&f.typ, x, warnings)?);
                }
                Ok(Annotation::Struct(values))
            }
            other => bail!(
                "expected a JSON array of {} elements for {}, got {}",
                s.n_fields(),
                t,
                other
            ),
        },
    }
}

fn import_i64(t: &Type, v: &Value) -> Result<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| eyre::eyre!("{} is not an integer for {}", n, t)),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| eyre::eyre!("string `{}` does not parse as an integer for {}", s, t)),
        other => bail!("expected an integer for {}, got {}", t, other),
    }
}

fn import_f64(t: &Type, v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| eyre::eyre!("{} is not a float for {}", n, t)),
        Value::String(s) => match s.as_str() {
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            "NaN" => Ok(f64::NAN),
            other => other
                .parse::<f64>()
                .map_err(|_| eyre::eyre!("string `{}` does not parse as a float for {}", other, t)),
        },
        other => bail!("expected a float for {}, got {}", t, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtype::Field;

    fn round_trip(t: &Type, a: &Annotation) {
        let v = export_annotation(t, a);
        let mut w = WarningLimiter::default();
        let back = import_annotation(t, &v, &mut w).unwrap();
        assert_eq!(&back, a, "JSON round-trip mismatch for {}", t);
    }

    #[test]
    fn values_round_trip_through_json() {
        round_trip(&Type::int32(), &Annotation::Int32(-5));
        round_trip(&Type::float64(), &Annotation::Float64(f64::INFINITY));
        round_trip(&Type::float64(), &Annotation::Float64(2.5));
        round_trip(
            &Type::struct_(vec![
                Field::new("locus", Type::locus().required()),
                Field::new("af", Type::float64()),
            ]),
            &Annotation::Struct(vec![
                Annotation::Locus {
                    contig: "X".into(),
                    position: 100,
                },
                Annotation::Missing,
            ]),
        );
        round_trip(
            &Type::interval(Type::int32().required()),
            &Annotation::Interval(Box::new(Interval::new(
                Annotation::Int32(1),
                Annotation::Int32(9),
                true,
                false,
            ))),
        );
        round_trip(
            &Type::dict(Type::str().required(), Type::int32()),
            &Annotation::Array(vec![Annotation::Struct(vec![
                Annotation::str("a"),
                Annotation::Int32(1),
            ])]),
        );
    }

    #[test]
    fn integers_parse_from_numeric_strings() {
        let mut w = WarningLimiter::default();
        let got = import_annotation(&Type::int32(), &json!("42"), &mut w).unwrap();
        assert_eq!(got, Annotation::Int32(42));
    }

    #[test]
    fn null_for_required_field_is_fatal() {
        let t = Type::struct_(vec![Field::new("a", Type::int32().required())]);
        let mut w = WarningLimiter::default();
        let err = import_annotation(&t, &json!({ "a": null }), &mut w).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn unknown_struct_fields_are_ignored() {
        let t = Type::struct_(vec![Field::new("a", Type::int32())]);
        let mut w = WarningLimiter::default();
        let got = import_annotation(&t, &json!({ "a": 1, "zzz": true }), &mut w).unwrap();
        assert_eq!(got, Annotation::Struct(vec![Annotation::Int32(1)]));
    }

    #[test]
    fn malformed_interval_warns_to_missing() {
        let t = Type::interval(Type::int32().required());
        let mut w = WarningLimiter::default();
        let got = import_annotation(&t, &json!({ "lo": 1, "hi": 2 }), &mut w).unwrap();
        assert_eq!(got, Annotation::Missing);
    }
}
