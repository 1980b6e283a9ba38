//! Type descriptor parsing.
//!
//! Parses the strings produced by `Type`'s `Display` impl, e.g.
//! `Struct{a:+Int32,b:Array[Float64]}`. Used when restoring a partition-set
//! manifest. Errors carry the byte position of the failure.

use eyre::{bail, Result};

use crate::vtype::{Field, Type};

pub fn parse_type(s: &str) -> Result<Type> {
    let mut p = Parser { input: s, pos: 0 };
    let t = p.parse()?;
    p.skip_ws();
    if p.pos != s.len() {
        bail!(
            "trailing input at position {} in type descriptor `{}`",
            p.pos,
            s
        );
    }
    Ok(t)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse(&mut self) -> Result<Type> {
        self.skip_ws();
        let required = self.eat('+');
        let name = self.ident()?;
        let t = match name {
            "Bool" => Type::bool(),
            "Int32" => Type::int32(),
            "Int64" => Type::int64(),
            "Float32" => Type::float32(),
            "Float64" => Type::float64(),
            "String" => Type::str(),
            "Binary" => Type::binary(),
            "Call" => Type::call(),
            "Locus" => Type::locus(),
            "Interval" => {
                self.expect('[')?;
                let point = self.parse()?;
                self.expect(']')?;
                Type::interval(point)
            }
            "Array" => {
                self.expect('[')?;
                let elem = self.parse()?;
                self.expect(']')?;
                Type::array(elem)
            }
            "Set" => {
                self.expect('[')?;
                let elem = self.parse()?;
                self.expect(']')?;
                Type::set(elem)
            }
            "Dict" => {
                self.expect('[')?;
                let key = self.parse()?;
                self.expect(',')?;
                let value = self.parse()?;
                self.expect(']')?;
                Type::dict(key, value)
            }
            "Struct" => {
                self.expect('{')?;
                let mut fields = Vec::new();
                self.skip_ws();
                if !self.eat('}') {
                    loop {
                        let fname = self.ident()?.to_string();
                        self.expect(':')?;
                        let ftyp = self.parse()?;
                        fields.push(Field::new(fname, ftyp));
                        self.skip_ws();
                        if self.eat('}') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Type::struct_(fields)
            }
            "Tuple" => {
                self.expect('[')?;
                let mut types = Vec::new();
                self.skip_ws();
                if !self.eat(']') {
                    loop {
                        types.push(self.parse()?);
                        self.skip_ws();
                        if self.eat(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Type::tuple(types)
            }
            other => bail!(
                "unknown type name `{}` at position {} in `{}`",
                other,
                self.pos - other.len(),
                self.input
            ),
        };
        Ok(t.with_required(required))
    }

    fn skip_ws(&mut self) {
        while self.input[self.pos..].starts_with(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if !self.eat(c) {
            bail!(
                "expected `{}` at position {} in type descriptor `{}`",
                c,
                self.pos,
                self.input
            );
        }
        Ok(())
    }

    fn ident(&mut self) -> Result<&'a str> {
        self.skip_ws();
        let start = self.pos;
        let rest = &self.input[start..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        if len == 0 {
            bail!(
                "expected identifier at position {} in type descriptor `{}`",
                start,
                self.input
            );
        }
        self.pos += len;
        Ok(&self.input[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_display_prints() {
        let cases = [
            "Int32",
            "+Int64",
            "Array[+Float64]",
            "Set[String]",
            "Dict[+String,Int32]",
            "Interval[+Int32]",
            "Struct{a:+Int32,b:Array[Float64],c:Struct{x:Bool}}",
            "Tuple[Int32,String]",
            "+Struct{locus:+Locus,alleles:+Array[+String]}",
        ];
        for c in cases {
            let t = parse_type(c).unwrap();
            assert_eq!(t.to_string(), c, "round-trip failed for {}", c);
        }
    }

    #[test]
    fn rejects_unknown_names_and_trailing_input() {
        assert!(parse_type("Int128").is_err());
        assert!(parse_type("Int32]").is_err());
        assert!(parse_type("Struct{a:Int32").is_err());
    }

    #[test]
    fn tolerates_whitespace() {
        let t = parse_type("Struct{ a : +Int32 , b : Array[ Float64 ] }").unwrap();
        assert_eq!(t.to_string(), "Struct{a:+Int32,b:Array[Float64]}");
    }
}
