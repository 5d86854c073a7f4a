//! The textual `input` file handed to the instrumented program.
//!
//! Every variable takes two lines: a header holding the type tag (followed by
//! `h l index_size` for bitfields) and the value, either a decimal integer or
//! the IEEE-754 bit string of a float or double.
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

use crate::execution::InputVar;
use crate::value::{self, CType, Value};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("line {line}: {msg}")]
    Malformed { line: usize, msg: String },
    #[error(transparent)]
    Value(#[from] value::Error),
}

fn malformed<S: Into<String>>(line: usize, msg: S) -> Error {
    Error::Malformed {
        line: line + 1,
        msg: msg.into(),
    }
}

pub fn parse_inputs(text: &str) -> Result<Vec<Value>, Error> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let mut inputs = Vec::new();

    while let Some((n, header)) = lines.next() {
        let mut fields = header.split_whitespace();
        let tag = fields
            .next()
            .and_then(|f| f.parse::<i64>().ok())
            .ok_or_else(|| malformed(n, "expected a type tag"))?;
        let ty = CType::from_tag(tag)?;

        // bitfield headers carry `h l index_size`; the value line is the same
        let extra = fields.count();
        if extra != 0 && extra != 3 {
            return Err(malformed(n, "expected a type tag or a bitfield header"));
        }

        let (n, line) = lines
            .next()
            .ok_or_else(|| malformed(n, "missing value line"))?;
        let line = line.trim();

        let value = match ty {
            CType::Float => Value::floating(value::bin_string_to_float(line)? as f64, ty),
            CType::Double => Value::floating(value::bin_string_to_double(line)?, ty),
            _ => {
                let v = line
                    .parse::<i64>()
                    .map_err(|e| malformed(n, e.to_string()))?;
                Value::new(v, 0.0, ty)
            }
        };
        inputs.push(value);
    }

    Ok(inputs)
}

/// Read the input file; a missing file means no values are supplied.
pub fn read_inputs<P: AsRef<Path>>(path: P) -> Result<Vec<Value>, Error> {
    match fs::read_to_string(path) {
        Ok(text) => parse_inputs(&text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write `inputs`, taking bitfield headers from the matching `vars` entry.
pub fn write_inputs<W: Write>(mut w: W, inputs: &[Value], vars: &[InputVar]) -> Result<(), Error> {
    for (i, input) in inputs.iter().enumerate() {
        match vars.get(i).filter(|v| v.h != 0) {
            Some(var) => writeln!(
                w,
                "{} {} {} {}",
                input.ty.tag(),
                var.h,
                var.l,
                var.index_size
            )?,
            None => writeln!(w, "{}", input.ty.tag())?,
        }

        match input.ty {
            CType::Float => writeln!(w, "{}", value::float_to_bin_string(input.floating as f32))?,
            CType::Double => writeln!(w, "{}", value::double_to_bin_string(input.floating))?,
            _ => writeln!(w, "{}", input.integral)?,
        }
    }
    w.flush()?;
    Ok(())
}

pub fn write_inputs_file<P: AsRef<Path>>(
    path: P,
    inputs: &[Value],
    vars: &[InputVar],
) -> Result<(), Error> {
    let file = fs::File::create(path)?;
    write_inputs(io::BufWriter::new(file), inputs, vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SymExpr;
    use crate::value::Location;

    #[test]
    fn parse_mixed_types() {
        let text = "5\n-12\n12\n00111111100000000000000000000000\n15 4 0 0\n3\n";
        let inputs = parse_inputs(text).unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0], Value::new(-12, 0.0, CType::Int));
        assert_eq!(inputs[1].floating, 1.0);
        assert_eq!(inputs[1].ty, CType::Float);
        assert_eq!(inputs[2].integral, 3);
        assert_eq!(inputs[2].ty, CType::BitfieldChar);
    }

    #[test]
    fn malformed_files() {
        assert!(parse_inputs("5\n").is_err());
        assert!(parse_inputs("42\n1\n").is_err());
        assert!(parse_inputs("5 1\n1\n").is_err());
        assert!(parse_inputs("13\n0101\n").is_err());
        assert!(parse_inputs("").unwrap().is_empty());
    }

    #[test]
    fn write_then_parse() {
        let bitfield = InputVar {
            name: "s.a_1".to_owned(),
            ty: CType::BitfieldChar,
            location: Location::new("t.c", 3),
            old_value: 0xf0,
            h: 4,
            l: 0,
            index_size: 0,
            expr: SymExpr::atomic(1, 1, Value::integral(0, CType::BitfieldChar)),
        };
        let plain = InputVar {
            h: 0,
            ty: CType::Double,
            ..bitfield.clone()
        };

        let inputs = vec![
            Value::floating(-0.5, CType::Double),
            Value::integral(0xf3, CType::BitfieldChar),
        ];
        let mut buf = Vec::new();
        write_inputs(&mut buf, &inputs, &[plain, bitfield]).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("13\n"));
        assert!(text.contains("\n15 4 0 0\n243\n"));

        let parsed = parse_inputs(&text).unwrap();
        assert_eq!(parsed[0].floating, -0.5);
        assert_eq!(parsed[1].integral, 0xf3);
    }

    #[test]
    fn missing_file_supplies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_inputs(dir.path().join("input")).unwrap().is_empty());
    }
}
