//! Grid codec seam.
//!
//! The wire codec is a collaborator, not part of the operation core: the
//! session consumes whatever implementation it is handed. The built-in
//! [`JsonCodec`] covers the Haystack JSON encoding; a ZINC implementation
//! can be injected through the session builder.

use serde_json::{Map, Value};

use crate::core::{Error, ProtocolError};

use super::grid::{Grid, Meta, Row};
use super::scalar::Scalar;

/// Grid wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridFormat {
    Zinc,
    Json,
}

impl GridFormat {
    /// MIME type used in Accept/Content-Type headers.
    pub fn mime(self) -> &'static str {
        match self {
            GridFormat::Zinc => "text/zinc",
            GridFormat::Json => "application/json",
        }
    }
}

/// Encode/decode between grid text and [`Grid`] values.
pub trait GridCodec: Send + Sync {
    /// Decode a response body into one or more grids.
    fn decode(&self, text: &str, format: GridFormat) -> Result<Vec<Grid>, Error>;

    /// Encode a grid for a request body.
    fn encode(&self, grid: &Grid, format: GridFormat) -> Result<String, Error>;
}

/// Built-in codec for the Haystack JSON grid encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl GridCodec for JsonCodec {
    fn decode(&self, text: &str, format: GridFormat) -> Result<Vec<Grid>, Error> {
        if format != GridFormat::Json {
            return Err(unsupported(format));
        }
        let value: Value = serde_json::from_str(text).map_err(|e| {
            Error::from(ProtocolError::Malformed {
                message: format!("invalid JSON: {e}"),
            })
        })?;
        match value {
            Value::Array(items) => items.into_iter().map(decode_grid).collect(),
            other => Ok(vec![decode_grid(other)?]),
        }
    }

    fn encode(&self, grid: &Grid, format: GridFormat) -> Result<String, Error> {
        if format != GridFormat::Json {
            return Err(unsupported(format));
        }
        let mut meta = Map::new();
        meta.insert("ver".into(), Value::String("3.0".into()));
        for (key, value) in grid.metadata() {
            meta.insert(key.clone(), encode_scalar(value));
        }

        let cols: Vec<Value> = grid
            .column_names()
            .map(|name| {
                let mut col = Map::new();
                col.insert("name".into(), Value::String(name.to_string()));
                if let Some(col_meta) = grid.column_meta(name) {
                    for (key, value) in col_meta {
                        col.insert(key.clone(), encode_scalar(value));
                    }
                }
                Value::Object(col)
            })
            .collect();

        let rows: Vec<Value> = grid
            .rows()
            .map(|row| {
                let mut out = Map::new();
                for (key, value) in row {
                    out.insert(key.clone(), encode_scalar(value));
                }
                Value::Object(out)
            })
            .collect();

        let mut root = Map::new();
        root.insert("meta".into(), Value::Object(meta));
        root.insert("cols".into(), Value::Array(cols));
        root.insert("rows".into(), Value::Array(rows));
        Ok(Value::Object(root).to_string())
    }
}

fn unsupported(format: GridFormat) -> Error {
    ProtocolError::Malformed {
        message: format!("no codec configured for {format:?}"),
    }
    .into()
}

fn malformed(message: impl Into<String>) -> Error {
    ProtocolError::Malformed {
        message: message.into(),
    }
    .into()
}

fn decode_grid(value: Value) -> Result<Grid, Error> {
    let Value::Object(mut root) = value else {
        return Err(malformed("grid must be a JSON object"));
    };
    let mut grid = Grid::new();

    if let Some(Value::Object(meta)) = root.remove("meta") {
        for (key, value) in meta {
            if key == "ver" {
                continue;
            }
            grid.set_meta(key, decode_scalar(&value)?);
        }
    }

    match root.remove("cols") {
        Some(Value::Array(cols)) => {
            for col in cols {
                let Value::Object(mut col) = col else {
                    return Err(malformed("grid column must be an object"));
                };
                let name = match col.remove("name") {
                    Some(Value::String(name)) => name,
                    _ => return Err(malformed("grid column without a name")),
                };
                let mut meta = Meta::new();
                for (key, value) in col {
                    meta.insert(key, decode_scalar(&value)?);
                }
                grid.add_column_with_meta(name, meta);
            }
        }
        None => {}
        Some(_) => return Err(malformed("grid cols must be an array")),
    }

    match root.remove("rows") {
        Some(Value::Array(rows)) => {
            for row in rows {
                let Value::Object(row) = row else {
                    return Err(malformed("grid row must be an object"));
                };
                let mut out = Row::new();
                for (key, value) in row {
                    out.insert(key, decode_scalar(&value)?);
                }
                grid.push_row(out);
            }
        }
        None => {}
        Some(_) => return Err(malformed("grid rows must be an array")),
    }

    Ok(grid)
}

fn encode_scalar(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Null => Value::Null,
        Scalar::Marker => Value::String("m:".into()),
        Scalar::Remove => Value::String("-:".into()),
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Num(n, Some(unit)) => Value::String(format!("n:{n} {unit}")),
        Scalar::Num(n, None) => {
            if n.is_finite() {
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(format!("n:{n}")))
            } else {
                Value::String(format!("n:{}", Scalar::num(*n).to_zinc()))
            }
        }
        Scalar::Str(s) => {
            // A plain string that happens to look like a typed literal
            // ("x:...") must be prefix-escaped or it would decode as that
            // type.
            if s.as_bytes().get(1) == Some(&b':') {
                Value::String(format!("s:{s}"))
            } else {
                Value::String(s.clone())
            }
        }
        Scalar::Ref(id, dis) => match dis {
            Some(dis) => Value::String(format!("r:{id} {dis}")),
            None => Value::String(format!("r:{id}")),
        },
        Scalar::Uri(u) => Value::String(format!("u:{u}")),
        Scalar::Date(d) => Value::String(format!("d:{}", d.format("%Y-%m-%d"))),
        Scalar::Time(t) => Value::String(format!("h:{}", t.format("%H:%M:%S%.3f"))),
        Scalar::DateTime(dt) => Value::String(format!("t:{}", dt.to_rfc3339())),
    }
}

fn decode_scalar(value: &Value) -> Result<Scalar, Error> {
    match value {
        Value::Null => Ok(Scalar::Null),
        Value::Bool(b) => Ok(Scalar::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(Scalar::num)
            .ok_or_else(|| malformed(format!("unrepresentable number {n}"))),
        Value::String(s) => decode_typed_str(s),
        other => Err(malformed(format!("unsupported scalar {other}"))),
    }
}

fn decode_typed_str(s: &str) -> Result<Scalar, Error> {
    let Some((prefix, rest)) = s.split_once(':') else {
        return Ok(Scalar::str(s));
    };
    match prefix {
        "m" => Ok(Scalar::Marker),
        "-" => Ok(Scalar::Remove),
        "s" => Ok(Scalar::str(rest)),
        "u" => Ok(Scalar::Uri(rest.to_string())),
        "r" => match rest.split_once(' ') {
            Some((id, dis)) => Ok(Scalar::Ref(id.to_string(), Some(dis.to_string()))),
            None => Ok(Scalar::make_ref(rest)),
        },
        "n" => {
            let (num, unit) = match rest.split_once(' ') {
                Some((num, unit)) => (num, Some(unit.to_string())),
                None => (rest, None),
            };
            let value = match num {
                "INF" => f64::INFINITY,
                "-INF" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                other => other
                    .parse()
                    .map_err(|_| malformed(format!("bad number literal {other:?}")))?,
            };
            Ok(Scalar::Num(value, unit))
        }
        "d" => rest
            .parse()
            .map(Scalar::Date)
            .map_err(|_| malformed(format!("bad date literal {rest:?}"))),
        "h" => rest
            .parse()
            .map(Scalar::Time)
            .map_err(|_| malformed(format!("bad time literal {rest:?}"))),
        "t" => {
            // Timestamps may carry a trailing timezone name after the
            // offset; the offset is authoritative.
            let iso = rest.split_whitespace().next().unwrap_or(rest);
            chrono::DateTime::parse_from_rfc3339(iso)
                .map(Scalar::DateTime)
                .map_err(|_| malformed(format!("bad timestamp literal {rest:?}")))
        }
        // Not a recognised prefix: it is just a string with a colon in it.
        _ => Ok(Scalar::str(s)),
    }
}
