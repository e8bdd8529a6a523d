//! Scalar values carried in grid cells and metadata.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};

/// A single tag value.
///
/// `Marker` means "tag present with no value"; `Remove` means "delete this
/// tag". A missing cell reads as `Null`, never as an absent key.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Scalar {
    #[default]
    Null,
    Marker,
    Remove,
    Bool(bool),
    /// Number with optional unit, e.g. `Num(21.5, Some("°C"))`.
    Num(f64, Option<String>),
    Str(String),
    /// Entity reference: id plus optional display string.
    Ref(String, Option<String>),
    Uri(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<FixedOffset>),
}

impl Scalar {
    /// Convenience constructor for a reference scalar.
    pub fn make_ref(id: impl Into<String>) -> Self {
        Scalar::Ref(id.into(), None)
    }

    /// Convenience constructor for a string scalar.
    pub fn str(value: impl Into<String>) -> Self {
        Scalar::Str(value.into())
    }

    /// Convenience constructor for a unitless number.
    pub fn num(value: f64) -> Self {
        Scalar::Num(value, None)
    }

    /// Canonical ZINC wire form of this scalar.
    ///
    /// Used both for query-string arguments and for folding arguments into
    /// cache keys, so it must be deterministic.
    pub fn to_zinc(&self) -> String {
        match self {
            Scalar::Null => "N".to_string(),
            Scalar::Marker => "M".to_string(),
            Scalar::Remove => "R".to_string(),
            Scalar::Bool(true) => "T".to_string(),
            Scalar::Bool(false) => "F".to_string(),
            Scalar::Num(n, unit) => {
                let mut out = format_number(*n);
                if let Some(unit) = unit {
                    out.push_str(unit);
                }
                out
            }
            Scalar::Str(s) => quote_str(s),
            Scalar::Ref(id, dis) => match dis {
                Some(dis) => format!("@{id} {}", quote_str(dis)),
                None => format!("@{id}"),
            },
            Scalar::Uri(u) => format!("`{u}`"),
            Scalar::Date(d) => d.format("%Y-%m-%d").to_string(),
            Scalar::Time(t) => t.format("%H:%M:%S%.3f").to_string(),
            Scalar::DateTime(dt) => dt.to_rfc3339(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "INF".to_string() } else { "-INF".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' => out.push_str("\\$"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
