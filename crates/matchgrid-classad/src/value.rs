//! Evaluated values.
//!
//! A [`Value`] is what an expression evaluates to. Two variants carry the
//! extended logic the matchmaker depends on: `Undefined` (data missing or
//! not yet resolvable) and `Error` (the expression is wrong for the data it
//! was given). They are distinct and never collapse into each other.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};

use crate::record::Record;

/// An absolute point in time: seconds since the Unix epoch plus the
/// UTC offset (in seconds) it was expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsTime {
    pub secs: i64,
    pub offset: i32,
}

impl AbsTime {
    pub fn utc(secs: i64) -> Self {
        Self { secs, offset: 0 }
    }

    /// Parse an RFC 3339 timestamp (`2024-03-01T12:00:00+01:00`).
    pub fn parse(text: &str) -> Option<Self> {
        let dt = DateTime::parse_from_rfc3339(text.trim()).ok()?;
        Some(Self {
            secs: dt.timestamp(),
            offset: dt.offset().local_minus_utc(),
        })
    }

    /// Render as RFC 3339 in the original offset, if representable.
    pub fn to_rfc3339(&self) -> Option<String> {
        let offset = FixedOffset::east_opt(self.offset)?;
        let dt = DateTime::from_timestamp(self.secs, 0)?.with_timezone(&offset);
        Some(dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string())
    }
}

/// The result of evaluating an expression.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    /// Evaluation failed; the text says why.
    Error(String),
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    AbsTime(AbsTime),
    /// A duration in seconds.
    RelTime(f64),
    List(Vec<Value>),
    Record(Arc<Record>),
}

impl Value {
    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(message.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// True only for `Boolean(true)`. Undefined and Error are not true.
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Real(_))
    }

    /// Numeric view with Integer promoted to Real.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(r) if r.is_finite() => Some(*r as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Short name of the value's kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Error(_) => "error",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::String(_) => "string",
            Value::AbsTime(_) => "abstime",
            Value::RelTime(_) => "reltime",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Identity comparison (`=?=`): same kind and identical content.
    /// Strings compare case-sensitively; never yields Undefined.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Error(_), Value::Error(_)) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::AbsTime(a), Value::AbsTime(b)) => a == b,
            (Value::RelTime(a), Value::RelTime(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identical(y))
            }
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.identical(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(Arc::new(r))
    }
}

// ── Literal formatting ─────────────────────────────────────────────

pub(crate) fn write_real(f: &mut fmt::Formatter<'_>, r: f64) -> fmt::Result {
    if r.is_nan() {
        f.write_str("real(\"NaN\")")
    } else if r == f64::INFINITY {
        f.write_str("real(\"INF\")")
    } else if r == f64::NEG_INFINITY {
        f.write_str("real(\"-INF\")")
    } else {
        write!(f, "{r:?}")
    }
}

pub(crate) fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

/// Format a duration as `[-][D+]HH:MM:SS`. Returns `None` when the value
/// has a fractional part and can't be written exactly in that form.
pub fn format_reltime(secs: f64) -> Option<String> {
    if !secs.is_finite() || secs.fract() != 0.0 || secs.abs() > i64::MAX as f64 {
        return None;
    }
    let total = secs.abs() as i64;
    let sign = if secs < 0.0 { "-" } else { "" };
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        Some(format!("{sign}{days}+{hours:02}:{minutes:02}:{seconds:02}"))
    } else {
        Some(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
    }
}

/// Parse `[-][D+]HH:MM:SS[.frac]`, `MM:SS`, or a plain number of seconds.
pub fn parse_reltime(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<f64>() {
        return Some(secs);
    }
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (days, clock) = match body.split_once('+') {
        Some((d, rest)) => (d.trim().parse::<u64>().ok()?, rest),
        None => (0, body),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, s.parse::<f64>().ok()?),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<f64>().ok()?),
        _ => return None,
    };
    if m >= 60 || !(0.0..60.0).contains(&s) {
        return None;
    }
    let total = days as f64 * 86_400.0 + h as f64 * 3_600.0 + m as f64 * 60.0 + s;
    Some(if negative { -total } else { total })
}

impl fmt::Display for Value {
    /// Writes the value in the wire syntax the parser reads back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Error(_) => f.write_str("error"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write_real(f, *r),
            Value::String(s) => write_string(f, s),
            Value::AbsTime(t) => match t.to_rfc3339() {
                Some(text) => write!(f, "absTime(\"{text}\")"),
                None => write!(f, "absTime({})", t.secs),
            },
            Value::RelTime(secs) => match format_reltime(*secs) {
                Some(text) => write!(f, "relTime(\"{text}\")"),
                None => {
                    f.write_str("relTime(")?;
                    write_real(f, *secs)?;
                    f.write_str(")")
                }
            },
            Value::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
            Value::Record(r) => write!(f, "{r}"),
        }
    }
}
