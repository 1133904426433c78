//! Records — ordered, case-insensitive attribute maps.
//!
//! Attribute order is kept for diagnostics and stable output only; it
//! carries no meaning. Equality is attribute-set equality.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ClassAdError, ClassAdResult};
use crate::eval;
use crate::expr::Expr;
use crate::parse;
use crate::value::Value;

/// An ordered mapping from attribute name to expression.
#[derive(Debug, Clone, Default)]
pub struct Record {
    attrs: Vec<(String, Expr)>,
    /// Lowercased name → position in `attrs`.
    index: HashMap<String, usize>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the bracketed wire form: `[ a = 1; b = "x" ]`.
    pub fn parse(text: &str) -> ClassAdResult<Self> {
        parse::parse_record(text)
    }

    /// Parse one record in long form: one `Name = expr` per line.
    ///
    /// Blank lines and `#` comments are skipped.
    pub fn parse_long(text: &str) -> ClassAdResult<Self> {
        let mut records = Self::parse_long_many(text)?;
        match records.len() {
            0 => Ok(Record::new()),
            1 => Ok(records.remove(0)),
            n => Err(ClassAdError::Line {
                line: 0,
                message: format!("expected one record, found {n}"),
            }),
        }
    }

    /// Parse a stream of long-form records separated by blank lines.
    pub fn parse_long_many(text: &str) -> ClassAdResult<Vec<Self>> {
        let mut records = Vec::new();
        let mut current = Record::new();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if !current.is_empty() {
                    records.push(std::mem::take(&mut current));
                }
                continue;
            }
            if trimmed.starts_with('#') {
                continue;
            }
            let (name, expr) =
                parse::parse_assignment(trimmed).map_err(|e| ClassAdError::Line {
                    line: lineno + 1,
                    message: e.to_string(),
                })?;
            current.insert(name, expr);
        }
        if !current.is_empty() {
            records.push(current);
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Insert or replace an attribute. A replaced attribute keeps its
    /// original position and the spelling of its first insertion.
    pub fn insert(&mut self, name: impl Into<String>, expr: Expr) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&pos) => self.attrs[pos].1 = expr,
            None => {
                self.index.insert(key, self.attrs.len());
                self.attrs.push((name, expr));
            }
        }
    }

    /// Insert a constant value.
    pub fn insert_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.insert(name, Expr::from_value(value.into()));
    }

    /// Parse `text` as an expression and insert it.
    pub fn insert_text(&mut self, name: impl Into<String>, text: &str) -> ClassAdResult<()> {
        let expr = parse::parse_expr(text)?;
        self.insert(name, expr);
        Ok(())
    }

    /// Builder form of [`Record::insert_text`].
    pub fn with(mut self, name: &str, text: &str) -> ClassAdResult<Self> {
        self.insert_text(name, text)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        let pos = *self.index.get(&name.to_ascii_lowercase())?;
        Some(&self.attrs[pos].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Expr> {
        let pos = self.index.remove(&name.to_ascii_lowercase())?;
        let (_, expr) = self.attrs.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(expr)
    }

    /// Attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.attrs.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|(n, _)| n.as_str())
    }

    /// Merge `other` into this record; its attributes win.
    pub fn update(&mut self, other: &Record) {
        for (name, expr) in other.iter() {
            self.insert(name, expr.clone());
        }
    }

    // ── Evaluation helpers ─────────────────────────────────────────

    /// Evaluate an attribute of this record, optionally against a
    /// counterpart.
    pub fn evaluate_attr(&self, name: &str, other: Option<&Record>) -> Value {
        eval::evaluate_attr(name, self, other)
    }

    pub fn lookup_integer(&self, name: &str) -> Option<i64> {
        match self.evaluate_attr(name, None) {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Numeric lookup; integers are promoted.
    pub fn lookup_real(&self, name: &str) -> Option<f64> {
        self.evaluate_attr(name, None).as_f64()
    }

    pub fn lookup_string(&self, name: &str) -> Option<String> {
        match self.evaluate_attr(name, None) {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn lookup_bool(&self, name: &str) -> Option<bool> {
        self.evaluate_attr(name, None).as_bool()
    }

    /// Render in long form, one attribute per line.
    pub fn to_long_string(&self) -> String {
        let mut out = String::new();
        for (name, expr) in self.iter() {
            out.push_str(&format!("{} = {expr}\n", AttrName(name)));
        }
        out
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(name, expr)| other.get(name).is_some_and(|e| e == expr))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("[ ]");
        }
        f.write_str("[ ")?;
        for (i, (name, expr)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} = {expr}", AttrName(name))?;
        }
        f.write_str(" ]")
    }
}

impl std::str::FromStr for Record {
    type Err = ClassAdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Record::parse(s)
    }
}

struct AttrName<'a>(&'a str);

impl fmt::Display for AttrName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_attr_name(f, self.0)
    }
}

/// Write an attribute name, quoting it when it is not a plain identifier
/// or collides with a keyword.
pub(crate) fn write_attr_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if parse::is_plain_identifier(name) {
        return f.write_str(name);
    }
    f.write_str("'")?;
    for c in name.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("'")
}
