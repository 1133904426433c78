//! Built-in functions.
//!
//! Names are case-insensitive. Arguments are evaluated eagerly except for
//! `ifThenElse`, which evaluates only the branch it selects. Unknown
//! functions and wrong arities evaluate to Error.

use std::cmp::Ordering;

use chrono::Utc;
use regex::RegexBuilder;

use crate::eval::Evaluator;
use crate::expr::{BinaryOp, Expr};
use crate::ops;
use crate::value::{AbsTime, Value, format_reltime, parse_reltime};

const DEFAULT_DELIMS: &str = " ,";

pub(crate) fn call(ev: &mut Evaluator<'_>, name: &str, args: &[Expr]) -> Value {
    let lower = name.to_ascii_lowercase();
    if lower == "ifthenelse" {
        return if_then_else(ev, args);
    }
    let args: Vec<Value> = args.iter().map(|a| ev.eval(a)).collect();
    dispatch(&lower, &args).unwrap_or_else(|| {
        if is_known(&lower) {
            Value::error(format!("wrong number of arguments to {name}"))
        } else {
            Value::error(format!("unknown function {name}"))
        }
    })
}

const KNOWN: &[&str] = &[
    "isundefined", "iserror", "isstring", "isinteger", "isreal", "islist", "isclassad",
    "isboolean", "isabstime", "isreltime", "member", "identicalmember", "size", "sum", "avg",
    "min", "max", "anycompare", "allcompare", "strcat", "join", "toupper", "tolower", "substr",
    "strcmp", "stricmp", "regexp", "regexpmember", "stringlistmember", "stringlistimember",
    "stringlistsize", "stringlistsintersect", "int", "real", "string", "bool", "abstime",
    "reltime", "floor", "ceil", "ceiling", "round", "pow", "time", "ifthenelse",
];

fn is_known(lower: &str) -> bool {
    KNOWN.contains(&lower)
}

/// `None` means the arity did not fit.
fn dispatch(name: &str, args: &[Value]) -> Option<Value> {
    let v = match (name, args) {
        // ── Type predicates ──
        ("isundefined", [a]) => Value::Boolean(matches!(a, Value::Undefined)),
        ("iserror", [a]) => Value::Boolean(matches!(a, Value::Error(_))),
        ("isstring", [a]) => Value::Boolean(matches!(a, Value::String(_))),
        ("isinteger", [a]) => Value::Boolean(matches!(a, Value::Integer(_))),
        ("isreal", [a]) => Value::Boolean(matches!(a, Value::Real(_))),
        ("islist", [a]) => Value::Boolean(matches!(a, Value::List(_))),
        ("isclassad", [a]) => Value::Boolean(matches!(a, Value::Record(_))),
        ("isboolean", [a]) => Value::Boolean(matches!(a, Value::Boolean(_))),
        ("isabstime", [a]) => Value::Boolean(matches!(a, Value::AbsTime(_))),
        ("isreltime", [a]) => Value::Boolean(matches!(a, Value::RelTime(_))),

        // ── Lists ──
        ("member", [x, list]) => member(x, list, false),
        ("identicalmember", [x, list]) => member(x, list, true),
        ("size", [a]) => size(a),
        ("sum", [a]) => aggregate(a, Aggregate::Sum),
        ("avg", [a]) => aggregate(a, Aggregate::Avg),
        ("min", [a]) => aggregate(a, Aggregate::Min),
        ("max", [a]) => aggregate(a, Aggregate::Max),
        ("anycompare", [op, list, x]) => list_compare(op, list, x, false),
        ("allcompare", [op, list, x]) => list_compare(op, list, x, true),

        // ── Strings ──
        ("strcat", args) => strcat(args),
        ("join", args) if !args.is_empty() => join(args),
        ("toupper", [a]) => map_text(a, |s| s.to_uppercase()),
        ("tolower", [a]) => map_text(a, |s| s.to_lowercase()),
        ("substr", [s, offset]) => substr(s, offset, None),
        ("substr", [s, offset, len]) => substr(s, offset, Some(len)),
        ("strcmp", [a, b]) => string_compare(a, b, false),
        ("stricmp", [a, b]) => string_compare(a, b, true),
        ("regexp", [pattern, target]) => regexp(pattern, target, &Value::from("")),
        ("regexp", [pattern, target, options]) => regexp(pattern, target, options),
        ("regexpmember", [pattern, list]) => regexp_member(pattern, list, &Value::from("")),
        ("regexpmember", [pattern, list, options]) => regexp_member(pattern, list, options),
        ("stringlistmember", [item, list]) => string_list_member(item, list, None, false),
        ("stringlistmember", [item, list, d]) => string_list_member(item, list, Some(d), false),
        ("stringlistimember", [item, list]) => string_list_member(item, list, None, true),
        ("stringlistimember", [item, list, d]) => string_list_member(item, list, Some(d), true),
        ("stringlistsize", [list]) => string_list_size(list, None),
        ("stringlistsize", [list, d]) => string_list_size(list, Some(d)),
        ("stringlistsintersect", [a, b]) => string_lists_intersect(a, b, None),
        ("stringlistsintersect", [a, b, d]) => string_lists_intersect(a, b, Some(d)),

        // ── Conversion ──
        ("int", [a]) => to_int(a),
        ("real", [a]) => to_real(a),
        ("string", [a]) => to_string_value(a),
        ("bool", [a]) => to_bool(a),
        ("abstime", []) => Value::AbsTime(AbsTime::utc(Utc::now().timestamp())),
        ("abstime", [a]) => to_abstime(a, None),
        ("abstime", [a, offset]) => to_abstime(a, Some(offset)),
        ("reltime", [a]) => to_reltime(a),

        // ── Math ──
        ("floor", [a]) => rounding(a, f64::floor),
        ("ceil" | "ceiling", [a]) => rounding(a, f64::ceil),
        ("round", [a]) => rounding(a, f64::round),
        ("pow", [base, exp]) => pow(base, exp),

        // ── Time ──
        ("time", []) => Value::Integer(Utc::now().timestamp()),

        _ => return None,
    };
    Some(v)
}

/// Propagate Error, then Undefined, from any argument.
fn propagate(args: &[&Value]) -> Option<Value> {
    if let Some(e) = args.iter().find(|v| v.is_error()) {
        return Some((*e).clone());
    }
    if args.iter().any(|v| v.is_undefined()) {
        return Some(Value::Undefined);
    }
    None
}

fn if_then_else(ev: &mut Evaluator<'_>, args: &[Expr]) -> Value {
    let [cond, then, otherwise] = args else {
        return Value::error("wrong number of arguments to ifThenElse");
    };
    let selected = match ev.eval(cond) {
        Value::Boolean(b) => b,
        Value::Integer(i) => i != 0,
        Value::Real(r) => r != 0.0,
        Value::Undefined => return Value::Undefined,
        e @ Value::Error(_) => return e,
        v => return Value::error(format!("ifThenElse condition is {}", v.kind())),
    };
    if selected {
        ev.eval(then)
    } else {
        ev.eval(otherwise)
    }
}

// ── Lists ──────────────────────────────────────────────────────────

fn member(x: &Value, list: &Value, identical: bool) -> Value {
    if let Some(v) = propagate(&[x, list]) {
        return v;
    }
    let Value::List(items) = list else {
        return Value::error(format!("member expects a list, got {}", list.kind()));
    };
    if identical {
        return Value::Boolean(items.iter().any(|item| item.identical(x)));
    }
    if matches!(x, Value::List(_) | Value::Record(_)) {
        return Value::error("member expects a scalar");
    }
    let found = items
        .iter()
        .any(|item| ops::binary(BinaryOp::Eq, x, item).is_true());
    Value::Boolean(found)
}

fn size(a: &Value) -> Value {
    match a {
        Value::List(items) => Value::Integer(items.len() as i64),
        Value::String(s) => Value::Integer(s.chars().count() as i64),
        Value::Record(r) => Value::Integer(r.len() as i64),
        Value::Undefined => Value::Undefined,
        e @ Value::Error(_) => e.clone(),
        v => Value::error(format!("size of {}", v.kind())),
    }
}

#[derive(Clone, Copy)]
enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
}

fn aggregate(list: &Value, kind: Aggregate) -> Value {
    let items = match list {
        Value::List(items) => items,
        Value::Undefined => return Value::Undefined,
        e @ Value::Error(_) => return e.clone(),
        v => return Value::error(format!("expected a list, got {}", v.kind())),
    };
    if items.is_empty() {
        return match kind {
            Aggregate::Sum => Value::Integer(0),
            Aggregate::Avg => Value::Real(0.0),
            Aggregate::Min | Aggregate::Max => Value::Undefined,
        };
    }
    let mut acc: Option<Value> = None;
    for item in items {
        match item {
            Value::Integer(_) | Value::Real(_) => {}
            Value::Undefined => return Value::Undefined,
            e @ Value::Error(_) => return e.clone(),
            v => return Value::error(format!("cannot aggregate {}", v.kind())),
        }
        acc = Some(match (acc, kind) {
            (None, _) => item.clone(),
            (Some(a), Aggregate::Sum | Aggregate::Avg) => ops::binary(BinaryOp::Add, &a, item),
            (Some(a), Aggregate::Min) => pick(a, item, Ordering::Less),
            (Some(a), Aggregate::Max) => pick(a, item, Ordering::Greater),
        });
    }
    let acc = acc.unwrap_or(Value::Undefined);
    match kind {
        Aggregate::Avg => match acc.as_f64() {
            Some(total) => Value::Real(total / items.len() as f64),
            None => acc,
        },
        _ => acc,
    }
}

/// Keep `current` unless `candidate` orders `wanted` relative to it.
fn pick(current: Value, candidate: &Value, wanted: Ordering) -> Value {
    match ops::ordering(candidate, &current) {
        Ok(Some(o)) if o == wanted => candidate.clone(),
        _ => current,
    }
}

fn list_compare(op: &Value, list: &Value, x: &Value, all: bool) -> Value {
    if let Some(v) = propagate(&[op, list]) {
        return v;
    }
    let Value::String(op_text) = op else {
        return Value::error("comparison operator must be a string");
    };
    let op = match op_text.to_ascii_lowercase().as_str() {
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "is" | "=?=" => BinaryOp::Is,
        "isnt" | "=!=" => BinaryOp::Isnt,
        other => return Value::error(format!("unknown comparison operator {other:?}")),
    };
    let Value::List(items) = list else {
        return Value::error(format!("expected a list, got {}", list.kind()));
    };
    let mut results = items.iter().map(|item| ops::binary(op, item, x).is_true());
    Value::Boolean(if all {
        results.all(|b| b)
    } else {
        results.any(|b| b)
    })
}

// ── Strings ────────────────────────────────────────────────────────

/// Textual form of a scalar for string functions.
fn text_of(v: &Value) -> Result<String, Value> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Real(_) | Value::Boolean(_) => Ok(v.to_string()),
        Value::AbsTime(t) => Ok(t.to_rfc3339().unwrap_or_else(|| t.secs.to_string())),
        Value::RelTime(secs) => Ok(format_reltime(*secs).unwrap_or_else(|| secs.to_string())),
        Value::Undefined => Err(Value::Undefined),
        Value::Error(_) => Err(v.clone()),
        v => Err(Value::error(format!("{} is not a scalar", v.kind()))),
    }
}

fn strcat(args: &[Value]) -> Value {
    let mut out = String::new();
    for a in args {
        match text_of(a) {
            Ok(s) => out.push_str(&s),
            Err(v) => return v,
        }
    }
    Value::String(out)
}

/// `join(sep, list)`, `join(sep, a, b, ...)` or `join(list)`.
fn join(args: &[Value]) -> Value {
    let (sep, items): (String, &[Value]) = match args {
        [Value::List(items)] => (String::new(), items),
        [sep, Value::List(items)] => match text_of(sep) {
            Ok(s) => (s, items),
            Err(v) => return v,
        },
        [sep, rest @ ..] => match text_of(sep) {
            Ok(s) => (s, rest),
            Err(v) => return v,
        },
        [] => return Value::error("join needs arguments"),
    };
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Undefined => continue,
            other => match text_of(other) {
                Ok(s) => parts.push(s),
                Err(v) => return v,
            },
        }
    }
    Value::String(parts.join(&sep))
}

fn map_text(a: &Value, f: impl Fn(&str) -> String) -> Value {
    match text_of(a) {
        Ok(s) => Value::String(f(&s)),
        Err(v) => v,
    }
}

/// Negative offsets count from the end; a negative length leaves that
/// many characters off the end.
fn substr(s: &Value, offset: &Value, len: Option<&Value>) -> Value {
    let mut check = vec![s, offset];
    check.extend(len);
    if let Some(v) = propagate(&check) {
        return v;
    }
    let Value::String(s) = s else {
        return Value::error("substr expects a string");
    };
    let Value::Integer(offset) = offset else {
        return Value::error("substr offset must be an integer");
    };
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len() as i64;
    let start = if *offset < 0 {
        n.saturating_add(*offset).max(0)
    } else {
        (*offset).min(n)
    };
    let end = match len {
        None => n,
        Some(Value::Integer(l)) if *l < 0 => n.saturating_add(*l).max(start),
        Some(Value::Integer(l)) => start.saturating_add(*l).min(n),
        Some(_) => return Value::error("substr length must be an integer"),
    };
    Value::String(chars[start as usize..end as usize].iter().collect())
}

fn string_compare(a: &Value, b: &Value, fold: bool) -> Value {
    let (a, b) = match (text_of(a), text_of(b)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(v), _) | (_, Err(v)) => return v,
    };
    let ord = if fold {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(&b)
    };
    Value::Integer(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn build_regex(pattern: &str, options: &str) -> Result<regex::Regex, Value> {
    let mut builder = RegexBuilder::new(pattern);
    for c in options.chars() {
        match c.to_ascii_lowercase() {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }
    builder
        .build()
        .map_err(|e| Value::error(format!("bad regular expression: {e}")))
}

fn regexp(pattern: &Value, target: &Value, options: &Value) -> Value {
    if let Some(v) = propagate(&[pattern, target, options]) {
        return v;
    }
    let (Value::String(p), Value::String(t), Value::String(o)) = (pattern, target, options) else {
        return Value::error("regexp expects string arguments");
    };
    match build_regex(p, o) {
        Ok(re) => Value::Boolean(re.is_match(t)),
        Err(e) => e,
    }
}

fn regexp_member(pattern: &Value, list: &Value, options: &Value) -> Value {
    if let Some(v) = propagate(&[pattern, list, options]) {
        return v;
    }
    let (Value::String(p), Value::List(items), Value::String(o)) = (pattern, list, options) else {
        return Value::error("regexpMember expects a pattern and a list");
    };
    let re = match build_regex(p, o) {
        Ok(re) => re,
        Err(e) => return e,
    };
    let mut found = false;
    for item in items {
        match item {
            Value::String(s) => found |= re.is_match(s),
            Value::Undefined => {}
            v => return Value::error(format!("regexpMember over {}", v.kind())),
        }
    }
    Value::Boolean(found)
}

fn split_list<'s>(list: &'s str, delims: &str) -> impl Iterator<Item = &'s str> {
    let delims: Vec<char> = delims.chars().collect();
    list.split(move |c: char| delims.contains(&c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn delims_of(d: Option<&Value>) -> Result<String, Value> {
    match d {
        None => Ok(DEFAULT_DELIMS.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v) => Err(text_of(v).err().unwrap_or_else(|| Value::error("delimiters must be a string"))),
    }
}

fn string_list_member(item: &Value, list: &Value, d: Option<&Value>, fold: bool) -> Value {
    let (item, list) = match (text_of(item), list) {
        (Ok(i), Value::String(l)) => (i, l),
        (Err(v), _) => return v,
        (_, Value::Undefined) => return Value::Undefined,
        (_, e @ Value::Error(_)) => return e.clone(),
        _ => return Value::error("stringListMember expects a string list"),
    };
    let delims = match delims_of(d) {
        Ok(d) => d,
        Err(v) => return v,
    };
    let found = split_list(list, &delims).any(|entry| {
        if fold {
            entry.eq_ignore_ascii_case(&item)
        } else {
            entry == item
        }
    });
    Value::Boolean(found)
}

fn string_list_size(list: &Value, d: Option<&Value>) -> Value {
    let list = match list {
        Value::String(l) => l,
        Value::Undefined => return Value::Undefined,
        e @ Value::Error(_) => return e.clone(),
        v => return Value::error(format!("stringListSize of {}", v.kind())),
    };
    match delims_of(d) {
        Ok(delims) => Value::Integer(split_list(list, &delims).count() as i64),
        Err(v) => v,
    }
}

fn string_lists_intersect(a: &Value, b: &Value, d: Option<&Value>) -> Value {
    if let Some(v) = propagate(&[a, b]) {
        return v;
    }
    let (Value::String(a), Value::String(b)) = (a, b) else {
        return Value::error("stringListsIntersect expects strings");
    };
    let delims = match delims_of(d) {
        Ok(d) => d,
        Err(v) => return v,
    };
    let right: Vec<&str> = split_list(b, &delims).collect();
    Value::Boolean(split_list(a, &delims).any(|x| right.contains(&x)))
}

// ── Conversion ─────────────────────────────────────────────────────

fn to_int(a: &Value) -> Value {
    match a {
        Value::Integer(i) => Value::Integer(*i),
        Value::Real(r) if r.is_finite() => Value::Integer(r.trunc() as i64),
        Value::Boolean(b) => Value::Integer(i64::from(*b)),
        Value::AbsTime(t) => Value::Integer(t.secs),
        Value::RelTime(r) => Value::Integer(r.trunc() as i64),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::Integer(i)
            } else {
                match s.parse::<f64>() {
                    Ok(r) if r.is_finite() => Value::Integer(r.trunc() as i64),
                    _ => Value::error(format!("cannot convert {s:?} to integer")),
                }
            }
        }
        Value::Undefined => Value::Undefined,
        v => Value::error(format!("cannot convert {} to integer", v.kind())),
    }
}

fn to_real(a: &Value) -> Value {
    match a {
        Value::Integer(i) => Value::Real(*i as f64),
        Value::Real(r) => Value::Real(*r),
        Value::Boolean(b) => Value::Real(if *b { 1.0 } else { 0.0 }),
        Value::AbsTime(t) => Value::Real(t.secs as f64),
        Value::RelTime(r) => Value::Real(*r),
        Value::String(s) => match s.trim() {
            "NaN" => Value::Real(f64::NAN),
            "INF" => Value::Real(f64::INFINITY),
            "-INF" => Value::Real(f64::NEG_INFINITY),
            t => t
                .parse::<f64>()
                .map(Value::Real)
                .unwrap_or_else(|_| Value::error(format!("cannot convert {t:?} to real"))),
        },
        Value::Undefined => Value::Undefined,
        v => Value::error(format!("cannot convert {} to real", v.kind())),
    }
}

fn to_string_value(a: &Value) -> Value {
    match a {
        Value::String(_) | Value::Undefined | Value::Error(_) => a.clone(),
        Value::List(_) | Value::Record(_) => Value::String(a.to_string()),
        v => text_of(v).map(Value::String).unwrap_or_else(|e| e),
    }
}

fn to_bool(a: &Value) -> Value {
    match a {
        Value::Boolean(b) => Value::Boolean(*b),
        Value::Integer(i) => Value::Boolean(*i != 0),
        Value::Real(r) => Value::Boolean(*r != 0.0),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Value::Boolean(true),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Value::Boolean(false),
        Value::Undefined => Value::Undefined,
        v => Value::error(format!("cannot convert {} to boolean", v.kind())),
    }
}

fn to_abstime(a: &Value, offset: Option<&Value>) -> Value {
    let offset = match offset {
        None => None,
        Some(Value::Integer(o)) => match i32::try_from(*o) {
            Ok(o) => Some(o),
            Err(_) => return Value::error("time zone offset out of range"),
        },
        Some(Value::Undefined) => return Value::Undefined,
        Some(_) => return Value::error("time zone offset must be an integer"),
    };
    let t = match a {
        Value::AbsTime(t) => *t,
        Value::String(s) => match AbsTime::parse(s) {
            Some(t) => t,
            None => return Value::error(format!("cannot parse {s:?} as absolute time")),
        },
        Value::Integer(_) | Value::Real(_) => AbsTime::utc(a.as_i64().unwrap_or_default()),
        Value::Undefined => return Value::Undefined,
        v => return Value::error(format!("cannot convert {} to absolute time", v.kind())),
    };
    Value::AbsTime(match offset {
        Some(offset) => AbsTime { secs: t.secs, offset },
        None => t,
    })
}

fn to_reltime(a: &Value) -> Value {
    match a {
        Value::RelTime(r) => Value::RelTime(*r),
        Value::Integer(_) | Value::Real(_) => Value::RelTime(a.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => parse_reltime(s)
            .map(Value::RelTime)
            .unwrap_or_else(|| Value::error(format!("cannot parse {s:?} as relative time"))),
        Value::Undefined => Value::Undefined,
        v => Value::error(format!("cannot convert {} to relative time", v.kind())),
    }
}

// ── Math ───────────────────────────────────────────────────────────

fn rounding(a: &Value, f: fn(f64) -> f64) -> Value {
    match a {
        Value::Integer(i) => Value::Integer(*i),
        Value::Real(r) if r.is_finite() => Value::Integer(f(*r) as i64),
        Value::Undefined => Value::Undefined,
        e @ Value::Error(_) => e.clone(),
        v => Value::error(format!("cannot round {}", v.kind())),
    }
}

fn pow(base: &Value, exp: &Value) -> Value {
    if let Some(v) = propagate(&[base, exp]) {
        return v;
    }
    match (base, exp) {
        (Value::Integer(b), Value::Integer(e)) if *e >= 0 => match u32::try_from(*e) {
            Ok(e) => Value::Integer(b.wrapping_pow(e)),
            Err(_) => Value::Real((*b as f64).powf(*e as f64)),
        },
        (b, e) if b.is_number() && e.is_number() => {
            Value::Real(b.as_f64().unwrap_or(f64::NAN).powf(e.as_f64().unwrap_or(f64::NAN)))
        }
        (b, e) => Value::error(format!("pow of {} and {}", b.kind(), e.kind())),
    }
}

#[cfg(test)]
mod tests {
    use crate::parse::parse_expr;
    use crate::record::Record;
    use crate::value::Value;

    fn eval(text: &str) -> Value {
        crate::eval::evaluate(&parse_expr(text).unwrap(), &Record::new(), None)
    }

    #[test]
    fn predicates() {
        assert_eq!(eval("isUndefined(Missing)"), Value::Boolean(true));
        assert_eq!(eval("IsError(1/0)"), Value::Boolean(true));
        assert_eq!(eval("isString(\"x\")"), Value::Boolean(true));
        assert_eq!(eval("isReltime(relTime(5))"), Value::Boolean(true));
    }

    #[test]
    fn list_functions() {
        assert_eq!(eval("member(\"B\", {\"a\", \"b\"})"), Value::Boolean(true));
        assert_eq!(eval("identicalMember(\"B\", {\"a\", \"b\"})"), Value::Boolean(false));
        assert_eq!(eval("size({1, 2, 3})"), Value::Integer(3));
        assert_eq!(eval("sum({1, 2, 3})"), Value::Integer(6));
        assert_eq!(eval("sum({1, 2.5})"), Value::Real(3.5));
        assert_eq!(eval("avg({1, 2})"), Value::Real(1.5));
        assert_eq!(eval("min({3, 1, 2})"), Value::Integer(1));
        assert_eq!(eval("max({})"), Value::Undefined);
        assert_eq!(eval("anyCompare(\">\", {1, 5}, 4)"), Value::Boolean(true));
        assert_eq!(eval("allCompare(\">\", {1, 5}, 4)"), Value::Boolean(false));
    }

    #[test]
    fn string_functions() {
        assert_eq!(eval("strcat(\"a\", 1, true)"), Value::from("a1true"));
        assert_eq!(eval("strcat(\"a\", Missing)"), Value::Undefined);
        assert_eq!(eval("join(\", \", {\"a\", \"b\"})"), Value::from("a, b"));
        assert_eq!(eval("join(\"-\", 1, 2)"), Value::from("1-2"));
        assert_eq!(eval("toUpper(\"abc\")"), Value::from("ABC"));
        assert_eq!(eval("substr(\"abcdef\", 2)"), Value::from("cdef"));
        assert_eq!(eval("substr(\"abcdef\", -2)"), Value::from("ef"));
        assert_eq!(eval("substr(\"abcdef\", 1, -2)"), Value::from("bcd"));
        assert_eq!(eval("strcmp(\"a\", \"B\")"), Value::Integer(1));
        assert_eq!(eval("stricmp(\"a\", \"A\")"), Value::Integer(0));
    }

    #[test]
    fn substr_with_extreme_bounds() {
        let max = "9223372036854775807";
        let min = "(-9223372036854775807 - 1)";
        assert_eq!(eval(&format!("substr(\"abc\", 1, {max})")), Value::from("bc"));
        assert_eq!(eval(&format!("substr(\"abc\", {max}, {max})")), Value::from(""));
        assert_eq!(eval(&format!("substr(\"abc\", {min})")), Value::from("abc"));
        assert_eq!(eval(&format!("substr(\"abc\", {min}, {max})")), Value::from("abc"));
        assert_eq!(eval(&format!("substr(\"abc\", 1, {min})")), Value::from(""));
        assert_eq!(eval(&format!("substr(\"abc\", {min}, {min})")), Value::from(""));
    }

    #[test]
    fn regex_and_string_lists() {
        assert_eq!(eval("regexp(\"^node[0-9]+$\", \"node12\")"), Value::Boolean(true));
        assert_eq!(eval("regexp(\"^NODE\", \"node12\", \"i\")"), Value::Boolean(true));
        assert!(eval("regexp(\"(\", \"x\")").is_error());
        assert_eq!(eval("regexpMember(\"^b\", {\"a\", \"bc\"})"), Value::Boolean(true));
        assert_eq!(eval("stringListMember(\"b\", \"a, b,c\")"), Value::Boolean(true));
        assert_eq!(eval("stringListMember(\"B\", \"a,b\")"), Value::Boolean(false));
        assert_eq!(eval("stringListIMember(\"B\", \"a,b\")"), Value::Boolean(true));
        assert_eq!(eval("stringListSize(\"a, b ,c\")"), Value::Integer(3));
        assert_eq!(eval("stringListsIntersect(\"a,b\", \"c,b\")"), Value::Boolean(true));
    }

    #[test]
    fn conversions_and_math() {
        assert_eq!(eval("int(3.9)"), Value::Integer(3));
        assert_eq!(eval("int(\"42\")"), Value::Integer(42));
        assert_eq!(eval("real(\"2.5\")"), Value::Real(2.5));
        assert_eq!(eval("string(12)"), Value::from("12"));
        assert_eq!(eval("bool(\"TRUE\")"), Value::Boolean(true));
        assert_eq!(eval("floor(2.7)"), Value::Integer(2));
        assert_eq!(eval("ceiling(2.1)"), Value::Integer(3));
        assert_eq!(eval("round(2.5)"), Value::Integer(3));
        assert_eq!(eval("pow(2, 10)"), Value::Integer(1024));
        assert_eq!(eval("pow(2, -1)"), Value::Real(0.5));
        assert!(matches!(eval("time()"), Value::Integer(t) if t > 1_600_000_000));
    }

    #[test]
    fn if_then_else_is_lazy() {
        assert_eq!(eval("ifThenElse(true, 1, 1/0)"), Value::Integer(1));
        assert_eq!(eval("ifThenElse(Missing, 1, 2)"), Value::Undefined);
        assert!(eval("ifThenElse(true, 1)").is_error());
    }

    #[test]
    fn unknown_functions_are_errors() {
        assert!(eval("noSuchFunction(1)").is_error());
        assert!(eval("size(1, 2)").is_error());
    }
}
