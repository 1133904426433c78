//! Parser for expressions and records.
//!
//! Precedence climbing over nom combinators. Constant calls to
//! `absTime`, `relTime` and `real("NaN"|"INF"|"-INF")` are folded into
//! literals, as is unary minus on a numeric literal, so printed values
//! read back to identical trees.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{char, digit0, digit1, hex_digit1, one_of, satisfy},
    combinator::{cut, map_res, opt, recognize},
    error::{Error, ErrorKind},
    multi::separated_list0,
    sequence::{pair, preceded, terminated},
};

use crate::error::{ClassAdError, ClassAdResult};
use crate::expr::{BinaryOp, Expr, Scope, UnaryOp};
use crate::record::Record;
use crate::value::{AbsTime, Value, parse_reltime};

/// Sub-expression nesting (brackets, call arguments, conditional arms)
/// accepted before parsing is refused.
pub const MAX_NESTING: usize = 64;

/// Height of the tallest expression tree the parser will build. Keeps
/// evaluation, printing and dropping of parsed trees within stack limits.
pub const MAX_EXPR_DEPTH: usize = 256;

// Error kinds the grammar raises when a limit is hit.
const NESTING_EXCEEDED: ErrorKind = ErrorKind::TooLarge;
const TREE_EXCEEDED: ErrorKind = ErrorKind::Count;

const KEYWORDS: &[&str] = &[
    "true", "false", "undefined", "error", "is", "isnt", "my", "self", "target", "other",
];

/// Parse a single expression.
pub fn parse_expr(text: &str) -> ClassAdResult<Expr> {
    finish(text, terminated(|i| expr(i, 0), ws).parse(text)).map(|(e, _)| e)
}

/// Parse a bracketed record: `[ a = 1; b = a + 1 ]`.
pub fn parse_record(text: &str) -> ClassAdResult<Record> {
    finish(text, terminated(|i| record_literal(i, 0), ws).parse(text)).map(|(r, _)| r)
}

/// Parse one `Name = expr` assignment (a long-form line).
pub fn parse_assignment(text: &str) -> ClassAdResult<(String, Expr)> {
    finish(text, terminated(|i| assignment(i, 0), ws).parse(text)).map(|(name, (e, _))| (name, e))
}

/// True when `name` can be written without quotes.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(name))
}

fn finish<T>(text: &str, result: IResult<&str, T>) -> ClassAdResult<T> {
    match result {
        Ok(("", v)) => Ok(v),
        Ok((rest, _)) => Err(ClassAdError::Trailing {
            offset: text.len() - rest.len(),
            rest: rest.chars().take(32).collect(),
        }),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) if e.code == NESTING_EXCEEDED => {
            Err(ClassAdError::TooDeep(MAX_NESTING))
        }
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) if e.code == TREE_EXCEEDED => {
            Err(ClassAdError::TooDeep(MAX_EXPR_DEPTH))
        }
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(ClassAdError::Parse {
            offset: text.len() - e.input.len(),
            message: if e.input.is_empty() {
                "unexpected end of input".to_string()
            } else {
                format!("unexpected input {:?}", e.input.chars().take(24).collect::<String>())
            },
        }),
        Err(nom::Err::Incomplete(_)) => Err(ClassAdError::Parse {
            offset: text.len(),
            message: "incomplete input".to_string(),
        }),
    }
}

// ── Lexical helpers ────────────────────────────────────────────────

/// Skip whitespace, `//` line comments and `/* */` block comments.
fn ws(mut input: &str) -> IResult<&str, ()> {
    loop {
        let trimmed = input.trim_start();
        if let Some(rest) = trimmed.strip_prefix("//") {
            input = rest.find('\n').map_or("", |pos| &rest[pos..]);
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            match rest.find("*/") {
                Some(pos) => input = &rest[pos + 2..],
                None => return Err(nom::Err::Failure(Error::new(trimmed, ErrorKind::TakeUntil))),
            }
        } else {
            return Ok((trimmed, ()));
        }
    }
}

/// A fixed token preceded by optional whitespace.
fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input| {
        let (input, _) = ws(input)?;
        tag(s).parse(input)
    }
}

/// Promote a recoverable error to a failure, like `cut`.
fn cut_err(e: nom::Err<Error<&str>>) -> nom::Err<Error<&str>> {
    match e {
        nom::Err::Error(inner) => nom::Err::Failure(inner),
        other => other,
    }
}

fn fail<T>(input: &str) -> IResult<&str, T> {
    Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// Read a delimited literal with backslash escapes.
fn quoted(input: &str, delim: char) -> IResult<&str, String> {
    let Some(mut rest) = input.strip_prefix(delim) else {
        return fail(input);
    };
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(nom::Err::Failure(Error::new(input, ErrorKind::Char))),
            Some(c) if c == delim => return Ok((chars.as_str(), out)),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(c @ ('"' | '\'' | '\\')) => out.push(c),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err(nom::Err::Failure(Error::new(input, ErrorKind::Char))),
            },
            Some(c) => out.push(c),
        }
        rest = chars.as_str();
    }
}

fn string_literal(input: &str) -> IResult<&str, String> {
    quoted(input, '"')
}

/// An attribute name: plain identifier or `'quoted text'`.
fn attr_name(input: &str) -> IResult<&str, String> {
    let (input, _) = ws(input)?;
    if input.starts_with('\'') {
        return quoted(input, '\'');
    }
    let (rest, name) = identifier(input)?;
    Ok((rest, name.to_string()))
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize((one_of("eE"), opt(one_of("+-")), digit1)).parse(input)
}

fn hex_integer(input: &str) -> IResult<&str, Value> {
    map_res(preceded(tag_no_case("0x"), hex_digit1), |h: &str| {
        i64::from_str_radix(h, 16).map(Value::Integer)
    })
    .parse(input)
}

fn decimal(input: &str) -> IResult<&str, Value> {
    let (rest, text) = alt((
        recognize((digit1, opt((char('.'), digit0)), opt(exponent))),
        recognize((char('.'), digit1, opt(exponent))),
    ))
    .parse(input)?;
    let value = if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>().ok().map(Value::Real)
    } else {
        text.parse::<i64>().ok().map(Value::Integer)
    };
    match value {
        Some(v) => Ok((rest, v)),
        None => Err(nom::Err::Failure(Error::new(input, ErrorKind::Digit))),
    }
}

fn number(input: &str) -> IResult<&str, Value> {
    alt((hex_integer, decimal)).parse(input)
}

// ── Grammar ────────────────────────────────────────────────────────

/// A parsed expression and the height of its tree.
type Node = (Expr, usize);

fn limit_exceeded<T>(input: &str, kind: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Failure(Error::new(input, kind)))
}

/// Height of a node whose tallest child is `child`.
fn height(input: &str, child: usize) -> Result<usize, nom::Err<Error<&str>>> {
    if child >= MAX_EXPR_DEPTH {
        return Err(nom::Err::Failure(Error::new(input, TREE_EXCEEDED)));
    }
    Ok(child + 1)
}

/// `level` counts the enclosing sub-expressions (brackets, arguments,
/// conditional arms) that the parser has descended into.
fn expr(input: &str, level: usize) -> IResult<&str, Node> {
    if level > MAX_NESTING {
        return limit_exceeded(input, NESTING_EXCEEDED);
    }
    let (input, (cond, cond_h)) = binary_level(input, 2, level)?;
    match sym("?")(input) {
        Ok((rest, _)) => {
            let (rest, (then, then_h)) = cut(|i| expr(i, level + 1)).parse(rest)?;
            let (rest, _) = cut(sym(":")).parse(rest)?;
            let (rest, (otherwise, else_h)) = cut(|i| expr(i, level + 1)).parse(rest)?;
            let h = height(rest, cond_h.max(then_h).max(else_h))?;
            Ok((
                rest,
                (
                    Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
                    h,
                ),
            ))
        }
        Err(_) => Ok((input, (cond, cond_h))),
    }
}

fn binary_level(input: &str, prec: u8, level: usize) -> IResult<&str, Node> {
    if prec > 11 {
        return unary(input, level);
    }
    let (mut input, (mut lhs, mut h)) = binary_level(input, prec + 1, level)?;
    while let Some((rest, op)) = binary_op(input, prec) {
        let (rest, (rhs, rhs_h)) = binary_level(rest, prec + 1, level).map_err(cut_err)?;
        h = height(rest, h.max(rhs_h))?;
        lhs = Expr::binary(op, lhs, rhs);
        input = rest;
    }
    Ok((input, (lhs, h)))
}

/// Match an operator of exactly the given precedence at the head of
/// `input`, refusing prefixes of longer operators from other levels.
fn binary_op(input: &str, prec: u8) -> Option<(&str, BinaryOp)> {
    let (input, _) = ws(input).ok()?;
    let symbols: &[(&str, BinaryOp, &str)] = match prec {
        2 => &[("||", BinaryOp::Or, "")],
        3 => &[("&&", BinaryOp::And, "")],
        4 => &[("|", BinaryOp::BitOr, "|")],
        5 => &[("^", BinaryOp::BitXor, "")],
        6 => &[("&", BinaryOp::BitAnd, "&")],
        7 => &[
            ("=?=", BinaryOp::Is, ""),
            ("=!=", BinaryOp::Isnt, ""),
            ("==", BinaryOp::Eq, ""),
            ("!=", BinaryOp::Ne, ""),
        ],
        8 => &[
            ("<=", BinaryOp::Le, ""),
            (">=", BinaryOp::Ge, ""),
            ("<", BinaryOp::Lt, "<"),
            (">", BinaryOp::Gt, ">"),
        ],
        9 => &[
            (">>>", BinaryOp::UShr, ""),
            (">>", BinaryOp::Shr, ""),
            ("<<", BinaryOp::Shl, ""),
        ],
        10 => &[("+", BinaryOp::Add, ""), ("-", BinaryOp::Sub, "")],
        11 => &[
            ("*", BinaryOp::Mul, ""),
            ("/", BinaryOp::Div, ""),
            ("%", BinaryOp::Mod, ""),
        ],
        _ => &[],
    };
    for (text, op, not_followed_by) in symbols {
        if let Some(rest) = input.strip_prefix(text) {
            let next = rest.chars().next();
            if next.is_some_and(|c| not_followed_by.contains(c)) {
                continue;
            }
            return Some((rest, *op));
        }
    }
    if prec == 7 {
        if let Ok((rest, word)) = identifier(input) {
            if word.eq_ignore_ascii_case("isnt") {
                return Some((rest, BinaryOp::Isnt));
            }
            if word.eq_ignore_ascii_case("is") {
                return Some((rest, BinaryOp::Is));
            }
        }
    }
    None
}

fn unary(input: &str, level: usize) -> IResult<&str, Node> {
    let mut ops = Vec::new();
    let mut input = input;
    loop {
        let (rest, _) = ws(input)?;
        let op = match rest.chars().next() {
            Some('-') => UnaryOp::Neg,
            Some('+') => UnaryOp::Plus,
            Some('!') => UnaryOp::Not,
            Some('~') => UnaryOp::BitNot,
            _ => break,
        };
        ops.push(op);
        input = &rest[1..];
    }
    let (rest, (mut e, mut h)) = match min_integer(input) {
        Some(rest) if ops.last() == Some(&UnaryOp::Neg) => {
            ops.pop();
            (rest, (Expr::Literal(Value::Integer(i64::MIN)), 1))
        }
        _ if ops.is_empty() => postfix(input, level)?,
        _ => cut(|i| postfix(i, level)).parse(input)?,
    };
    for op in ops.into_iter().rev() {
        e = fold_unary(op, e);
        if !matches!(e, Expr::Literal(_)) {
            h = height(rest, h)?;
        }
    }
    Ok((rest, (e, h)))
}

/// The magnitude of `i64::MIN`, which only exists as a literal under a
/// unary minus.
fn min_integer(input: &str) -> Option<&str> {
    let (input, _) = ws(input).ok()?;
    let rest = input.strip_prefix("9223372036854775808")?;
    if rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return None;
    }
    Some(rest)
}

fn fold_unary(op: UnaryOp, operand: Expr) -> Expr {
    match (op, operand) {
        (UnaryOp::Neg, Expr::Literal(Value::Real(r))) => Expr::Literal(Value::Real(-r)),
        (UnaryOp::Neg, Expr::Literal(Value::Integer(i))) => match i.checked_neg() {
            Some(n) => Expr::Literal(Value::Integer(n)),
            None => Expr::Unary(op, Box::new(Expr::Literal(Value::Integer(i)))),
        },
        (op, operand) => Expr::Unary(op, Box::new(operand)),
    }
}

fn postfix(input: &str, level: usize) -> IResult<&str, Node> {
    let (mut input, (mut e, mut h)) = primary(input, level)?;
    loop {
        if let Ok((rest, _)) = sym(".")(input) {
            if let Ok((rest, name)) = attr_name(rest) {
                h = height(rest, h)?;
                e = Expr::Select(Box::new(e), name);
                input = rest;
                continue;
            }
            break;
        }
        if let Ok((rest, _)) = sym("[")(input) {
            let (rest, (index, index_h)) = cut(|i| expr(i, level + 1)).parse(rest)?;
            let (rest, _) = cut(sym("]")).parse(rest)?;
            h = height(rest, h.max(index_h))?;
            e = Expr::Subscript(Box::new(e), Box::new(index));
            input = rest;
            continue;
        }
        break;
    }
    Ok((input, (e, h)))
}

/// Split parsed items into expressions and their tallest height.
fn unzip(nodes: Vec<Node>) -> (Vec<Expr>, usize) {
    let tallest = nodes.iter().map(|(_, h)| *h).max().unwrap_or(0);
    (nodes.into_iter().map(|(e, _)| e).collect(), tallest)
}

fn primary(input: &str, level: usize) -> IResult<&str, Node> {
    let (input, _) = ws(input)?;
    let Some(first) = input.chars().next() else {
        return fail(input);
    };
    match first {
        '(' => {
            let (rest, node) = cut(|i| expr(i, level + 1)).parse(&input[1..])?;
            let (rest, _) = cut(sym(")")).parse(rest)?;
            Ok((rest, node))
        }
        '{' => {
            let (rest, items) =
                separated_list0(sym(","), |i| expr(i, level + 1)).parse(&input[1..])?;
            let (rest, _) = opt(sym(",")).parse(rest)?;
            let (rest, _) = cut(sym("}")).parse(rest)?;
            let (items, tallest) = unzip(items);
            let h = height(rest, tallest)?;
            Ok((rest, (Expr::List(items), h)))
        }
        '[' => {
            let (rest, (record, tallest)) =
                cut(|i| record_body(i, level + 1)).parse(&input[1..])?;
            let h = height(rest, tallest)?;
            Ok((rest, (Expr::Record(record), h)))
        }
        '"' => {
            let (rest, s) = string_literal(input)?;
            Ok((rest, (Expr::Literal(Value::String(s)), 1)))
        }
        '\'' => {
            let (rest, name) = quoted(input, '\'')?;
            Ok((rest, (Expr::attr(name), 1)))
        }
        c if c.is_ascii_digit() || c == '.' => {
            let (rest, v) = number(input)?;
            Ok((rest, (Expr::Literal(v), 1)))
        }
        _ => ident_expr(input, level),
    }
}

fn ident_expr(input: &str, level: usize) -> IResult<&str, Node> {
    let (rest, name) = identifier(input)?;
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "true" => return Ok((rest, (Expr::Literal(Value::Boolean(true)), 1))),
        "false" => return Ok((rest, (Expr::Literal(Value::Boolean(false)), 1))),
        "undefined" => return Ok((rest, (Expr::Literal(Value::Undefined), 1))),
        "error" => return Ok((rest, (Expr::Literal(Value::error("error literal")), 1))),
        "my" | "self" | "target" | "other" => {
            if let Ok((after_dot, _)) = sym(".")(rest) {
                let (after, attr) = cut(attr_name).parse(after_dot)?;
                let scope = if matches!(lower.as_str(), "my" | "self") {
                    Scope::My
                } else {
                    Scope::Target
                };
                return Ok((after, (Expr::Attr { scope, name: attr }, 1)));
            }
        }
        _ => {}
    }
    if let Ok((after_paren, _)) = sym("(")(rest) {
        let (after, args) = cut(terminated(
            separated_list0(sym(","), |i| expr(i, level + 1)),
            sym(")"),
        ))
        .parse(after_paren)?;
        let (args, tallest) = unzip(args);
        return match fold_call(name, args) {
            e @ Expr::Literal(_) => Ok((after, (e, 1))),
            call => {
                let h = height(after, tallest)?;
                Ok((after, (call, h)))
            }
        };
    }
    Ok((rest, (Expr::attr(name), 1)))
}

/// Turn constant time and special-real constructors into literals.
fn fold_call(name: &str, args: Vec<Expr>) -> Expr {
    let folded = match (name.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("abstime", [Expr::Literal(Value::String(s))]) => AbsTime::parse(s).map(Value::AbsTime),
        ("abstime", [Expr::Literal(Value::Integer(secs))]) => {
            Some(Value::AbsTime(AbsTime::utc(*secs)))
        }
        ("reltime", [Expr::Literal(Value::String(s))]) => parse_reltime(s).map(Value::RelTime),
        ("reltime", [Expr::Literal(v)]) => v.as_f64().map(Value::RelTime),
        ("real", [Expr::Literal(Value::String(s))]) => match s.as_str() {
            "NaN" => Some(Value::Real(f64::NAN)),
            "INF" => Some(Value::Real(f64::INFINITY)),
            "-INF" => Some(Value::Real(f64::NEG_INFINITY)),
            _ => None,
        },
        _ => None,
    };
    match folded {
        Some(v) => Expr::Literal(v),
        None => Expr::Call(name.to_string(), args),
    }
}

fn assignment(input: &str, level: usize) -> IResult<&str, (String, Node)> {
    let (input, name) = attr_name(input)?;
    let (input, _) = ws(input)?;
    // `=` but not `==`, `=?=` or `=!=`.
    let Some(rest) = input.strip_prefix('=') else {
        return fail(input);
    };
    if rest.starts_with(['=', '?', '!']) {
        return fail(input);
    }
    let (rest, value) = cut(|i| expr(i, level)).parse(rest)?;
    Ok((rest, (name, value)))
}

fn record_literal(input: &str, level: usize) -> IResult<&str, (Record, usize)> {
    let (input, _) = sym("[")(input)?;
    cut(|i| record_body(i, level)).parse(input)
}

/// Everything after the opening `[` of a record, through the closing `]`.
/// Also returns the height of its tallest attribute expression.
fn record_body(mut input: &str, level: usize) -> IResult<&str, (Record, usize)> {
    if level > MAX_NESTING {
        return limit_exceeded(input, NESTING_EXCEEDED);
    }
    let mut record = Record::new();
    let mut tallest = 0;
    loop {
        if let Ok((rest, _)) = sym("]")(input) {
            return Ok((rest, (record, tallest)));
        }
        let (rest, (name, (value, h))) = assignment(input, level)?;
        record.insert(name, value);
        tallest = tallest.max(h);
        input = rest;
        match sym(";")(input) {
            Ok((rest, _)) => input = rest,
            Err(_) => {
                let (rest, _) = sym("]")(input)?;
                return Ok((rest, (record, tallest)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> Expr {
        parse_expr(text).unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(p("1 + 2 * 3").to_string(), "1 + 2 * 3");
        assert_eq!(p("(1 + 2) * 3").to_string(), "(1 + 2) * 3");
        assert_eq!(p("a || b && c").to_string(), "a || b && c");
        assert!(matches!(p("a || b && c"), Expr::Binary(BinaryOp::Or, ..)));
        assert!(matches!(p("a - b - c"), Expr::Binary(BinaryOp::Sub, ref l, _) if matches!(**l, Expr::Binary(BinaryOp::Sub, ..))));
    }

    #[test]
    fn operators_do_not_swallow_longer_ones() {
        assert!(matches!(p("a | b"), Expr::Binary(BinaryOp::BitOr, ..)));
        assert!(matches!(p("a || b"), Expr::Binary(BinaryOp::Or, ..)));
        assert!(matches!(p("a << 2"), Expr::Binary(BinaryOp::Shl, ..)));
        assert!(matches!(p("a < 2"), Expr::Binary(BinaryOp::Lt, ..)));
        assert!(matches!(p("a >>> 2"), Expr::Binary(BinaryOp::UShr, ..)));
        assert!(matches!(p("a =?= b"), Expr::Binary(BinaryOp::Is, ..)));
        assert!(matches!(p("a isnt b"), Expr::Binary(BinaryOp::Isnt, ..)));
        assert!(matches!(p("a IS undefined"), Expr::Binary(BinaryOp::Is, ..)));
    }

    #[test]
    fn scopes_and_keywords() {
        assert_eq!(p("other.Memory"), Expr::target("Memory"));
        assert_eq!(p("TARGET.Memory"), Expr::target("Memory"));
        assert_eq!(p("self.Rank"), Expr::my("Rank"));
        assert_eq!(p("TRUE"), Expr::Literal(Value::Boolean(true)));
        assert_eq!(p("Undefined"), Expr::Literal(Value::Undefined));
    }

    #[test]
    fn numbers() {
        assert_eq!(p("42"), Expr::Literal(Value::Integer(42)));
        assert_eq!(p("0x1F"), Expr::Literal(Value::Integer(31)));
        assert_eq!(p("-7"), Expr::Literal(Value::Integer(-7)));
        assert_eq!(p("2.5e3"), Expr::Literal(Value::Real(2500.0)));
        assert_eq!(p(".5"), Expr::Literal(Value::Real(0.5)));
        assert_eq!(p("1e100"), Expr::Literal(Value::Real(1e100)));
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            p(r#""a\"b\\c\n""#),
            Expr::Literal(Value::String("a\"b\\c\n".to_string()))
        );
        assert!(parse_expr("\"unterminated").is_err());
    }

    #[test]
    fn comments_are_whitespace() {
        assert_eq!(p("1 /* one */ + // plus\n 2").to_string(), "1 + 2");
        assert!(parse_expr("1 /* never closed").is_err());
    }

    #[test]
    fn constant_time_calls_fold() {
        assert_eq!(p("relTime(\"01:00:00\")"), Expr::Literal(Value::RelTime(3600.0)));
        assert!(matches!(p("absTime(\"2024-01-01T00:00:00+00:00\")"), Expr::Literal(Value::AbsTime(_))));
        assert!(matches!(p("absTime(x)"), Expr::Call(..)));
        assert!(matches!(p("real(\"NaN\")"), Expr::Literal(Value::Real(r)) if r.is_nan()));
    }

    #[test]
    fn postfix_select_and_subscript() {
        assert!(matches!(p("a.b.c"), Expr::Select(..)));
        assert!(matches!(p("{1, 2, 3}[1]"), Expr::Subscript(..)));
        assert_eq!(p("[x = 1].x").to_string(), "[ x = 1 ].x");
    }

    #[test]
    fn ternary_is_right_associative() {
        let e = p("a ? 1 : b ? 2 : 3");
        assert!(matches!(e, Expr::Ternary(_, _, ref f) if matches!(**f, Expr::Ternary(..))));
        assert_eq!(e.to_string(), "a ? 1 : b ? 2 : 3");
    }

    #[test]
    fn errors_carry_offsets() {
        match parse_expr("1 + ") {
            Err(ClassAdError::Parse { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(parse_expr("1 2"), Err(ClassAdError::Trailing { offset: 2, .. })));
        assert!(parse_expr("").is_err());
        assert!(parse_expr("f(1,").is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert_eq!(parse_expr(&deep), Err(ClassAdError::TooDeep(MAX_NESTING)));
        let ok = format!("{}1{}", "(".repeat(8), ")".repeat(8));
        assert_eq!(p(&ok), Expr::Literal(Value::Integer(1)));

        // Brackets inside strings do not count.
        let text = format!("\"{}\"", "(".repeat(MAX_NESTING * 2));
        assert!(parse_expr(&text).is_ok());

        let records = format!("{}{}", "[ a = ".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert_eq!(parse_expr(&records), Err(ClassAdError::TooDeep(MAX_NESTING)));
    }

    #[test]
    fn long_operator_chains_are_bounded() {
        let within = format!("{}1", "1 + ".repeat(MAX_EXPR_DEPTH - 1));
        let e = p(&within);
        assert_eq!(
            crate::eval::evaluate(&e, &Record::new(), None),
            Value::Integer(MAX_EXPR_DEPTH as i64)
        );

        for terms in [MAX_EXPR_DEPTH + 1, 2_000, 200_000] {
            let chain = format!("{}1", "1 + ".repeat(terms));
            assert_eq!(parse_expr(&chain), Err(ClassAdError::TooDeep(MAX_EXPR_DEPTH)));
        }
        let negations = format!("{}x", "-".repeat(100_000));
        assert_eq!(parse_expr(&negations), Err(ClassAdError::TooDeep(MAX_EXPR_DEPTH)));
        let selects = format!("a{}", ".b".repeat(100_000));
        assert_eq!(parse_expr(&selects), Err(ClassAdError::TooDeep(MAX_EXPR_DEPTH)));
    }

    #[test]
    fn conditional_chains_are_bounded() {
        let within = format!("{}3", "a ? 1 : ".repeat(MAX_NESTING));
        assert!(matches!(p(&within), Expr::Ternary(..)));

        let else_chain = format!("{}1", "a ? 1 : ".repeat(50_000));
        assert_eq!(parse_expr(&else_chain), Err(ClassAdError::TooDeep(MAX_NESTING)));
        let then_chain = format!("{}1{}", "a ? ".repeat(50_000), " : 2".repeat(50_000));
        assert_eq!(parse_expr(&then_chain), Err(ClassAdError::TooDeep(MAX_NESTING)));
        // A bad line in long form is an ordinary error.
        assert!(Record::parse_long(&format!("X = {else_chain}")).is_err());
    }

    #[test]
    fn most_negative_integer_reads_back() {
        assert_eq!(p("-9223372036854775808"), Expr::Literal(Value::Integer(i64::MIN)));
        assert_eq!(p("- 9223372036854775808 + 1"), Expr::binary(
            BinaryOp::Add,
            Expr::Literal(Value::Integer(i64::MIN)),
            Expr::Literal(Value::Integer(1)),
        ));
        let twice = p("--9223372036854775808");
        assert_eq!(twice.to_string(), "-(-9223372036854775808)");
        assert_eq!(p(&twice.to_string()), twice);
        assert!(parse_expr("9223372036854775808").is_err());
        assert_eq!(p("-9223372036854775808.0"), Expr::Literal(Value::Real(-9223372036854775808.0)));
    }

    #[test]
    fn records() {
        let r = parse_record("[ a = 1; b = a + 1; ]").unwrap();
        assert_eq!(r.len(), 2);
        assert!(parse_record("[ ]").unwrap().is_empty());
        assert!(parse_record("[ a == 1 ]").is_err());
        assert!(parse_record("[ a = 1").is_err());
    }
}
