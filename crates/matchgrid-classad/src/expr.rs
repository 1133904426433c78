//! Expression trees.
//!
//! An [`Expr`] is built once by the parser and evaluated repeatedly. Its
//! `Display` output is the wire syntax: parentheses are emitted only where
//! operator precedence requires them, so `parse(e.to_string()) == e`.

use std::fmt;

use crate::record::{Record, write_attr_name};
use crate::value::Value;

/// Where an attribute reference is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Bare `Name`: this record, enclosing records, then the counterpart.
    Unscoped,
    /// `MY.Name` / `self.Name`.
    My,
    /// `TARGET.Name` / `other.Name`.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Is,
    Isnt,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    UShr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Is => "=?=",
            BinaryOp::Isnt => "=!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::UShr => ">>>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    /// Binding strength; larger binds tighter. Ternary is 1.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 2,
            BinaryOp::And => 3,
            BinaryOp::BitOr => 4,
            BinaryOp::BitXor => 5,
            BinaryOp::BitAnd => 6,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Is | BinaryOp::Isnt => 7,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 8,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => 9,
            BinaryOp::Add | BinaryOp::Sub => 10,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 11,
        }
    }
}

const PREC_TERNARY: u8 = 1;
const PREC_UNARY: u8 = 12;
const PREC_POSTFIX: u8 = 13;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A scalar constant. Lists and records are never stored here; see
    /// [`Expr::from_value`].
    Literal(Value),
    Attr { scope: Scope, name: String },
    /// `base.name` on a nested record.
    Select(Box<Expr>, String),
    /// `base[index]` on a list or record.
    Subscript(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Record(Record),
}

impl Expr {
    pub fn attr(name: impl Into<String>) -> Self {
        Expr::Attr {
            scope: Scope::Unscoped,
            name: name.into(),
        }
    }

    pub fn target(name: impl Into<String>) -> Self {
        Expr::Attr {
            scope: Scope::Target,
            name: name.into(),
        }
    }

    pub fn my(name: impl Into<String>) -> Self {
        Expr::Attr {
            scope: Scope::My,
            name: name.into(),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Build the canonical expression for a value, turning lists and
    /// records into their constructor forms so that the result prints and
    /// re-parses to an equal tree.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::List(items) => Expr::List(items.into_iter().map(Expr::from_value).collect()),
            Value::Record(r) => Expr::Record((*r).clone()),
            scalar => Expr::Literal(scalar),
        }
    }

    /// Names of attributes this expression references, with their scope.
    pub fn references(&self) -> Vec<(Scope, String)> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<(Scope, String)>) {
        match self {
            Expr::Literal(_) | Expr::Record(_) => {}
            Expr::Attr { scope, name } => {
                if !out
                    .iter()
                    .any(|(s, n)| s == scope && n.eq_ignore_ascii_case(name))
                {
                    out.push((*scope, name.clone()));
                }
            }
            Expr::Select(base, _) => base.collect_refs(out),
            Expr::Subscript(base, index) => {
                base.collect_refs(out);
                index.collect_refs(out);
            }
            Expr::Unary(_, e) => e.collect_refs(out),
            Expr::Binary(_, l, r) => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            Expr::Ternary(c, t, f) => {
                c.collect_refs(out);
                t.collect_refs(out);
                f.collect_refs(out);
            }
            Expr::Call(_, args) | Expr::List(args) => {
                for a in args {
                    a.collect_refs(out);
                }
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Ternary(..) => PREC_TERNARY,
            Expr::Binary(op, ..) => op.precedence(),
            Expr::Unary(..) => PREC_UNARY,
            Expr::Literal(Value::Integer(i)) if *i < 0 => PREC_UNARY,
            Expr::Literal(Value::Real(r)) if r.is_sign_negative() && r.is_finite() => PREC_UNARY,
            _ => PREC_POSTFIX,
        }
    }

    fn write_child(&self, f: &mut fmt::Formatter<'_>, min_prec: u8) -> fmt::Result {
        if self.precedence() < min_prec {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::from_value(value)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Attr { scope, name } => {
                match scope {
                    Scope::Unscoped => {}
                    Scope::My => f.write_str("MY.")?,
                    Scope::Target => f.write_str("TARGET.")?,
                }
                write_attr_name(f, name)
            }
            Expr::Select(base, name) => {
                base.write_child(f, PREC_POSTFIX)?;
                f.write_str(".")?;
                write_attr_name(f, name)
            }
            Expr::Subscript(base, index) => {
                base.write_child(f, PREC_POSTFIX)?;
                write!(f, "[{index}]")
            }
            Expr::Unary(op, operand) => {
                f.write_str(op.symbol())?;
                // Keep `- -x` from printing as the `--x` token pair.
                if matches!(op, UnaryOp::Neg | UnaryOp::Plus)
                    && operand.precedence() == PREC_UNARY
                {
                    return write!(f, "({operand})");
                }
                operand.write_child(f, PREC_UNARY)
            }
            Expr::Binary(op, lhs, rhs) => {
                let prec = op.precedence();
                lhs.write_child(f, prec)?;
                write!(f, " {} ", op.symbol())?;
                rhs.write_child(f, prec + 1)
            }
            Expr::Ternary(cond, then, otherwise) => {
                cond.write_child(f, PREC_TERNARY + 1)?;
                write!(f, " ? {then} : ")?;
                otherwise.write_child(f, PREC_TERNARY)
            }
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
            Expr::Record(r) => write!(f, "{r}"),
        }
    }
}
