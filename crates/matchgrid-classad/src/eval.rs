//! Expression evaluation.
//!
//! Evaluation is a pure function of `(expr, self, other)`. It never fails:
//! problems surface as [`Value::Error`], missing data as
//! [`Value::Undefined`].
//!
//! # Scoping
//!
//! - A bare name resolves against the record being evaluated, then its
//!   enclosing records, then the counterpart.
//! - `MY.name` resolves only against the top-level self record.
//! - `TARGET.name` resolves against the counterpart. While that
//!   attribute's expression is evaluated, the roles of the two records are
//!   swapped, so its own bare names and `TARGET.` refer back correctly.
//!
//! Attribute resolution keeps a stack of the `(record, attribute)` pairs
//! being evaluated. Re-entering one of them means the definition is
//! circular and yields Undefined. The stack is bounded by
//! [`MAX_EVAL_DEPTH`]; going beyond it yields Error, as does nesting more
//! than [`MAX_EVAL_NESTING`] expression nodes in total.

use std::sync::Arc;

use tracing::debug;

use crate::expr::{BinaryOp, Expr, Scope};
use crate::functions;
use crate::ops;
use crate::record::Record;
use crate::value::Value;

/// Maximum chain of nested attribute resolutions.
pub const MAX_EVAL_DEPTH: usize = 100;

/// Maximum expression nodes under evaluation at once, summed across
/// attribute resolutions.
pub const MAX_EVAL_NESTING: usize = 512;

/// Evaluate `expr` with `this` as the self record and `other` as the
/// counterpart.
pub fn evaluate(expr: &Expr, this: &Record, other: Option<&Record>) -> Value {
    Evaluator::new(this, other).eval(expr)
}

/// Evaluate the attribute `name` of `this`. Missing attributes are
/// Undefined.
pub fn evaluate_attr(name: &str, this: &Record, other: Option<&Record>) -> Value {
    let mut ev = Evaluator::new(this, other);
    let root = ev.my.clone();
    ev.resolve_in(root, name, 0)
}

/// A record visible to the evaluator: borrowed from the caller, or a
/// nested record value produced during evaluation.
#[derive(Clone)]
enum Frame<'a> {
    Borrowed(&'a Record),
    Shared(Arc<Record>),
}

impl Frame<'_> {
    fn record(&self) -> &Record {
        match self {
            Frame::Borrowed(r) => r,
            Frame::Shared(r) => r,
        }
    }

    fn key(&self) -> usize {
        self.record() as *const Record as usize
    }
}

pub(crate) struct Evaluator<'a> {
    my: Frame<'a>,
    target: Option<Frame<'a>>,
    /// Enclosing records, outermost first. `scopes[0]` is `my`.
    scopes: Vec<Frame<'a>>,
    visiting: Vec<(usize, String)>,
    nesting: usize,
}

impl<'a> Evaluator<'a> {
    fn new(this: &'a Record, other: Option<&'a Record>) -> Self {
        let my = Frame::Borrowed(this);
        Self {
            scopes: vec![my.clone()],
            my,
            target: other.map(Frame::Borrowed),
            visiting: Vec::new(),
            nesting: 0,
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Value {
        if self.nesting >= MAX_EVAL_NESTING {
            debug!("expression evaluation too deep");
            return Value::error(format!("evaluation nested deeper than {MAX_EVAL_NESTING}"));
        }
        self.nesting += 1;
        let value = self.eval_node(expr);
        self.nesting -= 1;
        value
    }

    fn eval_node(&mut self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Attr { scope, name } => self.lookup(*scope, name),
            Expr::Select(base, name) => {
                let base = self.eval(base);
                self.select(base, name)
            }
            Expr::Subscript(base, index) => {
                let base = self.eval(base);
                let index = self.eval(index);
                self.subscript(base, index)
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand);
                ops::unary(*op, v)
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let l = self.eval(lhs);
                if matches!(l, Value::Boolean(false) | Value::Error(_)) {
                    return ops::and(&l, &Value::Undefined);
                }
                let r = self.eval(rhs);
                ops::and(&l, &r)
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let l = self.eval(lhs);
                if matches!(l, Value::Boolean(true) | Value::Error(_)) {
                    return ops::or(&l, &Value::Undefined);
                }
                let r = self.eval(rhs);
                ops::or(&l, &r)
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs);
                let r = self.eval(rhs);
                ops::binary(*op, &l, &r)
            }
            Expr::Ternary(cond, then, otherwise) => match self.eval(cond) {
                Value::Boolean(true) => self.eval(then),
                Value::Boolean(false) => self.eval(otherwise),
                Value::Undefined => Value::Undefined,
                e @ Value::Error(_) => e,
                v => Value::error(format!("condition is {}, not boolean", v.kind())),
            },
            Expr::Call(name, args) => functions::call(self, name, args),
            Expr::List(items) => Value::List(items.iter().map(|e| self.eval(e)).collect()),
            Expr::Record(r) => Value::Record(Arc::new(r.clone())),
        }
    }

    fn lookup(&mut self, scope: Scope, name: &str) -> Value {
        match scope {
            Scope::My => {
                let my = self.my.clone();
                self.with_scopes(vec![my.clone()], |ev| ev.resolve_in(my, name, 0))
            }
            Scope::Target => match self.target.clone() {
                Some(target) => self.resolve_in_target(target, name),
                None => Value::Undefined,
            },
            Scope::Unscoped => {
                for depth in (0..self.scopes.len()).rev() {
                    let frame = self.scopes[depth].clone();
                    if frame.record().contains(name) {
                        return self.resolve_in(frame, name, depth);
                    }
                }
                match self.target.clone() {
                    Some(target) if target.record().contains(name) => {
                        self.resolve_in_target(target, name)
                    }
                    _ => Value::Undefined,
                }
            }
        }
    }

    /// Evaluate `frame.name` with `scopes[..=depth]` as the enclosing
    /// chain. `frame` must be `scopes[depth]` (or `my` when depth is 0).
    fn resolve_in(&mut self, frame: Frame<'a>, name: &str, depth: usize) -> Value {
        let Some(expr) = frame.record().get(name) else {
            return Value::Undefined;
        };
        let key = (frame.key(), name.to_ascii_lowercase());
        if self.visiting.contains(&key) {
            return Value::Undefined;
        }
        if self.visiting.len() >= MAX_EVAL_DEPTH {
            debug!(attr = name, "attribute resolution too deep");
            return Value::error(format!("evaluation deeper than {MAX_EVAL_DEPTH} attributes"));
        }
        self.visiting.push(key);
        let inner = self.scopes.split_off((depth + 1).min(self.scopes.len()));
        let value = self.eval(expr);
        self.scopes.extend(inner);
        self.visiting.pop();
        value
    }

    /// Evaluate an attribute of the counterpart with the roles swapped.
    fn resolve_in_target(&mut self, target: Frame<'a>, name: &str) -> Value {
        let my = std::mem::replace(&mut self.my, target.clone());
        let saved_target = self.target.replace(my);
        let value = self.with_scopes(vec![target.clone()], |ev| ev.resolve_in(target, name, 0));
        if let Some(my) = std::mem::replace(&mut self.target, saved_target) {
            self.my = my;
        }
        value
    }

    fn with_scopes<T>(&mut self, scopes: Vec<Frame<'a>>, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::replace(&mut self.scopes, scopes);
        let result = f(self);
        self.scopes = saved;
        result
    }

    fn select(&mut self, base: Value, name: &str) -> Value {
        match base {
            Value::Record(r) => self.resolve_nested(r, name),
            Value::Undefined => Value::Undefined,
            e @ Value::Error(_) => e,
            v => Value::error(format!("cannot select .{name} from {}", v.kind())),
        }
    }

    /// Evaluate an attribute of a nested record value, which sees the
    /// current chain as its enclosing scopes.
    fn resolve_nested(&mut self, record: Arc<Record>, name: &str) -> Value {
        let frame = Frame::Shared(record);
        self.scopes.push(frame.clone());
        let depth = self.scopes.len() - 1;
        let value = self.resolve_in(frame, name, depth);
        self.scopes.pop();
        value
    }

    fn subscript(&mut self, base: Value, index: Value) -> Value {
        match (base, index) {
            (e @ Value::Error(_), _) | (_, e @ Value::Error(_)) => e,
            (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
            (Value::List(items), Value::Integer(i)) => usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_else(|| Value::error(format!("list index {i} out of range"))),
            (Value::Record(r), Value::String(name)) => self.resolve_nested(r, &name),
            (b, i) => Value::error(format!("cannot index {} with {}", b.kind(), i.kind())),
        }
    }
}
