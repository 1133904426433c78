//! matchgrid-classad — the self-describing record model.
//!
//! Every entity the matchmaker deals with (jobs, machines, submitters) is a
//! [`Record`]: an ordered, case-insensitive mapping from attribute name to an
//! unevaluated [`Expr`]. Expressions are parsed once and evaluated many
//! times, each time against a possibly different counterpart record.
//!
//! # Components
//!
//! - **`value`** — evaluated values (`Undefined`, `Error`, scalars, times, lists, records)
//! - **`expr`** — expression trees and their textual (wire) form
//! - **`record`** — the attribute map, wire-format and long-form I/O
//! - **`parse`** — nom-based parser for expressions and records
//! - **`eval`** — three-valued evaluator with `self`/`other` scoping
//! - **`functions`** — built-in function library
//!
//! # Evaluation
//!
//! ```text
//! evaluate(expr, self, other)
//!   name        → self, enclosing records, then other
//!   MY.name     → self only
//!   TARGET.name → other only (scope flips while evaluating it)
//! ```
//!
//! Evaluation never fails: problems surface as [`Value::Error`], missing
//! data as [`Value::Undefined`]. Reference cycles resolve to `Undefined`,
//! and resolution chains deeper than [`MAX_EVAL_DEPTH`] yield `Error`.

pub mod error;
pub mod eval;
pub mod expr;
pub mod functions;
mod ops;
pub mod parse;
pub mod record;
pub mod value;

pub use error::{ClassAdError, ClassAdResult};
pub use eval::{MAX_EVAL_DEPTH, MAX_EVAL_NESTING, evaluate, evaluate_attr};
pub use expr::{BinaryOp, Expr, Scope, UnaryOp};
pub use parse::{MAX_EXPR_DEPTH, MAX_NESTING, parse_expr, parse_record};
pub use record::Record;
pub use value::{AbsTime, Value};
