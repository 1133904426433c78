//! Error types for record parsing.

use thiserror::Error;

/// Result type alias for record operations.
pub type ClassAdResult<T> = Result<T, ClassAdError>;

/// Errors produced while turning text into records or expressions.
///
/// Evaluation problems are not errors: they are [`crate::Value::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassAdError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unexpected trailing input at offset {offset}: {rest:?}")]
    Trailing { offset: usize, rest: String },

    #[error("expression nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("line {line}: {message}")]
    Line { line: usize, message: String },
}
