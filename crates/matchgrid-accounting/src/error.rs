//! Accounting error types.

use thiserror::Error;

/// Errors that can occur while loading or saving accounting state.
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("state store error: {0}")]
    State(#[from] matchgrid_state::StateError),

    #[error("invalid concurrency limit {0:?}")]
    InvalidLimit(String),
}

pub type AccountingResult<T> = Result<T, AccountingError>;
