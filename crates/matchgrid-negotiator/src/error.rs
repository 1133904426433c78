//! Negotiator error types.

use thiserror::Error;

/// Errors that can occur while negotiating.
///
/// None of these stop a cycle: a protocol error abandons one submitter's
/// session, and everything else is reported to the caller between cycles.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("protocol error from submitter {submitter}: {message}")]
    Protocol { submitter: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(#[from] matchgrid_classad::ClassAdError),

    #[error("accounting error: {0}")]
    Accounting(#[from] matchgrid_accounting::AccountingError),

    #[error("record source error: {0}")]
    Source(String),

    #[error("lease not found: {0}")]
    UnknownLease(String),
}

impl NegotiationError {
    pub fn protocol(submitter: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            submitter: submitter.to_string(),
            message: message.into(),
        }
    }
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;
