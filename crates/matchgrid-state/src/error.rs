//! Failures reading or writing persisted accounting state.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Each variant carries the backend's message.
#[derive(Debug, Error)]
pub enum StateError {
    /// The accounting file could not be opened or created, or is not a
    /// state file.
    #[error("cannot open accounting state: {0}")]
    Open(String),

    /// A load or save could not begin or commit.
    #[error("accounting state transaction failed: {0}")]
    Transaction(String),

    /// The submitter, match or meta table could not be opened or replaced.
    #[error("accounting state table unavailable: {0}")]
    Table(String),

    #[error("failed to read accounting state: {0}")]
    Read(String),

    #[error("failed to write accounting state: {0}")]
    Write(String),

    /// A submitter priority or match record could not be encoded.
    #[error("cannot encode accounting record: {0}")]
    Serialize(String),

    /// A stored record is not valid JSON for its table, e.g. a file
    /// written by an incompatible version.
    #[error("corrupt accounting record: {0}")]
    Deserialize(String),
}
