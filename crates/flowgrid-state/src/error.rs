//! Errors raised by the execution store.

use thiserror::Error;

use crate::types::ExecutionId;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open execution store: {0}")]
    Open(String),

    /// redb rejected a transaction, table, or row access.
    #[error("store operation {op} failed: {reason}")]
    Storage { op: &'static str, reason: String },

    #[error("failed to encode {record}: {reason}")]
    Encode { record: &'static str, reason: String },

    /// A stored row no longer parses as its record type.
    #[error("corrupt {record} row: {reason}")]
    Corrupt { record: &'static str, reason: String },

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("{0} counter exhausted")]
    CounterExhausted(&'static str),
}

impl StateError {
    /// The storage layer failed, as opposed to bad data or a missing row.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Open(_) | Self::Storage { .. })
    }
}
