use crate::store::StoreError;

/// Failure kinds surfaced by the ledger. Each carries a readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or missing input. Never retried.
    InvalidArgument(String),
    /// Unknown building. Never retried.
    NotFound(String),
    /// Conditional commit kept losing after the retry budget.
    Conflict(String),
    /// Persistence failed. Not retried by the ledger.
    Unavailable(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            LedgerError::NotFound(id) => write!(f, "building not found: {id}"),
            LedgerError::Conflict(msg) => write!(f, "conflict: {msg}"),
            LedgerError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LedgerError::NotFound(id),
            StoreError::Conflict(msg) => LedgerError::Conflict(msg),
            StoreError::Unavailable(msg) => LedgerError::Unavailable(msg),
            StoreError::LimitExceeded(msg) => LedgerError::InvalidArgument(msg.to_string()),
        }
    }
}
