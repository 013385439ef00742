use crate::types::Amount;
use thiserror::Error;

/// Failures surfaced by the selection manager, settlement reconstruction and
/// the purchase orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed local input; never reaches the ledger.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("allowance of {available} is below the required {required}")]
    Allowance { required: Amount, available: Amount },

    #[error("transaction rejected: {0}")]
    TransactionRejected(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// Read-side transport failure. Never moves the orchestrator.
    #[error("ledger unavailable: {0}")]
    Ledger(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
