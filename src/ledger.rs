use crate::{
    error::Error,
    types::{
        Address,
        Amount,
        Checkpoint,
        Grid,
        GridNumbers,
        PoolInfo,
        PurchaseOrder,
        QuarterRecord,
        TxHandle,
        TxStatus,
        WinnerRecord,
    },
};
use thiserror::Error;

pub mod http;
pub mod in_memory;

pub use http::HttpLedger;
pub use in_memory::InMemoryLedger;

/// Failures reported by the external ledger or the signer in front of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("insufficient allowance: required {required}, available {available}")]
    InsufficientAllowance { required: Amount, available: Amount },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Rejected(reason) => Error::TransactionRejected(reason),
            LedgerError::Reverted(reason) => Error::TransactionFailed(reason),
            LedgerError::InsufficientAllowance {
                required,
                available,
            } => Error::Allowance {
                required,
                available,
            },
            LedgerError::Transport(reason) => Error::Ledger(reason),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Read access to a single pool, bound to the account acting on it.
pub trait LedgerRead {
    fn account(&self) -> Address;

    fn pool_info(&self) -> impl Future<Output = LedgerResult<PoolInfo>> + Send;

    fn grid(&self) -> impl Future<Output = LedgerResult<Grid>> + Send;

    fn quarter_score(
        &self,
        checkpoint: Checkpoint,
    ) -> impl Future<Output = LedgerResult<QuarterRecord>> + Send;

    fn quarter_winner(
        &self,
        checkpoint: Checkpoint,
    ) -> impl Future<Output = LedgerResult<WinnerRecord>> + Send;

    /// Amount of `token` the bound account lets `spender` transfer.
    fn allowance(
        &self,
        token: &Address,
        spender: &Address,
    ) -> impl Future<Output = LedgerResult<Amount>> + Send;

    /// Row/column digits, once the pool has drawn them.
    fn grid_numbers(&self) -> impl Future<Output = LedgerResult<Option<GridNumbers>>> + Send;
}

pub trait LedgerWrite {
    fn purchase(
        &self,
        order: &PurchaseOrder,
    ) -> impl Future<Output = LedgerResult<TxHandle>> + Send;

    fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: Amount,
    ) -> impl Future<Output = LedgerResult<TxHandle>> + Send;
}

pub trait TxTracker {
    fn status(&self, handle: &TxHandle) -> impl Future<Output = LedgerResult<TxStatus>> + Send;
}

pub trait Ledger: LedgerRead + LedgerWrite + TxTracker {}

impl<T: LedgerRead + LedgerWrite + TxTracker> Ledger for T {}
