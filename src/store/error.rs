//! Ledger store error types

use thiserror::Error;

/// Errors surfaced by the query executors, the transaction scope and the
/// transfer orchestrator.
///
/// Nothing is retried internally. A caller that sees any of these after
/// `transfer_tx` must assume the transfer was not applied.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The transaction could not be opened; no statement was attempted
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A statement inside or outside a transaction failed
    #[error("Database error: {0}")]
    Database(String),

    /// Every write succeeded but the commit did not
    #[error("Commit failed: {0}")]
    Commit(String),

    /// The unit of work failed and so did the rollback that followed it
    #[error("tx err: {tx}, rb err: {rollback}")]
    Rollback {
        tx: Box<StoreError>,
        rollback: Box<StoreError>,
    },

    #[error("Insufficient funds in account {account_id}: balance would be {balance}")]
    InsufficientFunds { account_id: i64, balance: i64 },

    #[error("Deadlock detected waiting for account {account_id}")]
    Deadlock { account_id: i64 },

    /// Fault injected by the in-memory backend
    #[error("Injected fault: {0}")]
    Injected(&'static str),

    /// Failure raised by a caller-supplied unit of work
    #[error("Aborted: {0}")]
    Aborted(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "STORE_UNAVAILABLE",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Commit(_) => "COMMIT_FAILED",
            StoreError::Rollback { .. } => "ROLLBACK_FAILED",
            StoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            StoreError::Deadlock { .. } => "DEADLOCK",
            StoreError::Injected(_) => "INJECTED_FAULT",
            StoreError::Aborted(_) => "ABORTED",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// The unit-of-work error, looking through a failed rollback
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Rollback { tx, .. } => tx.root(),
            other => other,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        StoreError::NotFound { entity, id }
    }

    /// Map a point lookup failure, keeping `RowNotFound` distinguishable
    pub(crate) fn from_lookup(entity: &'static str, id: i64, e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::not_found(entity, id),
            other => StoreError::from(other),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
