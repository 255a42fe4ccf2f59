//! Transaction scope
//!
//! [`Store::exec_tx`] opens a transaction, hands the bound executor to a unit
//! of work, then commits or rolls back. No retries happen here.

use futures::future::BoxFuture;
use tracing::{error, warn};

use super::error::{StoreError, StoreResult};
use super::queries::{Backend, TxQueries};
use super::transfer::OverdraftPolicy;

/// Entry point to the ledger: ambient queries, transactions and transfers
pub struct Store<B: Backend> {
    backend: B,
    pub(super) overdraft: OverdraftPolicy,
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            overdraft: OverdraftPolicy::default(),
        }
    }

    pub fn with_overdraft_policy(mut self, overdraft: OverdraftPolicy) -> Self {
        self.overdraft = overdraft;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn overdraft_policy(&self) -> OverdraftPolicy {
        self.overdraft
    }

    /// Executor bound to the ambient connection
    pub fn queries(&self) -> B::Ambient {
        self.backend.queries()
    }

    /// Run `unit` inside one transaction.
    ///
    /// - begin fails: the error is returned and `unit` never runs
    /// - `unit` succeeds: commit, and a commit failure becomes the result
    /// - `unit` fails: rollback; if that fails too, both errors are returned
    ///   as [`StoreError::Rollback`]
    ///
    /// Dropping the returned future drops the open transaction, which the
    /// backend rolls back.
    pub async fn exec_tx<T, F>(&self, unit: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut B::Tx) -> BoxFuture<'q, StoreResult<T>> + Send,
    {
        let mut tx = self.backend.begin().await?;

        match unit(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, code = err.code(), "Unit of work failed, rolling back");
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rb_err) => {
                        error!(error = %err, rollback_error = %rb_err, "Rollback failed");
                        Err(StoreError::Rollback {
                            tx: Box::new(err),
                            rollback: Box::new(rb_err),
                        })
                    }
                }
            }
        }
    }
}
