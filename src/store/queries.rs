//! Query executor seam
//!
//! [`Queries`] is the row-level surface every backend exposes. A backend
//! provides it twice: once bound to the ambient connection, once bound to an
//! open transaction ([`TxQueries`]). Callers pick one at invocation time.

use async_trait::async_trait;

use super::error::StoreResult;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, UpdateAccountBalanceParams,
};

/// Single-statement reads and writes against the ledger tables.
///
/// Point lookups fail with [`StoreError::NotFound`](super::StoreError::NotFound)
/// when the row is absent.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account>;

    async fn get_account(&mut self, id: i64) -> StoreResult<Account>;

    /// Accounts ordered by id
    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>>;

    async fn update_account_balance(
        &mut self,
        params: UpdateAccountBalanceParams,
    ) -> StoreResult<Account>;

    /// Add a signed delta to the stored balance and return the updated row.
    ///
    /// Takes the row write lock for the rest of the enclosing transaction.
    async fn add_account_balance(&mut self, params: AddAccountBalanceParams)
    -> StoreResult<Account>;

    async fn delete_account(&mut self, id: i64) -> StoreResult<()>;

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer>;

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry>;

    async fn get_entry(&mut self, id: i64) -> StoreResult<Entry>;

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>>;
}

/// A [`Queries`] bound to an in-flight transaction
#[async_trait]
pub trait TxQueries: Queries + Sized {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// A transaction-capable store
#[async_trait]
pub trait Backend: Send + Sync {
    type Ambient: Queries;
    type Tx: TxQueries;

    /// Executor bound to the ambient connection
    fn queries(&self) -> Self::Ambient;

    /// Open a transaction. Fails with `StoreError::Unavailable`.
    async fn begin(&self) -> StoreResult<Self::Tx>;
}
