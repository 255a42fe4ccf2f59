//! Ledger store
//!
//! Accounts, transfers and entries, and the transactional transfer that ties
//! them together.
//!
//! # Layers
//!
//! - [`Queries`] - single-statement row access, implemented per backend twice:
//!   ambient ([`PgQueries`], [`MemoryQueries`]) and transactional ([`PgTx`], [`MemoryTx`])
//! - [`Store::exec_tx`] - transaction scope: begin, run, commit or roll back
//! - [`Store::transfer_tx`] - the transfer itself
//!
//! # Invariants
//!
//! 1. All four writes of a transfer land together or not at all
//! 2. Balances change only through atomic deltas
//! 3. Balance rows are locked in ascending account id order
//! 4. No error is swallowed; nothing is retried

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod transfer;
pub mod tx;

pub use error::{StoreError, StoreResult};
pub use memory::{Fault, MemoryBackend, MemoryQueries, MemoryTx};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, TransferTxParams, TransferTxResult, UpdateAccountBalanceParams,
};
pub use postgres::{PgBackend, PgQueries, PgTx};
pub use queries::{Backend, Queries, TxQueries};
pub use transfer::{OverdraftPolicy, add_money};
pub use tx::Store;

pub type PgStore = Store<PgBackend>;
pub type MemoryStore = Store<MemoryBackend>;
