//! simple_bank - transactional transfer core
//!
//! Moves funds between two accounts as one atomic unit: a transfer record,
//! a debit and a credit entry, and two balance deltas. Safe under concurrent
//! transfers over the same accounts in either direction.
//!
//! # Modules
//!
//! - [`store`] - models, query executors, transaction scope, transfers
//! - [`db`] - PostgreSQL pool
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup
//! - [`random`] - seeded test data

pub mod config;
pub mod db;
pub mod logging;
pub mod random;
pub mod store;

// Convenient re-exports at crate root
pub use db::Database;
pub use store::{
    Account, Backend, Entry, MemoryBackend, MemoryStore, OverdraftPolicy, PgBackend, PgStore,
    Queries, Store, StoreError, StoreResult, Transfer, TransferTxParams, TransferTxResult,
    TxQueries,
};
