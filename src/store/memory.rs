//! In-memory backend
//!
//! Behaves like the Postgres tables closely enough to exercise the transfer
//! core without a server:
//!
//! - ids come from sequences that are not rolled back
//! - `add_account_balance` / `update_account_balance` / `delete_account` take a
//!   per-row write lock held until commit, rollback or drop
//! - a lock wait longer than `lock_timeout` fails with `StoreError::Deadlock`
//! - transactional writes are staged and only become visible on commit
//! - uncommitted entries and transfers pin their accounts: deleting a pinned
//!   account fails, and an account with an uncommitted delete cannot gain new
//!   references
//!
//! Faults can be armed per operation with [`MemoryBackend::inject`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::error::{StoreError, StoreResult};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, UpdateAccountBalanceParams,
};
use super::queries::{Backend, Queries, TxQueries};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations a fault can be armed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Begin,
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    Commit,
    Rollback,
}

impl Fault {
    fn name(self) -> &'static str {
        match self {
            Fault::Begin => "begin",
            Fault::CreateTransfer => "create_transfer",
            Fault::CreateEntry => "create_entry",
            Fault::AddAccountBalance => "add_account_balance",
            Fault::Commit => "commit",
            Fault::Rollback => "rollback",
        }
    }
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    transfers: BTreeMap<i64, Transfer>,
    entries: BTreeMap<i64, Entry>,
    account_seq: i64,
    transfer_seq: i64,
    entry_seq: i64,
}

impl Tables {
    fn next_account_id(&mut self) -> i64 {
        self.account_seq += 1;
        self.account_seq
    }

    fn next_transfer_id(&mut self) -> i64 {
        self.transfer_seq += 1;
        self.transfer_seq
    }

    fn next_entry_id(&mut self) -> i64 {
        self.entry_seq += 1;
        self.entry_seq
    }

    fn is_referenced(&self, account_id: i64) -> bool {
        self.entries.values().any(|e| e.account_id == account_id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == account_id || t.to_account_id == account_id)
    }
}

/// Foreign-key state of open transactions
#[derive(Default)]
struct Pending {
    /// Account id -> uncommitted entries and transfers pointing at it
    refs: HashMap<i64, usize>,
    /// Accounts with an uncommitted delete
    deletes: HashSet<i64>,
}

impl Pending {
    fn is_pinned(&self, account_id: i64) -> bool {
        self.refs.get(&account_id).is_some_and(|n| *n > 0)
    }
}

struct Shared {
    /// Locked before `tables` when both are needed
    pending: Mutex<Pending>,
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<i64, Arc<RowLock<()>>>>,
    /// Fault -> number of calls left before it fires
    faults: Mutex<HashMap<Fault, u32>>,
    lock_log: Mutex<Vec<i64>>,
    lock_timeout: Duration,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        guard(&self.tables)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        guard(&self.pending)
    }

    fn release(&self, refs: &[i64], deletes: &[i64]) {
        let mut pending = self.pending();
        for id in refs {
            if let Some(n) = pending.refs.get_mut(id) {
                *n -= 1;
                if *n == 0 {
                    pending.refs.remove(id);
                }
            }
        }
        for id in deletes {
            pending.deletes.remove(id);
        }
    }

    /// True if an armed fault fires on this call
    fn trip(&self, fault: Fault) -> bool {
        let mut faults = guard(&self.faults);
        match faults.get_mut(&fault) {
            Some(remaining) if *remaining <= 1 => {
                faults.remove(&fault);
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.trip(fault) {
            return Err(StoreError::Injected(fault.name()));
        }
        Ok(())
    }

    async fn lock_row(&self, account_id: i64) -> StoreResult<OwnedMutexGuard<()>> {
        let lock = Arc::clone(
            guard(&self.row_locks)
                .entry(account_id)
                .or_insert_with(|| Arc::new(RowLock::new(()))),
        );
        let held = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| StoreError::Deadlock { account_id })?;
        guard(&self.lock_log).push(account_id);
        Ok(held)
    }
}

/// Shared in-memory tables. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Row lock waits longer than `lock_timeout` are reported as deadlocks
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending::default()),
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                lock_log: Mutex::new(Vec::new()),
                lock_timeout,
            }),
        }
    }

    /// Fail the `nth` upcoming call of `fault` (1 = the next one)
    pub fn inject(&self, fault: Fault, nth: u32) {
        guard(&self.shared.faults).insert(fault, nth.max(1));
    }

    pub fn transfer_count(&self) -> usize {
        self.shared.tables().transfers.len()
    }

    pub fn entry_count(&self) -> usize {
        self.shared.tables().entries.len()
    }

    /// Account ids in the order their row locks were granted
    pub fn lock_log(&self) -> Vec<i64> {
        guard(&self.shared.lock_log).clone()
    }

    pub fn clear_lock_log(&self) {
        guard(&self.shared.lock_log).clear();
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Ambient = MemoryQueries;
    type Tx = MemoryTx;

    fn queries(&self) -> MemoryQueries {
        MemoryQueries {
            shared: Arc::clone(&self.shared),
        }
    }

    async fn begin(&self) -> StoreResult<MemoryTx> {
        if self.shared.trip(Fault::Begin) {
            return Err(StoreError::Unavailable(format!(
                "injected fault: {}",
                Fault::Begin.name()
            )));
        }
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            accounts: BTreeMap::new(),
            deleted: BTreeSet::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
            held: HashMap::new(),
            refs: Vec::new(),
            deleting: Vec::new(),
        })
    }
}

fn add_balance(account: &mut Account, amount: i64) -> StoreResult<()> {
    account.balance = account
        .balance
        .checked_add(amount)
        .ok_or_else(|| StoreError::Database("bigint out of range".into()))?;
    Ok(())
}

fn fk_violation(table: &str, account_id: i64) -> StoreError {
    StoreError::Database(format!(
        "insert or update on table \"{table}\" violates foreign key constraint: account {account_id} does not exist"
    ))
}

fn still_referenced(account_id: i64) -> StoreError {
    StoreError::Database(format!(
        "delete on table \"accounts\" violates foreign key constraint: account {account_id} is still referenced"
    ))
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

/// Ambient executor: each call commits immediately
pub struct MemoryQueries {
    shared: Arc<Shared>,
}

#[async_trait]
impl Queries for MemoryQueries {
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account> {
        let mut tables = self.shared.tables();
        let account = Account {
            id: tables.next_account_id(),
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: Utc::now(),
        };
        tables.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> StoreResult<Account> {
        self.shared
            .tables()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("account", id))
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>> {
        let tables = self.shared.tables();
        Ok(page(
            tables.accounts.values().cloned(),
            params.limit,
            params.offset,
        ))
    }

    async fn update_account_balance(
        &mut self,
        params: UpdateAccountBalanceParams,
    ) -> StoreResult<Account> {
        let _row = self.shared.lock_row(params.id).await?;
        let mut tables = self.shared.tables();
        let account = tables
            .accounts
            .get_mut(&params.id)
            .ok_or(StoreError::not_found("account", params.id))?;
        account.balance = params.balance;
        Ok(account.clone())
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        let _row = self.shared.lock_row(params.id).await?;
        let mut tables = self.shared.tables();
        let account = tables
            .accounts
            .get_mut(&params.id)
            .ok_or(StoreError::not_found("account", params.id))?;
        add_balance(account, params.amount)?;
        Ok(account.clone())
    }

    async fn delete_account(&mut self, id: i64) -> StoreResult<()> {
        let _row = self.shared.lock_row(id).await?;
        let pending = self.shared.pending();
        let mut tables = self.shared.tables();
        if pending.is_pinned(id) || tables.is_referenced(id) {
            return Err(still_referenced(id));
        }
        tables.accounts.remove(&id);
        Ok(())
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        let pending = self.shared.pending();
        let mut tables = self.shared.tables();
        for id in [params.from_account_id, params.to_account_id] {
            if pending.deletes.contains(&id) || !tables.accounts.contains_key(&id) {
                return Err(fk_violation("transfers", id));
            }
        }
        let transfer = Transfer {
            id: tables.next_transfer_id(),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        tables.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer> {
        self.shared
            .tables()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("transfer", id))
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let tables = self.shared.tables();
        let rows = tables.transfers.values().filter(|t| {
            t.from_account_id == params.from_account_id && t.to_account_id == params.to_account_id
        });
        Ok(page(rows.cloned(), params.limit, params.offset))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        let pending = self.shared.pending();
        let mut tables = self.shared.tables();
        if pending.deletes.contains(&params.account_id)
            || !tables.accounts.contains_key(&params.account_id)
        {
            return Err(fk_violation("entries", params.account_id));
        }
        let entry = Entry {
            id: tables.next_entry_id(),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        tables.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> StoreResult<Entry> {
        self.shared
            .tables()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("entry", id))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let tables = self.shared.tables();
        let rows = tables
            .entries
            .values()
            .filter(|e| e.account_id == params.account_id);
        Ok(page(rows.cloned(), params.limit, params.offset))
    }
}

/// Transactional executor. Writes are staged until [`TxQueries::commit`].
pub struct MemoryTx {
    shared: Arc<Shared>,
    /// Rows this transaction created or holds the write lock on
    accounts: BTreeMap<i64, Account>,
    deleted: BTreeSet<i64>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
    held: HashMap<i64, OwnedMutexGuard<()>>,
    /// Accounts pinned by staged entries and transfers, one item per reference
    refs: Vec<i64>,
    /// Accounts this transaction has marked for delete
    deleting: Vec<i64>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.shared.release(&self.refs, &self.deleting);
    }
}

impl MemoryTx {
    /// Visible row: own staged copy first, then committed
    fn visible_account(&self, id: i64) -> Option<Account> {
        if self.deleted.contains(&id) {
            return None;
        }
        self.accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().accounts.get(&id).cloned())
    }

    /// Pin `ids` for a staged insert into `table`
    fn pin_accounts(&mut self, table: &str, ids: &[i64]) -> StoreResult<()> {
        let mut pending = self.shared.pending();
        for &id in ids {
            if pending.deletes.contains(&id) || self.visible_account(id).is_none() {
                return Err(fk_violation(table, id));
            }
        }
        for &id in ids {
            *pending.refs.entry(id).or_insert(0) += 1;
            self.refs.push(id);
        }
        Ok(())
    }

    /// Take the row write lock once per transaction and stage the current row
    async fn lock_for_update(&mut self, id: i64) -> StoreResult<&mut Account> {
        if !self.held.contains_key(&id) {
            let row = self.shared.lock_row(id).await?;
            self.held.insert(id, row);
            if !self.accounts.contains_key(&id) && !self.deleted.contains(&id) {
                if let Some(current) = self.shared.tables().accounts.get(&id).cloned() {
                    self.accounts.insert(id, current);
                }
            }
        }
        self.accounts
            .get_mut(&id)
            .ok_or(StoreError::not_found("account", id))
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account> {
        let account = Account {
            id: self.shared.tables().next_account_id(),
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> StoreResult<Account> {
        self.visible_account(id)
            .ok_or(StoreError::not_found("account", id))
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>> {
        let mut merged = self.shared.tables().accounts.clone();
        merged.extend(self.accounts.iter().map(|(id, a)| (*id, a.clone())));
        for id in &self.deleted {
            merged.remove(id);
        }
        Ok(page(merged.into_values(), params.limit, params.offset))
    }

    async fn update_account_balance(
        &mut self,
        params: UpdateAccountBalanceParams,
    ) -> StoreResult<Account> {
        let account = self.lock_for_update(params.id).await?;
        account.balance = params.balance;
        Ok(account.clone())
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        self.shared.check(Fault::AddAccountBalance)?;
        let account = self.lock_for_update(params.id).await?;
        add_balance(account, params.amount)?;
        Ok(account.clone())
    }

    async fn delete_account(&mut self, id: i64) -> StoreResult<()> {
        let exists = match self.lock_for_update(id).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        if exists {
            let mut pending = self.shared.pending();
            if pending.is_pinned(id) || self.shared.tables().is_referenced(id) {
                return Err(still_referenced(id));
            }
            if pending.deletes.insert(id) {
                self.deleting.push(id);
            }
        }
        self.accounts.remove(&id);
        self.deleted.insert(id);
        Ok(())
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        self.shared.check(Fault::CreateTransfer)?;
        self.pin_accounts("transfers", &[params.from_account_id, params.to_account_id])?;
        let transfer = Transfer {
            id: self.shared.tables().next_transfer_id(),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer> {
        if let Some(t) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(t.clone());
        }
        self.shared
            .tables()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("transfer", id))
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let mut merged = self.shared.tables().transfers.clone();
        merged.extend(self.transfers.iter().map(|t| (t.id, t.clone())));
        let rows = merged.into_values().filter(|t| {
            t.from_account_id == params.from_account_id && t.to_account_id == params.to_account_id
        });
        Ok(page(rows, params.limit, params.offset))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        self.shared.check(Fault::CreateEntry)?;
        self.pin_accounts("entries", &[params.account_id])?;
        let entry = Entry {
            id: self.shared.tables().next_entry_id(),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> StoreResult<Entry> {
        if let Some(e) = self.entries.iter().find(|e| e.id == id) {
            return Ok(e.clone());
        }
        self.shared
            .tables()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("entry", id))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let mut merged = self.shared.tables().entries.clone();
        merged.extend(self.entries.iter().map(|e| (e.id, e.clone())));
        let rows = merged
            .into_values()
            .filter(|e| e.account_id == params.account_id);
        Ok(page(rows, params.limit, params.offset))
    }
}

#[async_trait]
impl TxQueries for MemoryTx {
    async fn commit(self) -> StoreResult<()> {
        if self.shared.trip(Fault::Commit) {
            return Err(StoreError::Commit(format!(
                "injected fault: {}",
                Fault::Commit.name()
            )));
        }
        {
            let mut tables = self.shared.tables();
            for id in &self.deleted {
                tables.accounts.remove(id);
            }
            for (id, account) in &self.accounts {
                tables.accounts.insert(*id, account.clone());
            }
            for t in &self.transfers {
                tables.transfers.insert(t.id, t.clone());
            }
            for e in &self.entries {
                tables.entries.insert(e.id, e.clone());
            }
        }
        // Row locks are released when `self.held` drops here
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.shared.check(Fault::Rollback)
    }
}
