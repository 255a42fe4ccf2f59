//! PostgreSQL query executors
//!
//! [`PgQueries`] runs each statement on the pool, [`PgTx`] runs it inside an
//! open transaction. Both go through the same SQL functions in [`sql`].

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::{StoreError, StoreResult};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, UpdateAccountBalanceParams,
};
use super::queries::{Backend, Queries, TxQueries};

/// SQLSTATE for `deadlock_detected`
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Backend over a shared connection pool
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Ambient = PgQueries;
    type Tx = PgTx;

    fn queries(&self) -> PgQueries {
        PgQueries {
            pool: self.pool.clone(),
        }
    }

    async fn begin(&self) -> StoreResult<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(PgTx { tx })
    }
}

/// Ambient executor: every call is its own implicit transaction
#[derive(Clone)]
pub struct PgQueries {
    pool: PgPool,
}

/// Executor bound to one open transaction.
///
/// Dropping it without `commit` rolls the transaction back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

macro_rules! forward_queries {
    ($ty:ty, $this:ident => $exec:expr) => {
        #[async_trait]
        impl Queries for $ty {
            async fn create_account(
                &mut self,
                params: &CreateAccountParams,
            ) -> StoreResult<Account> {
                let $this = self;
                sql::create_account($exec, params).await
            }

            async fn get_account(&mut self, id: i64) -> StoreResult<Account> {
                let $this = self;
                sql::get_account($exec, id).await
            }

            async fn list_accounts(
                &mut self,
                params: ListAccountsParams,
            ) -> StoreResult<Vec<Account>> {
                let $this = self;
                sql::list_accounts($exec, params).await
            }

            async fn update_account_balance(
                &mut self,
                params: UpdateAccountBalanceParams,
            ) -> StoreResult<Account> {
                let $this = self;
                sql::update_account_balance($exec, params).await
            }

            async fn add_account_balance(
                &mut self,
                params: AddAccountBalanceParams,
            ) -> StoreResult<Account> {
                let $this = self;
                sql::add_account_balance($exec, params).await
            }

            async fn delete_account(&mut self, id: i64) -> StoreResult<()> {
                let $this = self;
                sql::delete_account($exec, id).await
            }

            async fn create_transfer(
                &mut self,
                params: CreateTransferParams,
            ) -> StoreResult<Transfer> {
                let $this = self;
                sql::create_transfer($exec, params).await
            }

            async fn get_transfer(&mut self, id: i64) -> StoreResult<Transfer> {
                let $this = self;
                sql::get_transfer($exec, id).await
            }

            async fn list_transfers(
                &mut self,
                params: ListTransfersParams,
            ) -> StoreResult<Vec<Transfer>> {
                let $this = self;
                sql::list_transfers($exec, params).await
            }

            async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
                let $this = self;
                sql::create_entry($exec, params).await
            }

            async fn get_entry(&mut self, id: i64) -> StoreResult<Entry> {
                let $this = self;
                sql::get_entry($exec, id).await
            }

            async fn list_entries(
                &mut self,
                params: ListEntriesParams,
            ) -> StoreResult<Vec<Entry>> {
                let $this = self;
                sql::list_entries($exec, params).await
            }
        }
    };
}

forward_queries!(PgQueries, this => &this.pool);
forward_queries!(PgTx, this => &mut *this.tx);

#[async_trait]
impl TxQueries for PgTx {
    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Commit(e.to_string()))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await.map_err(StoreError::from)
    }
}

/// Statement text, generic over pool and connection executors
mod sql {
    use sqlx::PgExecutor;

    use super::*;

    pub async fn create_account<'e, E: PgExecutor<'e>>(
        exec: E,
        params: &CreateAccountParams,
    ) -> StoreResult<Account> {
        let account = sqlx::query_as::<_, Account>(
            r#"INSERT INTO accounts (owner, balance, currency)
               VALUES ($1, $2, $3)
               RETURNING id, owner, balance, currency, created_at"#,
        )
        .bind(&params.owner)
        .bind(params.balance)
        .bind(&params.currency)
        .fetch_one(exec)
        .await?;

        Ok(account)
    }

    pub async fn get_account<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(
            r#"SELECT id, owner, balance, currency, created_at
               FROM accounts WHERE id = $1 LIMIT 1"#,
        )
        .bind(id)
        .fetch_one(exec)
        .await
        .map_err(|e| StoreError::from_lookup("account", id, e))
    }

    pub async fn list_accounts<'e, E: PgExecutor<'e>>(
        exec: E,
        params: ListAccountsParams,
    ) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(
            r#"SELECT id, owner, balance, currency, created_at
               FROM accounts ORDER BY id LIMIT $1 OFFSET $2"#,
        )
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows)
    }

    pub async fn update_account_balance<'e, E: PgExecutor<'e>>(
        exec: E,
        params: UpdateAccountBalanceParams,
    ) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(
            r#"UPDATE accounts SET balance = $2 WHERE id = $1
               RETURNING id, owner, balance, currency, created_at"#,
        )
        .bind(params.id)
        .bind(params.balance)
        .fetch_one(exec)
        .await
        .map_err(|e| write_error("account", params.id, e))
    }

    pub async fn add_account_balance<'e, E: PgExecutor<'e>>(
        exec: E,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(
            r#"UPDATE accounts SET balance = balance + $2 WHERE id = $1
               RETURNING id, owner, balance, currency, created_at"#,
        )
        .bind(params.id)
        .bind(params.amount)
        .fetch_one(exec)
        .await
        .map_err(|e| write_error("account", params.id, e))
    }

    pub async fn delete_account<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn create_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        params: CreateTransferParams,
    ) -> StoreResult<Transfer> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"INSERT INTO transfers (from_account_id, to_account_id, amount)
               VALUES ($1, $2, $3)
               RETURNING id, from_account_id, to_account_id, amount, created_at"#,
        )
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .fetch_one(exec)
        .await?;

        Ok(transfer)
    }

    pub async fn get_transfer<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> StoreResult<Transfer> {
        sqlx::query_as::<_, Transfer>(
            r#"SELECT id, from_account_id, to_account_id, amount, created_at
               FROM transfers WHERE id = $1 LIMIT 1"#,
        )
        .bind(id)
        .fetch_one(exec)
        .await
        .map_err(|e| StoreError::from_lookup("transfer", id, e))
    }

    pub async fn list_transfers<'e, E: PgExecutor<'e>>(
        exec: E,
        params: ListTransfersParams,
    ) -> StoreResult<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, Transfer>(
            r#"SELECT id, from_account_id, to_account_id, amount, created_at
               FROM transfers
               WHERE from_account_id = $1 AND to_account_id = $2
               ORDER BY id LIMIT $3 OFFSET $4"#,
        )
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows)
    }

    pub async fn create_entry<'e, E: PgExecutor<'e>>(
        exec: E,
        params: CreateEntryParams,
    ) -> StoreResult<Entry> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"INSERT INTO entries (account_id, amount)
               VALUES ($1, $2)
               RETURNING id, account_id, amount, created_at"#,
        )
        .bind(params.account_id)
        .bind(params.amount)
        .fetch_one(exec)
        .await?;

        Ok(entry)
    }

    pub async fn get_entry<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> StoreResult<Entry> {
        sqlx::query_as::<_, Entry>(
            r#"SELECT id, account_id, amount, created_at
               FROM entries WHERE id = $1 LIMIT 1"#,
        )
        .bind(id)
        .fetch_one(exec)
        .await
        .map_err(|e| StoreError::from_lookup("entry", id, e))
    }

    pub async fn list_entries<'e, E: PgExecutor<'e>>(
        exec: E,
        params: ListEntriesParams,
    ) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query_as::<_, Entry>(
            r#"SELECT id, account_id, amount, created_at
               FROM entries WHERE account_id = $1
               ORDER BY id LIMIT $2 OFFSET $3"#,
        )
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows)
    }

    /// Row-level write failure: missing row, deadlock victim, or anything else
    fn write_error(entity: &'static str, id: i64, e: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some(PG_DEADLOCK_DETECTED) {
                return StoreError::Deadlock { account_id: id };
            }
        }
        StoreError::from_lookup(entity, id, e)
    }
}
