//! Transfer orchestration
//!
//! One transfer is four dependent writes in a single transaction:
//!
//! ```text
//! create transfer ─▶ debit entry ─▶ credit entry ─▶ balance deltas (ascending id)
//! ```
//!
//! Balance rows are always updated lowest account id first, whichever side
//! is the source. Two transfers over the same pair therefore request the
//! row locks in the same order and cannot wait on each other in a cycle.
//! Balances only change through `add_account_balance`, never read-then-write.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::error::{StoreError, StoreResult};
use super::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, TransferTxParams,
    TransferTxResult,
};
use super::queries::{Backend, Queries};
use super::tx::Store;

/// What to do when a transfer leaves the source balance negative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdraftPolicy {
    /// Apply the transfer anyway; the caller guards balances
    #[default]
    Permissive,
    /// Roll the transfer back with `InsufficientFunds`
    Reject,
}

impl OverdraftPolicy {
    /// Under `Reject`, fail if either side ended below zero. A negative
    /// amount debits the destination, so both rows are checked. For a
    /// self-transfer only the final row counts.
    fn check(self, from_account: &Account, to_account: &Account) -> StoreResult<()> {
        if self == OverdraftPolicy::Permissive {
            return Ok(());
        }
        let rows: &[&Account] = if from_account.id == to_account.id {
            &[from_account]
        } else {
            &[from_account, to_account]
        };
        match rows.iter().find(|a| a.balance < 0) {
            Some(overdrawn) => Err(StoreError::InsufficientFunds {
                account_id: overdrawn.id,
                balance: overdrawn.balance,
            }),
            None => Ok(()),
        }
    }
}

impl<B: Backend> Store<B> {
    /// Move `amount` from one account to another atomically.
    ///
    /// Amount and sufficiency are not validated beyond the configured
    /// [`OverdraftPolicy`]. A self-transfer is accepted: the account gets a
    /// debit and a credit entry and its balance ends where it started.
    #[instrument(
        skip_all,
        fields(from = arg.from_account_id, to = arg.to_account_id, amount = arg.amount)
    )]
    pub async fn transfer_tx(&self, arg: TransferTxParams) -> StoreResult<TransferTxResult> {
        let debit = arg
            .amount
            .checked_neg()
            .ok_or_else(|| StoreError::Database("bigint out of range".into()))?;
        let overdraft = self.overdraft;

        let result = self
            .exec_tx(move |q| Box::pin(transfer_writes(q, arg, debit, overdraft)))
            .await?;

        info!(
            transfer_id = result.transfer.id,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer committed"
        );
        Ok(result)
    }
}

/// The four writes of one transfer, in order, against a transaction-bound executor
async fn transfer_writes<Q: Queries + ?Sized>(
    q: &mut Q,
    arg: TransferTxParams,
    debit: i64,
    overdraft: OverdraftPolicy,
) -> StoreResult<TransferTxResult> {
    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;
    debug!(transfer_id = transfer.id, "Transfer record created");

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: debit,
        })
        .await?;
    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;
    debug!(
        from_entry = from_entry.id,
        to_entry = to_entry.id,
        "Entries created"
    );

    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
        add_money(q, arg.from_account_id, debit, arg.to_account_id, arg.amount).await?
    } else {
        let (to_account, from_account) =
            add_money(q, arg.to_account_id, arg.amount, arg.from_account_id, debit).await?;
        (from_account, to_account)
    };

    overdraft.check(&from_account, &to_account)?;

    Ok(TransferTxResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply two balance deltas in the given order and return both updated rows.
///
/// The caller passes the lower account id first.
pub async fn add_money<Q: Queries + ?Sized>(
    q: &mut Q,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> StoreResult<(Account, Account)> {
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;
    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;
    Ok((account1, account2))
}
