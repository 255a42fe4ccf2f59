//! Transfer properties shared by the memory and PostgreSQL suites

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use simple_bank::random::RandomGen;
use simple_bank::store::{
    Account, AddAccountBalanceParams, Backend, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Queries, Store, StoreError, TransferTxParams,
};

use super::{balance_of, create_random_account};

pub async fn open<B: Backend>(store: &Store<B>, owner: &str, balance: i64) -> Account {
    store
        .queries()
        .create_account(&CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: "USD".to_string(),
        })
        .await
        .unwrap()
}

/// A1(100) -> A2(50), amount 10
pub async fn concrete_transfer<B: Backend>(store: &Store<B>) {
    let a1 = open(store, "alice", 100).await;
    let a2 = open(store, "bob", 50).await;

    let result = store
        .transfer_tx(TransferTxParams::new(a1.id, a2.id, 10))
        .await
        .unwrap();

    assert_eq!(result.transfer.from_account_id, a1.id);
    assert_eq!(result.transfer.to_account_id, a2.id);
    assert_eq!(result.transfer.amount, 10);
    assert_eq!((result.from_entry.account_id, result.from_entry.amount), (a1.id, -10));
    assert_eq!((result.to_entry.account_id, result.to_entry.amount), (a2.id, 10));
    assert_eq!(result.from_account.balance, 90);
    assert_eq!(result.to_account.balance, 60);

    assert_eq!(balance_of(store, a1.id).await, 90);
    assert_eq!(balance_of(store, a2.id).await, 60);
}

/// N concurrent transfers X -> Y of the same amount: no lost updates, and
/// each transfer observed a distinct intermediate balance.
pub async fn concurrent_same_direction<B: Backend + 'static>(
    store: Arc<Store<B>>,
    seed: u64,
    n: usize,
    amount: i64,
) {
    let mut rng = RandomGen::seeded(seed);
    let account1 = create_random_account(&store, &mut rng).await;
    let account2 = create_random_account(&store, &mut rng).await;

    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        let store = Arc::clone(&store);
        let params = TransferTxParams::new(account1.id, account2.id, amount);
        handles.push(tokio::spawn(async move { store.transfer_tx(params).await }));
    }

    let mut existed = HashSet::new();
    for handle in handles {
        let result = handle
            .await
            .expect("transfer task panicked")
            .expect("transfer failed");

        let transfer = &result.transfer;
        assert_eq!(transfer.from_account_id, account1.id);
        assert_eq!(transfer.to_account_id, account2.id);
        assert_eq!(transfer.amount, amount);
        assert!(transfer.id > 0);
        assert_eq!(&store.queries().get_transfer(transfer.id).await.unwrap(), transfer);

        let from_entry = &result.from_entry;
        assert_eq!(from_entry.account_id, account1.id);
        assert_eq!(from_entry.amount, -amount);
        assert_eq!(&store.queries().get_entry(from_entry.id).await.unwrap(), from_entry);

        let to_entry = &result.to_entry;
        assert_eq!(to_entry.account_id, account2.id);
        assert_eq!(to_entry.amount, amount);
        assert_eq!(&store.queries().get_entry(to_entry.id).await.unwrap(), to_entry);

        assert_eq!(result.from_account.id, account1.id);
        assert_eq!(result.to_account.id, account2.id);

        let diff1 = account1.balance - result.from_account.balance;
        let diff2 = result.to_account.balance - account2.balance;
        assert_eq!(diff1, diff2);
        assert!(diff1 > 0);
        assert_eq!(diff1 % amount, 0);

        let k = diff1 / amount;
        assert!((1..=n as i64).contains(&k));
        assert!(existed.insert(k), "two transfers observed the same balance");
    }

    assert_eq!(
        balance_of(&store, account1.id).await,
        account1.balance - n as i64 * amount
    );
    assert_eq!(
        balance_of(&store, account2.id).await,
        account2.balance + n as i64 * amount
    );
}

/// Half X -> Y, half Y -> X, all at once. Every call succeeds and the
/// balances end where they started.
pub async fn concurrent_alternating<B: Backend + 'static>(
    store: Arc<Store<B>>,
    seed: u64,
    n: usize,
    amount: i64,
) {
    let mut rng = RandomGen::seeded(seed);
    let account1 = create_random_account(&store, &mut rng).await;
    let account2 = create_random_account(&store, &mut rng).await;

    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let (from, to) = if i % 2 == 1 {
            (account2.id, account1.id)
        } else {
            (account1.id, account2.id)
        };
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.transfer_tx(TransferTxParams::new(from, to, amount)).await
        }));
    }

    for handle in handles {
        let outcome = handle.await.expect("transfer task panicked");
        assert!(outcome.is_ok(), "transfer failed: {:?}", outcome.err());
    }

    assert_eq!(balance_of(&store, account1.id).await, account1.balance);
    assert_eq!(balance_of(&store, account2.id).await, account2.balance);
}

/// Random transfers among a handful of accounts: total balance is conserved
/// and each account moves by exactly its net flow.
pub async fn conservation<B: Backend + 'static>(store: Arc<Store<B>>, seed: u64, n: usize) {
    let mut rng = RandomGen::seeded(seed);
    let mut accounts = Vec::new();
    for _ in 0..4 {
        accounts.push(create_random_account(&store, &mut rng).await);
    }
    let total_before: i64 = accounts.iter().map(|a| a.balance).sum();

    let mut expected: HashMap<i64, i64> = accounts.iter().map(|a| (a.id, a.balance)).collect();
    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        let from = accounts[rng.int(0, 3) as usize].id;
        let mut to = accounts[rng.int(0, 3) as usize].id;
        if to == from {
            to = accounts
                .iter()
                .map(|a| a.id)
                .find(|id| *id != from)
                .unwrap();
        }
        let amount = rng.int(1, 50);
        *expected.get_mut(&from).unwrap() -= amount;
        *expected.get_mut(&to).unwrap() += amount;

        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.transfer_tx(TransferTxParams::new(from, to, amount)).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
        let sides = [result.transfer.from_account_id, result.transfer.to_account_id];
        assert!(sides.contains(&result.from_entry.account_id));
        assert!(sides.contains(&result.to_entry.account_id));
    }

    let mut total_after = 0;
    for account in &accounts {
        let balance = balance_of(&store, account.id).await;
        assert_eq!(balance, expected[&account.id]);
        total_after += balance;
    }
    assert_eq!(total_after, total_before);
}

/// A unit of work that fails after the transfer, both entries and one balance
/// delta leaves nothing behind.
pub async fn failed_unit_leaves_no_residue<B: Backend>(store: &Store<B>) {
    let a1 = open(store, "alice", 100).await;
    let a2 = open(store, "bob", 50).await;
    let written = Arc::new(Mutex::new(None));
    let record = Arc::clone(&written);
    let (from, to) = (a1.id, a2.id);

    let err = store
        .exec_tx(move |q| {
            Box::pin(async move {
                let transfer = q
                    .create_transfer(CreateTransferParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount: 10,
                    })
                    .await?;
                let from_entry = q
                    .create_entry(CreateEntryParams {
                        account_id: from,
                        amount: -10,
                    })
                    .await?;
                let to_entry = q
                    .create_entry(CreateEntryParams {
                        account_id: to,
                        amount: 10,
                    })
                    .await?;
                *record.lock().unwrap() = Some((transfer.id, from_entry.id, to_entry.id));

                q.add_account_balance(AddAccountBalanceParams {
                    id: from,
                    amount: -10,
                })
                .await?;
                Err::<(), _>(StoreError::Aborted("failed before second balance update".into()))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Aborted(_)));
    let (transfer_id, from_entry_id, to_entry_id) =
        written.lock().unwrap().expect("unit of work did not reach its writes");

    let mut q = store.queries();
    assert!(q.get_transfer(transfer_id).await.unwrap_err().is_not_found());
    assert!(q.get_entry(from_entry_id).await.unwrap_err().is_not_found());
    assert!(q.get_entry(to_entry_id).await.unwrap_err().is_not_found());
    assert_eq!(q.get_account(a1.id).await.unwrap().balance, 100);
    assert_eq!(q.get_account(a2.id).await.unwrap().balance, 50);
}

/// Source equals destination: two entries on one account, no net change
pub async fn self_transfer<B: Backend>(store: &Store<B>) {
    let a = open(store, "alice", 100).await;

    let result = store
        .transfer_tx(TransferTxParams::new(a.id, a.id, 25))
        .await
        .unwrap();

    assert_eq!(result.transfer.from_account_id, a.id);
    assert_eq!(result.transfer.to_account_id, a.id);
    assert_eq!(result.from_entry.account_id, a.id);
    assert_eq!(result.to_entry.account_id, a.id);
    assert_eq!(result.from_entry.amount, -25);
    assert_eq!(result.to_entry.amount, 25);
    assert_eq!(result.from_account.balance, 100);
    assert_eq!(balance_of(store, a.id).await, 100);
}
