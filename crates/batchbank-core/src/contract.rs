//! Behaviour every `AccountStore` must show, written once and run against
//! each adapter through `account_store_contract_tests!`.
//!
//! Each function receives a fresh, uninitialized store.

use crate::{AccountStore, StorageError};

pub fn lifecycle_guards(store: &dyn AccountStore) {
    assert!(matches!(store.get_account(1), Err(StorageError::NotInitialized)));
    assert!(matches!(store.account_exists(1), Err(StorageError::NotInitialized)));
    assert!(matches!(store.update_balance(1, 5), Err(StorageError::NotInitialized)));
    assert!(matches!(store.begin_transaction(), Err(StorageError::NotInitialized)));
    assert!(matches!(store.close(), Err(StorageError::NotInitialized)));

    store.initialize().unwrap();
    assert!(store.is_initialized());
    assert!(matches!(store.initialize(), Err(StorageError::AlreadyInitialized)));

    store.close().unwrap();
    assert!(!store.is_initialized());
    assert!(matches!(store.get_all_accounts(), Err(StorageError::NotInitialized)));
}

pub fn create_and_read(store: &dyn AccountStore) {
    store.initialize().unwrap();
    assert!(!store.account_exists(1).unwrap());

    store.create_account(1, 1000).unwrap();
    assert!(store.account_exists(1).unwrap());
    assert_eq!(store.get_balance(1).unwrap(), 1000);
    assert_eq!(store.get_account(1).unwrap().id, 1);

    assert!(matches!(store.create_account(1, 5), Err(StorageError::AccountAlreadyExists(1))));
    assert!(matches!(store.get_account(2), Err(StorageError::AccountNotFound(2))));
    assert!(matches!(store.get_balance(2), Err(StorageError::AccountNotFound(2))));
    store.close().unwrap();
}

pub fn update_balance_rules(store: &dyn AccountStore) {
    store.initialize().unwrap();

    // auto-vivification on a positive delta
    store.update_balance(5, 30).unwrap();
    assert_eq!(store.get_balance(5).unwrap(), 30);

    assert!(matches!(
        store.update_balance(5, -50),
        Err(StorageError::InsufficientBalance { id: 5, balance: 30, delta: -50 })
    ));
    assert_eq!(store.get_balance(5).unwrap(), 30);

    store.update_balance(5, -30).unwrap();
    assert_eq!(store.get_balance(5).unwrap(), 0);

    assert!(matches!(store.update_balance(6, 0), Err(StorageError::AccountNotFound(6))));
    assert!(matches!(store.update_balance(6, -1), Err(StorageError::AccountNotFound(6))));
    assert!(!store.account_exists(6).unwrap());
    store.close().unwrap();
}

pub fn commit_applies_overlay(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, 1000).unwrap();
    store.create_account(2, 0).unwrap();

    store.begin_transaction().unwrap();
    assert!(store.in_transaction());
    store.update_balance(1, -100).unwrap();
    store.update_balance(2, 100).unwrap();
    store.update_balance(1, -50).unwrap();
    store.update_balance(2, 50).unwrap();
    assert_eq!(store.get_balance(1).unwrap(), 850);
    store.commit().unwrap();
    assert!(!store.in_transaction());

    assert_eq!(store.get_balance(1).unwrap(), 850);
    assert_eq!(store.get_balance(2).unwrap(), 150);
    store.close().unwrap();
}

pub fn rollback_restores_base(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, 100).unwrap();
    store.create_account(2, 7).unwrap();
    let before = store.get_all_accounts().unwrap();

    store.begin_transaction().unwrap();
    store.update_balance(1, -60).unwrap();
    store.update_balance(2, 60).unwrap();
    store.create_account(3, 42).unwrap();
    store.update_balance(4, 9).unwrap();
    store.rollback().unwrap();

    assert_eq!(store.get_all_accounts().unwrap(), before);
    assert!(!store.account_exists(3).unwrap());
    assert!(!store.account_exists(4).unwrap());
    store.close().unwrap();
}

pub fn read_your_writes(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, 10).unwrap();

    store.begin_transaction().unwrap();
    store.create_account(2, 20).unwrap();
    assert!(store.account_exists(2).unwrap());
    assert_eq!(store.get_balance(2).unwrap(), 20);
    assert!(matches!(store.create_account(2, 1), Err(StorageError::AccountAlreadyExists(2))));
    assert!(matches!(store.create_account(1, 1), Err(StorageError::AccountAlreadyExists(1))));

    store.update_balance(1, 5).unwrap();
    let all = store.get_all_accounts().unwrap();
    let view: Vec<(u64, i64)> = all.iter().map(|a| (a.id, a.balance)).collect();
    assert_eq!(view, vec![(1, 15), (2, 20)]);
    store.commit().unwrap();

    let view: Vec<(u64, i64)> = store.get_all_accounts().unwrap().iter().map(|a| (a.id, a.balance)).collect();
    assert_eq!(view, vec![(1, 15), (2, 20)]);
    store.close().unwrap();
}

pub fn failed_update_inside_transaction_has_no_effect(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, 100).unwrap();

    store.begin_transaction().unwrap();
    store.update_balance(1, -60).unwrap();
    assert!(matches!(store.update_balance(1, -60), Err(StorageError::InsufficientBalance { .. })));
    assert_eq!(store.get_balance(1).unwrap(), 40);
    store.rollback().unwrap();

    assert_eq!(store.get_balance(1).unwrap(), 100);
    store.close().unwrap();
}

pub fn transaction_idempotence(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.commit().unwrap();
    store.commit().unwrap();
    store.rollback().unwrap();
    store.rollback().unwrap();

    store.begin_transaction().unwrap();
    assert!(matches!(store.begin_transaction(), Err(StorageError::TransactionAlreadyOpen)));
    store.rollback().unwrap();
    store.begin_transaction().unwrap();
    store.commit().unwrap();
    store.close().unwrap();
}

pub fn close_discards_open_transaction(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, 100).unwrap();
    store.begin_transaction().unwrap();
    store.update_balance(1, 900).unwrap();
    store.close().unwrap();
    assert!(!store.in_transaction());
}

pub fn negative_seed_is_allowed(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(8, -5).unwrap();
    assert_eq!(store.get_balance(8).unwrap(), -5);
    assert!(matches!(store.update_balance(8, -1), Err(StorageError::InsufficientBalance { .. })));
    store.update_balance(8, 10).unwrap();
    assert_eq!(store.get_balance(8).unwrap(), 5);
    store.close().unwrap();
}

pub fn large_credit_after_negative_seed(store: &dyn AccountStore) {
    store.initialize().unwrap();
    store.create_account(1, -10).unwrap();

    store.begin_transaction().unwrap();
    store.update_balance(1, i64::MAX).unwrap();
    store.update_balance(1, 5).unwrap();
    store.commit().unwrap();

    assert_eq!(store.get_balance(1).unwrap(), i64::MAX - 5);
    assert!(matches!(store.update_balance(1, 10), Err(StorageError::BalanceOverflow { id: 1 })));
    assert_eq!(store.get_balance(1).unwrap(), i64::MAX - 5);
    store.close().unwrap();
}

/// Stamps out one `#[test]` per contract function inside `mod $name`.
///
/// `$factory` is evaluated once per test and must yield a fresh store value.
#[macro_export]
macro_rules! account_store_contract_tests {
    ($name:ident, $factory:expr) => {
        mod $name {
            #[allow(unused_imports)]
            use super::*;

            $crate::account_store_contract_tests!(@cases $factory;
                lifecycle_guards,
                create_and_read,
                update_balance_rules,
                commit_applies_overlay,
                rollback_restores_base,
                read_your_writes,
                failed_update_inside_transaction_has_no_effect,
                transaction_idempotence,
                close_discards_open_transaction,
                negative_seed_is_allowed,
                large_credit_after_negative_seed
            );
        }
    };
    (@cases $factory:expr; $($case:ident),+) => {
        $(
            #[test]
            fn $case() {
                let store = $factory;
                $crate::contract::$case(&store);
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};

    #[derive(Default)]
    struct MapBackend {
        accounts: BTreeMap<AccountId, i64>,
    }

    impl Backend for MapBackend {
        fn name(&self) -> &'static str {
            "map"
        }

        fn guarantee(&self) -> CommitGuarantee {
            CommitGuarantee::Atomic
        }

        fn open(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
            Ok(self.accounts.get(&id).map(|b| Account::new(id, *b)))
        }

        fn load_all(&self) -> Result<Vec<Account>, StorageError> {
            Ok(self.accounts.iter().map(|(id, b)| Account::new(*id, *b)).collect())
        }

        fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
            for change in changes {
                self.accounts.insert(change.id, change.balance);
            }
            Ok(())
        }
    }

    crate::account_store_contract_tests!(map_backend, OverlayStore::new(MapBackend::default()));
}
