//! In-memory account storage. Nothing survives `close`.

use std::collections::BTreeMap;

use batchbank_core::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};

pub type MemoryStore = OverlayStore<MemoryBackend>;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    accounts: BTreeMap<AccountId, i64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store() -> MemoryStore {
        OverlayStore::new(Self::new())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn guarantee(&self) -> CommitGuarantee {
        CommitGuarantee::Atomic
    }

    fn open(&mut self) -> Result<(), StorageError> {
        self.accounts.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.accounts.clear();
        Ok(())
    }

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts.get(&id).map(|balance| Account::new(id, *balance)))
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self
            .accounts
            .iter()
            .map(|(id, balance)| Account::new(*id, *balance))
            .collect())
    }

    // Runs under the store's exclusive lock, so the whole set lands at once.
    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        for change in changes {
            self.accounts.insert(change.id, change.balance);
        }
        tracing::trace!(changes = changes.len(), "Memory flush");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchbank_core::AccountStore;

    batchbank_core::account_store_contract_tests!(contract, MemoryBackend::store());

    #[test]
    fn test_reinitialize_starts_empty() {
        let store = MemoryBackend::store();
        store.initialize().unwrap();
        store.create_account(1, 10).unwrap();
        store.close().unwrap();

        store.initialize().unwrap();
        assert!(store.get_all_accounts().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(MemoryBackend::store());
        store.initialize().unwrap();
        for id in 1..=4 {
            store.create_account(id, 1_000).unwrap();
        }

        let handles: Vec<_> = (1..=4u64)
            .map(|id| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.update_balance(id, -1).unwrap();
                        store.get_all_accounts().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: i64 = store.get_all_accounts().unwrap().iter().map(|a| a.balance).sum();
        assert_eq!(total, 4 * 900);
    }
}
