use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    models::{Account, AccountId},
    storage::{AccountStore, CommitGuarantee, StorageError},
};

/// One account write handed to `Backend::flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub id: AccountId,
    /// Committed balance when the change was staged; `None` if the account
    /// is being created.
    pub observed: Option<i64>,
    pub balance: i64,
}

impl Change {
    /// Net balance movement relative to what was observed. Widened, since a
    /// negative seed followed by large credits can move further than `i64`.
    pub fn delta(&self) -> i128 {
        self.balance as i128 - self.observed.unwrap_or(0) as i128
    }

    pub fn is_creation(&self) -> bool {
        self.observed.is_none()
    }
}

/// Persistence strategy plugged into `OverlayStore`.
///
/// Adapters only know how to read committed state and how to make a set of
/// changes durable; staging, lifecycle and balance rules live in the overlay.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn guarantee(&self) -> CommitGuarantee;

    fn open(&mut self) -> Result<(), StorageError>;
    fn close(&mut self) -> Result<(), StorageError>;

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError>;
    fn load_all(&self) -> Result<Vec<Account>, StorageError>;

    /// Applies `changes` (ordered by id) to the committed store.
    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    observed: Option<i64>,
    balance: i64,
    dirty: bool,
}

/// Tentative account states of the one open transaction.
#[derive(Debug, Default)]
struct Overlay {
    entries: BTreeMap<AccountId, Entry>,
}

impl Overlay {
    fn changes(&self) -> Vec<Change> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, entry)| Change {
                id: *id,
                observed: entry.observed,
                balance: entry.balance,
            })
            .collect()
    }
}

struct Inner<B> {
    backend: B,
    initialized: bool,
    overlay: Option<Overlay>,
}

impl<B: Backend> Inner<B> {
    fn ensure_initialized(&self) -> Result<(), StorageError> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        Ok(())
    }

    /// Overlay first, then the committed base. Never caches.
    fn lookup(&self, id: AccountId) -> Result<Option<i64>, StorageError> {
        if let Some(entry) = self.overlay.as_ref().and_then(|o| o.entries.get(&id)) {
            return Ok(Some(entry.balance));
        }
        Ok(self.backend.load(id)?.map(|account| account.balance))
    }

    /// Like `lookup`, but copies base accounts into the open overlay so the
    /// rest of the transaction works on a private snapshot.
    fn lookup_mut(&mut self, id: AccountId) -> Result<Option<i64>, StorageError> {
        let Some(overlay) = self.overlay.as_ref() else {
            return Ok(self.backend.load(id)?.map(|account| account.balance));
        };
        if let Some(entry) = overlay.entries.get(&id) {
            return Ok(Some(entry.balance));
        }
        let loaded = self.backend.load(id)?;
        if let (Some(account), Some(overlay)) = (loaded, self.overlay.as_mut()) {
            overlay.entries.insert(id, Entry {
                observed: Some(account.balance),
                balance: account.balance,
                dirty: false,
            });
        }
        Ok(loaded.map(|account| account.balance))
    }

    fn write(&mut self, id: AccountId, observed: Option<i64>, balance: i64) -> Result<(), StorageError> {
        match self.overlay.as_mut() {
            Some(overlay) => {
                let entry = overlay.entries.entry(id).or_insert(Entry { observed, balance, dirty: true });
                entry.balance = balance;
                entry.dirty = true;
                Ok(())
            }
            None => self.backend.flush(&[Change { id, observed, balance }]),
        }
    }
}

/// A transactional `AccountStore` over any `Backend`.
///
/// Readers share the lock; writers, `begin_transaction`, `commit` and
/// `rollback` take it exclusively. A read that has to copy a base account into
/// the overlay upgrades to the exclusive lock.
pub struct OverlayStore<B> {
    inner: RwLock<Inner<B>>,
}

impl<B: Backend> OverlayStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: RwLock::new(Inner {
                backend,
                initialized: false,
                overlay: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<B>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<B>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the backend, e.g. to inspect adapter state in tests.
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.read().backend)
    }
}

impl<B: Backend> AccountStore for OverlayStore<B> {
    fn name(&self) -> &'static str {
        self.read().backend.name()
    }

    fn commit_guarantee(&self) -> CommitGuarantee {
        self.read().backend.guarantee()
    }

    fn initialize(&self) -> Result<(), StorageError> {
        let mut inner = self.write();
        if inner.initialized {
            return Err(StorageError::AlreadyInitialized);
        }
        inner.backend.open()?;
        inner.initialized = true;
        tracing::info!(backend = inner.backend.name(), "Storage initialized");
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;
        if let Some(overlay) = inner.overlay.take() {
            tracing::debug!(staged = overlay.entries.len(), "Discarding open transaction on close");
        }
        inner.initialized = false;
        inner.backend.close()?;
        tracing::info!(backend = inner.backend.name(), "Storage closed");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    fn create_account(&self, id: AccountId, initial_balance: i64) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;
        if inner.lookup(id)?.is_some() {
            return Err(StorageError::AccountAlreadyExists(id));
        }
        inner.write(id, None, initial_balance)
    }

    fn account_exists(&self, id: AccountId) -> Result<bool, StorageError> {
        let inner = self.read();
        inner.ensure_initialized()?;
        Ok(inner.lookup(id)?.is_some())
    }

    fn get_account(&self, id: AccountId) -> Result<Account, StorageError> {
        {
            let inner = self.read();
            inner.ensure_initialized()?;
            match inner.overlay.as_ref() {
                Some(overlay) => {
                    if let Some(entry) = overlay.entries.get(&id) {
                        return Ok(Account::new(id, entry.balance));
                    }
                }
                None => {
                    return inner.backend.load(id)?.ok_or(StorageError::AccountNotFound(id));
                }
            }
        }

        // Base-only account inside a transaction: copy it into the overlay.
        let mut inner = self.write();
        inner.ensure_initialized()?;
        let balance = inner.lookup_mut(id)?.ok_or(StorageError::AccountNotFound(id))?;
        Ok(Account::new(id, balance))
    }

    fn update_balance(&self, id: AccountId, delta: i64) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;

        let Some(balance) = inner.lookup_mut(id)? else {
            if delta > 0 {
                return inner.write(id, None, delta);
            }
            return Err(StorageError::AccountNotFound(id));
        };

        let new_balance = balance
            .checked_add(delta)
            .ok_or(StorageError::BalanceOverflow { id })?;
        if new_balance < 0 {
            return Err(StorageError::InsufficientBalance { id, balance, delta });
        }

        // lookup_mut already staged the observed balance when a transaction is open.
        inner.write(id, Some(balance), new_balance)
    }

    fn get_all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let inner = self.read();
        inner.ensure_initialized()?;

        let mut merged: BTreeMap<AccountId, i64> = inner
            .backend
            .load_all()?
            .into_iter()
            .map(|account| (account.id, account.balance))
            .collect();
        if let Some(overlay) = inner.overlay.as_ref() {
            for (id, entry) in &overlay.entries {
                merged.insert(*id, entry.balance);
            }
        }

        Ok(merged.into_iter().map(|(id, balance)| Account::new(id, balance)).collect())
    }

    fn begin_transaction(&self) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;
        if inner.overlay.is_some() {
            return Err(StorageError::TransactionAlreadyOpen);
        }
        inner.overlay = Some(Overlay::default());
        tracing::debug!(backend = inner.backend.name(), "Transaction started");
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;
        let Some(overlay) = inner.overlay.take() else {
            return Ok(());
        };

        let changes = overlay.changes();
        if changes.is_empty() {
            tracing::debug!("Transaction committed with no changes");
            return Ok(());
        }

        match inner.backend.flush(&changes) {
            Ok(()) => {
                tracing::debug!(backend = inner.backend.name(), changes = changes.len(), "Transaction committed");
                Ok(())
            }
            Err(e) => {
                if let StorageError::PartialCommit { applied, total, .. } = &e {
                    tracing::warn!(backend = inner.backend.name(), ?applied, total, "Commit partially applied");
                }
                Err(e)
            }
        }
    }

    fn rollback(&self) -> Result<(), StorageError> {
        let mut inner = self.write();
        inner.ensure_initialized()?;
        if let Some(overlay) = inner.overlay.take() {
            tracing::debug!(backend = inner.backend.name(), staged = overlay.entries.len(), "Transaction rolled back");
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.read().overlay.is_some()
    }
}
