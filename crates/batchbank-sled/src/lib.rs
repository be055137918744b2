//! Embedded ordered key-value storage on sled.
//!
//! Accounts live in the `accounts` tree under 8-byte big-endian ids, so tree
//! order is id order. A commit becomes one `sled::Batch`, which sled applies
//! atomically, followed by a flush to disk.

use std::path::{Path, PathBuf};

use batchbank_core::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};
use serde::Deserialize;

const ACCOUNTS_TREE: &str = "accounts";

pub type SledStore = OverlayStore<SledBackend>;

#[derive(Debug, Clone, Deserialize)]
pub struct SledConfig {
    pub path: PathBuf,
}

struct Handle {
    db: sled::Db,
    accounts: sled::Tree,
}

pub struct SledBackend {
    path: PathBuf,
    handle: Option<Handle>,
}

impl SledBackend {
    pub fn new(config: &SledConfig) -> Result<Self, StorageError> {
        if config.path.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfiguration("sled: path is required".to_string()));
        }
        Ok(Self {
            path: config.path.clone(),
            handle: None,
        })
    }

    pub fn store(config: &SledConfig) -> Result<SledStore, StorageError> {
        Ok(OverlayStore::new(Self::new(config)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self) -> Result<&sled::Tree, StorageError> {
        self.handle
            .as_ref()
            .map(|h| &h.accounts)
            .ok_or(StorageError::NotInitialized)
    }
}

fn account_key(id: AccountId) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_account(bytes: &[u8]) -> Result<Account, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::backend("failed to decode account", e))
}

impl Backend for SledBackend {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn guarantee(&self) -> CommitGuarantee {
        CommitGuarantee::Atomic
    }

    fn open(&mut self) -> Result<(), StorageError> {
        let db = sled::open(&self.path)
            .map_err(|e| StorageError::backend(format!("failed to open sled database at {}", self.path.display()), e))?;
        let accounts = db
            .open_tree(ACCOUNTS_TREE)
            .map_err(|e| StorageError::backend("failed to open accounts tree", e))?;
        self.handle = Some(Handle { db, accounts });
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(handle) = self.handle.take() {
            handle
                .db
                .flush()
                .map_err(|e| StorageError::backend("failed to flush sled database", e))?;
        }
        Ok(())
    }

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        let value = self
            .tree()?
            .get(account_key(id))
            .map_err(|e| StorageError::backend("failed to get account", e))?;
        value.map(|bytes| decode_account(&bytes)).transpose()
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        let mut accounts = Vec::new();
        for item in self.tree()?.iter() {
            let (_, value) = item.map_err(|e| StorageError::backend("failed to iterate accounts", e))?;
            accounts.push(decode_account(&value)?);
        }
        Ok(accounts)
    }

    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        let tree = self.tree()?;
        let mut batch = sled::Batch::default();
        for change in changes {
            let value = bincode::serialize(&Account::new(change.id, change.balance))
                .map_err(|e| StorageError::backend("failed to encode account", e))?;
            batch.insert(account_key(change.id).to_vec(), value);
        }
        tree.apply_batch(batch)
            .map_err(|e| StorageError::backend("failed to apply batch", e))?;
        tree.flush()
            .map_err(|e| StorageError::backend("failed to flush accounts tree", e))?;
        tracing::trace!(changes = changes.len(), "Sled batch applied");
        Ok(())
    }
}
