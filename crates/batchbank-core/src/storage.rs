use std::fmt::Display;

use thiserror::Error;

use crate::models::{Account, AccountId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage not initialized")]
    NotInitialized,
    #[error("storage already initialized")]
    AlreadyInitialized,
    #[error("a transaction is already open")]
    TransactionAlreadyOpen,
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("account already exists: {0}")]
    AccountAlreadyExists(AccountId),
    #[error("insufficient balance for account {id}: balance {balance}, delta {delta}")]
    InsufficientBalance {
        id: AccountId,
        balance: i64,
        delta: i64,
    },
    #[error("balance overflow for account {id}")]
    BalanceOverflow { id: AccountId },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{context}: {message}")]
    Backend { context: String, message: String },
    #[error("partial commit on {backend}: {} of {total} changes applied: {message}", .applied.map(|n| n.to_string()).unwrap_or_else(|| "an unknown subset".to_string()))]
    PartialCommit {
        backend: &'static str,
        /// `None` when the backend cannot tell which writes landed.
        applied: Option<usize>,
        total: usize,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse of the store lifecycle. Never retried.
    Lifecycle,
    /// Business-rule rejection. Reported to the caller, never retried or logged as a failure.
    Domain,
    Configuration,
    /// Storage medium failure, wrapped with context.
    Backend,
}

impl StorageError {
    pub fn backend(context: impl Into<String>, err: impl Display) -> Self {
        StorageError::Backend {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotInitialized
            | StorageError::AlreadyInitialized
            | StorageError::TransactionAlreadyOpen => ErrorKind::Lifecycle,
            StorageError::AccountNotFound(_)
            | StorageError::AccountAlreadyExists(_)
            | StorageError::InsufficientBalance { .. }
            | StorageError::BalanceOverflow { .. } => ErrorKind::Domain,
            StorageError::InvalidConfiguration(_) => ErrorKind::Configuration,
            StorageError::IOError(_)
            | StorageError::Backend { .. }
            | StorageError::PartialCommit { .. } => ErrorKind::Backend,
        }
    }

    pub fn is_domain(&self) -> bool {
        self.kind() == ErrorKind::Domain
    }

    pub fn is_backend(&self) -> bool {
        self.kind() == ErrorKind::Backend
    }
}

/// What a successful or failed `commit` promises about the base store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitGuarantee {
    /// Every staged change lands or none does.
    Atomic,
    /// Changes are applied in sequence; a failure part way leaves the
    /// already-applied writes in place and is reported as `PartialCommit`.
    BestEffort,
}

/// The account storage contract every backend adapter implements.
///
/// Reads are overlay-aware: while a transaction is open they observe the
/// transaction's own staged writes. At most one transaction is open per store.
pub trait AccountStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn commit_guarantee(&self) -> CommitGuarantee;

    fn initialize(&self) -> Result<(), StorageError>;
    fn close(&self) -> Result<(), StorageError>;
    fn is_initialized(&self) -> bool;

    fn create_account(&self, id: AccountId, initial_balance: i64) -> Result<(), StorageError>;
    fn account_exists(&self, id: AccountId) -> Result<bool, StorageError>;
    fn get_account(&self, id: AccountId) -> Result<Account, StorageError>;
    fn get_balance(&self, id: AccountId) -> Result<i64, StorageError> {
        self.get_account(id).map(|account| account.balance)
    }
    /// Adds `delta` to the balance. A missing account is created when `delta` is positive.
    fn update_balance(&self, id: AccountId, delta: i64) -> Result<(), StorageError>;
    /// All accounts ordered by id.
    fn get_all_accounts(&self) -> Result<Vec<Account>, StorageError>;

    fn begin_transaction(&self) -> Result<(), StorageError>;
    fn commit(&self) -> Result<(), StorageError>;
    fn rollback(&self) -> Result<(), StorageError>;
    fn in_transaction(&self) -> bool;
}
