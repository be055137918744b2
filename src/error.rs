use batchbank_core::{AccountId, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("transaction must contain at least one operation")]
    EmptyTransaction,
    #[error("invalid sender ID {0}")]
    InvalidSender(AccountId),
    #[error("invalid recipient ID {0}")]
    InvalidReceiver(AccountId),
    #[error("invalid amount {0}")]
    InvalidAmount(i64),
    #[error("missing signature")]
    MissingSignature,
    #[error("no public key registered for user {0}")]
    UnknownSigner(AccountId),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("insufficient balance: {balance} < {amount}")]
    InsufficientBalance { balance: i64, amount: i64 },
    #[error("failed to decode transaction: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode transaction: {0}")]
    Encode(serde_json::Error),
    #[error("user {0} already has a registered key")]
    KeyAlreadyRegistered(AccountId),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProcessError {
    /// Whether the failure is a business-rule rejection rather than a fault
    /// of the storage medium.
    pub fn is_domain(&self) -> bool {
        match self {
            ProcessError::Storage(e) => e.is_domain(),
            ProcessError::Encode(_) => false,
            _ => true,
        }
    }
}

/// Why a batch was refused, and which operation caused it when one did.
#[derive(Debug)]
pub struct Rejection {
    pub index: Option<usize>,
    pub reason: ProcessError,
}

impl Rejection {
    pub fn at(index: usize, reason: impl Into<ProcessError>) -> Self {
        Self {
            index: Some(index),
            reason: reason.into(),
        }
    }

    pub fn batch(reason: impl Into<ProcessError>) -> Self {
        Self {
            index: None,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "operation {}: {}", index, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown batch policy {0:?}, expected \"all_or_nothing\" or \"skip_failed\"")]
    UnknownPolicy(String),
}
