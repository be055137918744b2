pub mod app;
pub mod backend;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod models;
pub mod processor;

pub use batchbank_core::{Account, AccountId, AccountStore, CommitGuarantee, StorageError};
