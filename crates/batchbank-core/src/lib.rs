//! Core types and traits for batchbank storage backends.
//!
//! This crate provides the `AccountStore` contract, the error taxonomy shared
//! by every adapter, and `OverlayStore`, the generic staging layer that turns
//! a `Backend` flush strategy into a full transactional account store.

pub mod models;
pub mod overlay;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod contract;

// Re-export key types at crate root for convenience
pub use models::{Account, AccountId};
pub use overlay::{Backend, Change, OverlayStore};
pub use storage::{AccountStore, CommitGuarantee, ErrorKind, StorageError};
