use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use batchbank_core::AccountId;
use ed25519_dalek::VerifyingKey;

use crate::{crypto, error::ProcessError};

/// Public keys of the users allowed to sign operations, one per user.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<AccountId, VerifyingKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user: AccountId, key: VerifyingKey) -> Result<(), ProcessError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if keys.contains_key(&user) {
            return Err(ProcessError::KeyAlreadyRegistered(user));
        }
        keys.insert(user, key);
        tracing::debug!(user, "Registered user key");
        Ok(())
    }

    pub fn register_hex(&self, user: AccountId, public_key_hex: &str) -> Result<(), ProcessError> {
        let key = crypto::parse_public_key(public_key_hex).map_err(ProcessError::InvalidPublicKey)?;
        self.register(user, key)
    }

    pub fn get(&self, user: AccountId) -> Option<VerifyingKey> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(&user).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
