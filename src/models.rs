use batchbank_core::AccountId;
use serde::{Deserialize, Serialize};

use crate::{
    crypto,
    error::{ProcessError, Rejection},
};

/// One signed transfer intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: i64,
    /// Ed25519 signature over `signing_message`, hex on the wire.
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl Operation {
    pub fn signed(from: AccountId, to: AccountId, amount: i64, keys: &crypto::KeyPair) -> Self {
        Self {
            from,
            to,
            amount,
            signature: keys.sign_operation(from, to, amount),
        }
    }

    pub fn signing_message(&self) -> Vec<u8> {
        crypto::signing_message(self.from, self.to, self.amount)
    }

    pub fn validate_shape(&self) -> Result<(), ProcessError> {
        if self.from == 0 {
            return Err(ProcessError::InvalidSender(self.from));
        }
        if self.to == 0 {
            return Err(ProcessError::InvalidReceiver(self.to));
        }
        if self.amount <= 0 {
            return Err(ProcessError::InvalidAmount(self.amount));
        }
        if self.signature.is_empty() {
            return Err(ProcessError::MissingSignature);
        }
        Ok(())
    }
}

/// An ordered batch of operations applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub operations: Vec<Operation>,
}

impl Transaction {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProcessError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProcessError> {
        serde_json::to_vec(self).map_err(ProcessError::Encode)
    }

    pub fn validate_shape(&self) -> Result<(), Rejection> {
        if self.operations.is_empty() {
            return Err(Rejection::batch(ProcessError::EmptyTransaction));
        }
        for (index, op) in self.operations.iter().enumerate() {
            op.validate_shape().map_err(|reason| Rejection::at(index, reason))?;
        }
        Ok(())
    }
}
