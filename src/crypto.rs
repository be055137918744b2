//! Ed25519 signatures over transfer operations.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;

use batchbank_core::AccountId;

#[derive(Serialize)]
struct SigningPayload {
    from: AccountId,
    to: AccountId,
    amount: i64,
}

/// Canonical bytes a sender signs: `{"from":..,"to":..,"amount":..}`.
pub fn signing_message(from: AccountId, to: AccountId, amount: i64) -> Vec<u8> {
    // Serializing three integers cannot fail.
    serde_json::to_vec(&SigningPayload { from, to, amount }).unwrap_or_default()
}

pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(signature) => public_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, String> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| e.to_string())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("invalid public key size: got {}, want 32", b.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| e.to_string())
}

pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn sign_operation(&self, from: AccountId, to: AccountId, amount: i64) -> Vec<u8> {
        self.sign(&signing_message(from, to, amount))
    }
}
