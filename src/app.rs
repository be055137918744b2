//! Callbacks the consensus engine drives: admission checks, block delivery,
//! chain initialization and state queries.

use batchbank_core::{Account, AccountId, StorageError};
use serde::{Deserialize, Serialize};

use crate::{
    error::ProcessError,
    models::Transaction,
    processor::{BatchOutcome, BatchProcessor},
};

pub const CODE_OK: u32 = 0;
pub const CODE_DECODE: u32 = 1;
pub const CODE_REJECTED: u32 = 2;
pub const CODE_UNKNOWN_QUERY: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub code: u32,
    pub log: String,
}

impl TxResult {
    fn ok(log: impl Into<String>) -> Self {
        Self {
            code: CODE_OK,
            log: log.into(),
        }
    }

    fn fail(code: u32, log: impl Into<String>) -> Self {
        Self { code, log: log.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub code: u32,
    pub log: String,
    pub value: Vec<u8>,
}

/// One account seeded at chain start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenesisAccount {
    pub id: AccountId,
    #[serde(default)]
    pub balance: i64,
    /// Hex-encoded ed25519 public key allowed to sign for this account.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct StateView<'a> {
    accounts: &'a [Account],
}

pub struct Application {
    processor: BatchProcessor,
}

impl Application {
    pub fn new(processor: BatchProcessor) -> Self {
        Self { processor }
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.processor
    }

    /// Admission check. Never mutates state.
    pub fn check_tx(&self, bytes: &[u8]) -> TxResult {
        let tx = match Transaction::decode(bytes) {
            Ok(tx) => tx,
            Err(e) => return TxResult::fail(CODE_DECODE, format!("Invalid transaction format: {}", e)),
        };
        match self.processor.validate(&tx) {
            Ok(()) => TxResult::ok("Transaction is valid"),
            Err(rejection) => TxResult::fail(CODE_REJECTED, format!("Invalid transaction: {}", rejection)),
        }
    }

    pub fn deliver_tx(&self, bytes: &[u8]) -> TxResult {
        let tx = match Transaction::decode(bytes) {
            Ok(tx) => tx,
            Err(e) => return TxResult::fail(CODE_DECODE, format!("Invalid transaction format: {}", e)),
        };
        let outcome = self.processor.process(&tx);
        let (success, message) = outcome.message();
        if let BatchOutcome::Committed { applied, .. } = &outcome {
            tracing::info!(operations = tx.operations.len(), applied, "Delivered transaction");
        }
        if success {
            TxResult::ok(message)
        } else {
            TxResult::fail(CODE_REJECTED, message)
        }
    }

    /// Processes every transaction of a block in order.
    pub fn finalize_block(&self, txs: &[Vec<u8>]) -> Vec<TxResult> {
        txs.iter().map(|tx| self.deliver_tx(tx)).collect()
    }

    pub fn register_user_key(&self, user: AccountId, public_key_hex: &str) -> Result<(), ProcessError> {
        self.processor.keys().register_hex(user, public_key_hex)
    }

    /// Seeds genesis accounts that do not exist yet and registers their keys.
    ///
    /// Funded accounts are credited into existence through `update_balance`.
    /// A zero or negative seed has nothing to credit and is created as is.
    pub fn init_chain(&self, genesis: &[GenesisAccount]) -> Result<(), ProcessError> {
        let store = self.processor.store();
        for account in genesis {
            if !store.account_exists(account.id)? {
                if account.balance > 0 {
                    store.update_balance(account.id, account.balance)?;
                } else {
                    store.create_account(account.id, account.balance)?;
                }
            }
            if let Some(key) = &account.public_key {
                match self.register_user_key(account.id, key) {
                    Ok(()) | Err(ProcessError::KeyAlreadyRegistered(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::info!(accounts = genesis.len(), "Initialized chain");
        Ok(())
    }

    pub fn query_account(&self, id: AccountId) -> Result<Account, StorageError> {
        self.processor.store().get_account(id)
    }

    pub fn query_state(&self) -> Result<Vec<Account>, StorageError> {
        self.processor.store().get_all_accounts()
    }

    /// Path-routed query: `state`, or `account` with the JSON account id as data.
    pub fn query(&self, path: &str, data: &[u8]) -> QueryResult {
        let result = match path {
            "state" => self
                .query_state()
                .map_err(|e| e.to_string())
                .and_then(|accounts| serde_json::to_vec(&StateView { accounts: &accounts }).map_err(|e| e.to_string())),
            "account" => {
                let id: AccountId = match serde_json::from_slice(data) {
                    Ok(id) => id,
                    Err(e) => return query_failure(CODE_DECODE, format!("Invalid account ID format: {}", e)),
                };
                self.query_account(id)
                    .map_err(|e| e.to_string())
                    .and_then(|account| serde_json::to_vec(&account).map_err(|e| e.to_string()))
            }
            other => return query_failure(CODE_UNKNOWN_QUERY, format!("Unknown query path: {}", other)),
        };
        match result {
            Ok(value) => QueryResult {
                code: CODE_OK,
                log: String::new(),
                value,
            },
            Err(e) => query_failure(CODE_REJECTED, e),
        }
    }
}

fn query_failure(code: u32, log: String) -> QueryResult {
    QueryResult {
        code,
        log,
        value: Vec::new(),
    }
}
