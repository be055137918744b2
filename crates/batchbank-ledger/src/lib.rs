//! Account storage on an external double-entry ledger service.
//!
//! Every account is a ledger account whose balance is derived as
//! `credits_posted - debits_posted`. Balance changes are transfers against a
//! reserved system account. The service only accepts individual transfers, so
//! a commit replays the staged net deltas one transfer per account and can be
//! interrupted part way.

mod client;
mod memory;
#[cfg(feature = "tigerbeetle")]
mod tigerbeetle;

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use batchbank_core::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};
use serde::Deserialize;
use uuid::Uuid;

pub use client::{
    CreateAccountError, CreateTransferError, LedgerAccount, LedgerClient, LedgerConnector, LedgerError, Transfer,
    ACCOUNT_CODE, LEDGER, TRANSFER_CODE,
};
pub use memory::MemoryLedger;
#[cfg(feature = "tigerbeetle")]
pub use tigerbeetle::{TigerBeetleClient, TigerBeetleConnector};

/// Counter-party of every balance mutation. Outside the `u64` account id space.
pub const SYSTEM_ACCOUNT_ID: u128 = 1 << 64;

pub type LedgerStore = OverlayStore<LedgerBackend>;

/// Ledger cluster identifier. Configured as an integer or a hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ClusterIdRepr")]
pub struct ClusterId(pub u128);

#[derive(Deserialize)]
#[serde(untagged)]
enum ClusterIdRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<ClusterIdRepr> for ClusterId {
    type Error = String;

    fn try_from(repr: ClusterIdRepr) -> Result<Self, Self::Error> {
        match repr {
            ClusterIdRepr::Number(n) => Ok(ClusterId(n as u128)),
            ClusterIdRepr::Text(s) => {
                let digits = s.trim_start_matches("0x").trim_start_matches("0X");
                u128::from_str_radix(digits, 16)
                    .map(ClusterId)
                    .map_err(|e| format!("invalid cluster id {:?}: {}", s, e))
            }
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub addresses: Vec<String>,
    #[serde(default)]
    pub cluster_id: ClusterId,
    /// Run against an in-process ledger instead of the cluster at `addresses`.
    #[serde(default)]
    pub simulate: bool,
}

pub struct LedgerBackend {
    config: LedgerConfig,
    connector: Arc<dyn LedgerConnector>,
    client: Option<Arc<dyn LedgerClient>>,
    /// Accounts created or observed through this instance; the service has no scan.
    known: Mutex<BTreeSet<AccountId>>,
}

fn ledger_error(context: &str) -> impl FnOnce(LedgerError) -> StorageError + '_ {
    move |e| StorageError::backend(context, e)
}

fn account_from_ledger(id: AccountId, account: &LedgerAccount) -> Result<Account, StorageError> {
    let balance = i64::try_from(account.net_credit())
        .map_err(|_| StorageError::backend("failed to read balance", format!("account {} balance out of range", id)))?;
    Ok(Account::new(id, balance))
}

impl LedgerBackend {
    pub fn new(config: LedgerConfig, connector: Arc<dyn LedgerConnector>) -> Result<Self, StorageError> {
        if config.addresses.is_empty() && !config.simulate {
            return Err(StorageError::InvalidConfiguration("ledger: at least one address is required".to_string()));
        }
        Ok(Self {
            config,
            connector,
            client: None,
            known: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn store(config: LedgerConfig, connector: Arc<dyn LedgerConnector>) -> Result<LedgerStore, StorageError> {
        Ok(OverlayStore::new(Self::new(config, connector)?))
    }

    fn client(&self) -> Result<&Arc<dyn LedgerClient>, StorageError> {
        self.client.as_ref().ok_or(StorageError::NotInitialized)
    }

    fn remember(&self, id: AccountId) {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
    }

    fn transfer(&self, id: AccountId, delta: i128) -> Result<(), StorageError> {
        let (debit, credit) = if delta > 0 {
            (SYSTEM_ACCOUNT_ID, id as u128)
        } else {
            (id as u128, SYSTEM_ACCOUNT_ID)
        };
        let transfer = Transfer::new(Uuid::new_v4().as_u128(), debit, credit, delta.unsigned_abs());
        let failures = self
            .client()?
            .create_transfers(&[transfer])
            .map_err(ledger_error("failed to create transfer"))?;
        match failures.first() {
            Some((_, reason)) => Err(StorageError::backend(format!("transfer for account {} rejected", id), reason)),
            None => Ok(()),
        }
    }

    /// Books one change. `wrote` is set once anything reached the ledger.
    fn apply(&self, change: &Change, wrote: &mut bool) -> Result<(), StorageError> {
        if change.is_creation() {
            self.create(change.id)?;
            self.remember(change.id);
            *wrote = true;
        }
        match change.delta() {
            0 => Ok(()),
            delta => {
                self.transfer(change.id, delta)?;
                *wrote = true;
                Ok(())
            }
        }
    }

    fn create(&self, id: AccountId) -> Result<(), StorageError> {
        let failures = self
            .client()?
            .create_accounts(&[LedgerAccount::new(id as u128)])
            .map_err(ledger_error("failed to create account"))?;
        match failures.first() {
            Some((_, reason)) => Err(StorageError::backend(format!("account {} rejected", id), reason)),
            None => Ok(()),
        }
    }
}

impl Backend for LedgerBackend {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn guarantee(&self) -> CommitGuarantee {
        CommitGuarantee::BestEffort
    }

    fn open(&mut self) -> Result<(), StorageError> {
        let client = self
            .connector
            .connect(&self.config)
            .map_err(|e| StorageError::backend(format!("failed to connect to ledger cluster {}", self.config.cluster_id), e))?;
        let failures = client
            .create_accounts(&[LedgerAccount::new(SYSTEM_ACCOUNT_ID)])
            .map_err(ledger_error("failed to create system account"))?;
        if let Some((_, reason)) = failures.into_iter().find(|(_, r)| *r != CreateAccountError::Exists) {
            return Err(StorageError::backend("failed to create system account", reason));
        }
        self.client = Some(client);
        tracing::debug!(cluster_id = %self.config.cluster_id, addresses = ?self.config.addresses, "Connected to ledger");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.client = None;
        self.known.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        let found = self
            .client()?
            .lookup_accounts(&[id as u128])
            .map_err(ledger_error("failed to look up account"))?;
        match found.first() {
            Some(account) => {
                self.remember(id);
                account_from_ledger(id, account).map(Some)
            }
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        let ids: Vec<AccountId> = self
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ledger_ids: Vec<u128> = ids.iter().map(|id| *id as u128).collect();
        let found = self
            .client()?
            .lookup_accounts(&ledger_ids)
            .map_err(ledger_error("failed to look up accounts"))?;

        let mut accounts = found
            .iter()
            .map(|account| account_from_ledger(account.id as AccountId, account))
            .collect::<Result<Vec<_>, _>>()?;
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }

    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        let mut wrote = false;
        for (applied, change) in changes.iter().enumerate() {
            if let Err(e) = self.apply(change, &mut wrote) {
                if !wrote {
                    return Err(e);
                }
                return Err(StorageError::PartialCommit {
                    backend: "ledger",
                    applied: Some(applied),
                    total: changes.len(),
                    message: e.to_string(),
                });
            }
        }
        tracing::trace!(changes = changes.len(), "Ledger transfers replayed");
        Ok(())
    }
}
