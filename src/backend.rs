//! Backend selection, resolved once at startup.

use std::sync::Arc;

use batchbank_core::{AccountStore, StorageError};
use batchbank_ledger::{LedgerBackend, LedgerConfig, LedgerConnector, MemoryLedger};
use batchbank_memory::MemoryBackend;
use batchbank_redis::{CacheConnector, RedisBackend, RedisConfig, RedisConnector};
use batchbank_sled::{SledBackend, SledConfig};
use batchbank_sqlite::{SqliteBackend, SqliteConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Memory,
    Sled(SledConfig),
    Sqlite(SqliteConfig),
    Redis(RedisConfig),
    Ledger(LedgerConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Sled(_) => "sled",
            BackendConfig::Sqlite(_) => "sqlite",
            BackendConfig::Redis(_) => "redis",
            BackendConfig::Ledger(_) => "ledger",
        }
    }
}

/// Clients for the network-backed adapters.
#[derive(Clone)]
pub struct Connectors {
    pub cache: Arc<dyn CacheConnector>,
    /// The TigerBeetle client when built with the `tigerbeetle` feature.
    /// Ignored when the ledger configuration asks for the simulator.
    pub ledger: Option<Arc<dyn LedgerConnector>>,
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            cache: Arc::new(RedisConnector),
            ledger: default_ledger_connector(),
        }
    }
}

#[cfg(feature = "tigerbeetle")]
fn default_ledger_connector() -> Option<Arc<dyn LedgerConnector>> {
    Some(Arc::new(batchbank_ledger::TigerBeetleConnector))
}

#[cfg(not(feature = "tigerbeetle"))]
fn default_ledger_connector() -> Option<Arc<dyn LedgerConnector>> {
    None
}

/// Builds the configured store. The store is returned uninitialized.
pub fn open_store(config: &BackendConfig, connectors: &Connectors) -> Result<Arc<dyn AccountStore>, StorageError> {
    let store: Arc<dyn AccountStore> = match config {
        BackendConfig::Memory => Arc::new(MemoryBackend::store()),
        BackendConfig::Sled(config) => Arc::new(SledBackend::store(config)?),
        BackendConfig::Sqlite(config) => Arc::new(SqliteBackend::store(config)?),
        BackendConfig::Redis(config) => Arc::new(RedisBackend::store(config.clone(), connectors.cache.clone())?),
        BackendConfig::Ledger(config) => {
            let connector = match (config.simulate, &connectors.ledger) {
                (true, _) => Arc::new(MemoryLedger::new()) as Arc<dyn LedgerConnector>,
                (false, Some(connector)) => connector.clone(),
                (false, None) => {
                    return Err(StorageError::InvalidConfiguration(
                        "ledger: built without the tigerbeetle feature; set simulate = true or inject a connector"
                            .to_string(),
                    ))
                }
            };
            Arc::new(LedgerBackend::store(config.clone(), connector)?)
        }
    };
    tracing::debug!(kind = config.kind(), "Storage backend selected");
    Ok(store)
}
