//! Account storage on a remote Redis-compatible cache.
//!
//! Each account is one key (`key_prefix + id`) holding `{"id":..,"balance":..}`.
//! The cache has no multi-key transaction we rely on, so a commit is a single
//! non-transactional pipeline of `SET`s: if it fails, an unknown subset of the
//! writes may already be visible and the commit reports `PartialCommit`.

mod connection;

use std::sync::{Arc, Mutex, PoisonError};

use batchbank_core::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};
use serde::Deserialize;

pub use connection::{CacheConnection, CacheConnector, MemoryCache, RedisConnection, RedisConnector};

pub type RedisStore = OverlayStore<RedisBackend>;

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index.
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "account:".to_string()
}

impl RedisConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
        }
    }
}

pub struct RedisBackend {
    config: RedisConfig,
    connector: Arc<dyn CacheConnector>,
    conn: Mutex<Option<Box<dyn CacheConnection>>>,
}

impl RedisBackend {
    pub fn new(config: RedisConfig) -> Result<Self, StorageError> {
        Self::with_connector(config, Arc::new(RedisConnector))
    }

    pub fn with_connector(config: RedisConfig, connector: Arc<dyn CacheConnector>) -> Result<Self, StorageError> {
        if config.address.is_empty() {
            return Err(StorageError::InvalidConfiguration("redis: address is required".to_string()));
        }
        if config.db < 0 {
            return Err(StorageError::InvalidConfiguration(format!("redis: invalid db index {}", config.db)));
        }
        Ok(Self {
            config,
            connector,
            conn: Mutex::new(None),
        })
    }

    pub fn store(config: RedisConfig, connector: Arc<dyn CacheConnector>) -> Result<RedisStore, StorageError> {
        Ok(OverlayStore::new(Self::with_connector(config, connector)?))
    }

    fn key(&self, id: AccountId) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }

    fn with_conn<T>(
        &self,
        context: &str,
        f: impl FnOnce(&mut dyn CacheConnection) -> redis::RedisResult<T>,
    ) -> Result<T, StorageError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        f(conn.as_mut()).map_err(|e| StorageError::backend(context, e))
    }
}

/// Escapes glob metacharacters so a prefix only matches itself in `SCAN MATCH`.
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn decode_account(key: &str, value: &str) -> Result<Account, StorageError> {
    serde_json::from_str(value).map_err(|e| StorageError::backend(format!("failed to decode {}", key), e))
}

impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn guarantee(&self) -> CommitGuarantee {
        CommitGuarantee::BestEffort
    }

    fn open(&mut self) -> Result<(), StorageError> {
        let mut conn = self
            .connector
            .connect(&self.config)
            .map_err(|e| StorageError::backend(format!("failed to connect to {}", self.config.address), e))?;
        conn.ping().map_err(|e| StorageError::backend("ping failed", e))?;
        *self.conn.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        tracing::debug!(address = %self.config.address, db = self.config.db, "Connected to cache");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.conn.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        let key = self.key(id);
        let value = self.with_conn("failed to get account", |conn| conn.get(&key))?;
        value.map(|v| decode_account(&key, &v)).transpose()
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        let prefix = &self.config.key_prefix;
        let pattern = format!("{}*", escape_glob(prefix));
        let (keys, values) = self.with_conn("failed to list accounts", |conn| {
            // Other keys may share the prefix; only `prefix + u64` is an account.
            let keys: Vec<String> = conn
                .keys(&pattern)?
                .into_iter()
                .filter(|key| key.strip_prefix(prefix.as_str()).is_some_and(|id| id.parse::<AccountId>().is_ok()))
                .collect();
            let values = conn.mget(&keys)?;
            Ok((keys, values))
        })?;

        let mut accounts = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            // Deleted between SCAN and MGET.
            if let Some(value) = value {
                accounts.push(decode_account(key, &value)?);
            }
        }
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }

    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        let entries = changes
            .iter()
            .map(|change| {
                serde_json::to_string(&Account::new(change.id, change.balance))
                    .map(|value| (self.key(change.id), value))
                    .map_err(|e| StorageError::backend("failed to encode account", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        conn.set_pipelined(&entries).map_err(|e| StorageError::PartialCommit {
            backend: "redis",
            applied: None,
            total: entries.len(),
            message: e.to_string(),
        })?;
        tracing::trace!(changes = entries.len(), "Cache pipeline applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchbank_core::AccountStore;

    fn memory_store(cache: &MemoryCache) -> RedisStore {
        RedisBackend::store(RedisConfig::new("cache.test:6379"), Arc::new(cache.clone())).unwrap()
    }

    batchbank_core::account_store_contract_tests!(contract, memory_store(&MemoryCache::new()));

    #[test]
    fn test_values_are_json_under_prefixed_keys() {
        let cache = MemoryCache::new();
        let store = memory_store(&cache);
        store.initialize().unwrap();
        store.create_account(42, 7).unwrap();

        let raw = cache.raw_get("account:42").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"id": 42, "balance": 7}));
    }

    #[test]
    fn test_custom_prefix_ignores_foreign_keys() {
        let cache = MemoryCache::new();
        cache.raw_set("other:1", "not json");
        let mut config = RedisConfig::new("cache.test:6379");
        config.key_prefix = "bank:".to_string();
        let store = RedisBackend::store(config, Arc::new(cache.clone())).unwrap();
        store.initialize().unwrap();
        store.create_account(2, 5).unwrap();
        store.create_account(1, 3).unwrap();

        let ids: Vec<u64> = store.get_all_accounts().unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_non_account_keys_under_prefix_are_skipped() {
        let cache = MemoryCache::new();
        cache.raw_set("account:meta", "not json");
        cache.raw_set("account:", "{}");
        cache.raw_set("account:-3", "{}");
        let store = memory_store(&cache);
        store.initialize().unwrap();
        store.create_account(4, 40).unwrap();

        let view: Vec<(u64, i64)> = store.get_all_accounts().unwrap().iter().map(|a| (a.id, a.balance)).collect();
        assert_eq!(view, vec![(4, 40)]);
    }

    #[test]
    fn test_prefix_glob_characters_are_literal() {
        assert_eq!(escape_glob("bank[*]?:"), r"bank\[\*\]\?:");
        assert_eq!(escape_glob(r"a\b"), r"a\\b");

        let cache = MemoryCache::new();
        cache.raw_set("bankX:9", "not json");
        let mut config = RedisConfig::new("cache.test:6379");
        config.key_prefix = "bank*:".to_string();
        let store = RedisBackend::store(config, Arc::new(cache.clone())).unwrap();
        store.initialize().unwrap();
        store.create_account(1, 3).unwrap();

        let ids: Vec<u64> = store.get_all_accounts().unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1]);
        assert!(cache.raw_get("bank*:1").is_some());
    }

    #[test]
    fn test_interrupted_pipeline_reports_partial_commit() {
        let cache = MemoryCache::new();
        let store = memory_store(&cache);
        store.initialize().unwrap();
        store.create_account(1, 100).unwrap();
        store.create_account(2, 0).unwrap();
        store.create_account(3, 0).unwrap();
        assert_eq!(store.commit_guarantee(), CommitGuarantee::BestEffort);

        store.begin_transaction().unwrap();
        store.update_balance(1, -30).unwrap();
        store.update_balance(2, 20).unwrap();
        store.update_balance(3, 10).unwrap();
        cache.fail_pipeline_after(1);

        let err = store.commit().unwrap_err();
        assert!(matches!(err, StorageError::PartialCommit { backend: "redis", applied: None, total: 3, .. }));
        assert!(!store.in_transaction());

        // The first write landed and is not undone.
        assert_eq!(store.get_balance(1).unwrap(), 70);
        assert_eq!(store.get_balance(2).unwrap(), 0);
        assert_eq!(store.get_balance(3).unwrap(), 0);
    }

    #[test]
    fn test_unreachable_server_fails_initialize() {
        let cache = MemoryCache::new();
        cache.set_unreachable(true);
        let store = memory_store(&cache);
        assert!(store.initialize().unwrap_err().is_backend());
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_config_defaults() {
        let config: RedisConfig = serde_json::from_str(r#"{"address": "localhost:6379"}"#).unwrap();
        assert_eq!(config.key_prefix, "account:");
        assert_eq!(config.db, 0);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            RedisBackend::new(RedisConfig::new("")),
            Err(StorageError::InvalidConfiguration(_))
        ));
    }
}
