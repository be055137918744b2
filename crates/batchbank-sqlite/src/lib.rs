use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use batchbank_core::{Account, AccountId, Backend, Change, CommitGuarantee, OverlayStore, StorageError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

pub type SqliteStore = OverlayStore<SqliteBackend>;

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Database file, or `:memory:` for a private in-memory database.
    pub path: String,
}

pub struct SqliteBackend {
    path: String,
    conn: Mutex<Option<Connection>>,
}

fn sql_error(context: &str) -> impl FnOnce(rusqlite::Error) -> StorageError + '_ {
    move |e| StorageError::backend(context, e)
}

fn sql_id(id: AccountId) -> Result<i64, StorageError> {
    i64::try_from(id).map_err(|_| StorageError::backend("account id out of range", format!("{} exceeds INTEGER", id)))
}

fn read_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let id: i64 = row.get(0)?;
    Ok(Account::new(id as AccountId, row.get(1)?))
}

impl SqliteBackend {
    pub fn new(config: &SqliteConfig) -> Result<Self, StorageError> {
        if config.path.is_empty() {
            return Err(StorageError::InvalidConfiguration("sqlite: path is required".to_string()));
        }
        Ok(Self {
            path: config.path.clone(),
            conn: Mutex::new(None),
        })
    }

    pub fn store(config: &SqliteConfig) -> Result<SqliteStore, StorageError> {
        Ok(OverlayStore::new(Self::new(config)?))
    }

    pub fn in_memory() -> SqliteStore {
        OverlayStore::new(Self {
            path: ":memory:".to_string(),
            conn: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = if self.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&self.path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(&self.path)
        }
        .map_err(sql_error("failed to open database"))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                balance INTEGER NOT NULL
            );
            ",
        )
        .map_err(sql_error("failed to create schema"))?;
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        f(conn)
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn guarantee(&self) -> CommitGuarantee {
        CommitGuarantee::Atomic
    }

    fn open(&mut self) -> Result<(), StorageError> {
        let conn = self.connect()?;
        *self.conn.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = self.conn.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            conn.close().map_err(|(_, e)| StorageError::backend("failed to close database", e))?;
        }
        Ok(())
    }

    fn load(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        let id = sql_id(id)?;
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT id, balance FROM accounts WHERE id = ?1")
                .and_then(|mut stmt| stmt.query_row(params![id], read_account).optional())
                .map_err(sql_error("failed to load account"))
        })
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT id, balance FROM accounts ORDER BY id")
                .map_err(sql_error("failed to prepare query"))?;
            let rows = stmt
                .query_map([], read_account)
                .map_err(sql_error("failed to query accounts"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(sql_error("failed to read account row"))
        })
    }

    fn flush(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(StorageError::NotInitialized)?;

        // Dropping `tx` without commit rolls everything back.
        let tx = conn.transaction().map_err(sql_error("failed to begin transaction"))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO accounts (id, balance) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET balance = excluded.balance",
                )
                .map_err(sql_error("failed to prepare upsert"))?;
            for change in changes {
                stmt.execute(params![sql_id(change.id)?, change.balance])
                    .map_err(sql_error("failed to write account"))?;
            }
        }
        tx.commit().map_err(sql_error("failed to commit transaction"))?;
        tracing::trace!(changes = changes.len(), "SQLite transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchbank_core::AccountStore;
    use tempfile::TempDir;

    batchbank_core::account_store_contract_tests!(contract, SqliteBackend::in_memory());

    #[test]
    fn test_committed_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = SqliteConfig {
            path: dir.path().join("nested").join("accounts.db").to_string_lossy().into_owned(),
        };

        let store = SqliteBackend::store(&config).unwrap();
        store.initialize().unwrap();
        store.create_account(1, 500).unwrap();
        store.begin_transaction().unwrap();
        store.update_balance(1, -200).unwrap();
        store.update_balance(3, 200).unwrap();
        store.commit().unwrap();
        store.close().unwrap();

        let store = SqliteBackend::store(&config).unwrap();
        store.initialize().unwrap();
        let view: Vec<(u64, i64)> = store.get_all_accounts().unwrap().iter().map(|a| (a.id, a.balance)).collect();
        assert_eq!(view, vec![(1, 300), (3, 200)]);
    }

    #[test]
    fn test_ids_beyond_integer_range_are_rejected() {
        let store = SqliteBackend::in_memory();
        store.initialize().unwrap();
        let err = store.create_account(u64::MAX, 1).unwrap_err();
        assert!(err.is_backend());
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let err = SqliteBackend::new(&SqliteConfig { path: String::new() }).err().unwrap();
        assert!(matches!(err, StorageError::InvalidConfiguration(_)));
    }
}
