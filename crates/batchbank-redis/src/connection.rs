use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use redis::{Commands, IntoConnectionInfo, RedisResult};

use crate::RedisConfig;

/// The handful of cache commands the adapter needs.
pub trait CacheConnection: Send {
    fn ping(&mut self) -> RedisResult<()>;
    fn get(&mut self, key: &str) -> RedisResult<Option<String>>;
    /// Keys matching a glob `pattern`, in no particular order.
    fn keys(&mut self, pattern: &str) -> RedisResult<Vec<String>>;
    fn mget(&mut self, keys: &[String]) -> RedisResult<Vec<Option<String>>>;
    /// Sends every `SET` in one non-transactional pipeline. On error any
    /// subset of the writes may have been applied.
    fn set_pipelined(&mut self, entries: &[(String, String)]) -> RedisResult<()>;
}

pub trait CacheConnector: Send + Sync {
    fn connect(&self, config: &RedisConfig) -> RedisResult<Box<dyn CacheConnection>>;
}

/// Connects to a real server.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl CacheConnector for RedisConnector {
    fn connect(&self, config: &RedisConfig) -> RedisResult<Box<dyn CacheConnection>> {
        let mut info = format!("redis://{}/{}", config.address, config.db).into_connection_info()?;
        info.redis.password = config.password.clone();
        let client = redis::Client::open(info)?;
        let conn = client.get_connection()?;
        Ok(Box::new(RedisConnection { conn }))
    }
}

pub struct RedisConnection {
    conn: redis::Connection,
}

impl CacheConnection for RedisConnection {
    fn ping(&mut self) -> RedisResult<()> {
        redis::cmd("PING").query::<String>(&mut self.conn).map(|_| ())
    }

    fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        self.conn.get(key)
    }

    fn keys(&mut self, pattern: &str) -> RedisResult<Vec<String>> {
        let iter = self.conn.scan_match::<_, String>(pattern)?;
        Ok(iter.collect())
    }

    fn mget(&mut self, keys: &[String]) -> RedisResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("MGET").arg(keys.to_vec()).query(&mut self.conn)
    }

    fn set_pipelined(&mut self, entries: &[(String, String)]) -> RedisResult<()> {
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query(&mut self.conn)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<String, String>,
    fail_after: Option<usize>,
    unreachable: bool,
}

/// An in-process cache with the same command semantics, shared by every
/// clone. Used for tests and local runs without a server.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next pipeline applies only its first `n` writes, then fails.
    pub fn fail_pipeline_after(&self, n: usize) {
        self.state().fail_after = Some(n);
    }

    /// Makes `connect` and `ping` fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn raw_get(&self, key: &str) -> Option<String> {
        self.state().entries.get(key).cloned()
    }

    pub fn raw_set(&self, key: &str, value: &str) {
        self.state().entries.insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> RedisResult<()> {
        if self.state().unreachable {
            return Err((redis::ErrorKind::IoError, "connection refused").into());
        }
        Ok(())
    }
}

/// Literal text optionally followed by one unescaped `*`; enough for prefix scans.
fn glob_match(pattern: &str, key: &str) -> bool {
    let mut literal = String::with_capacity(pattern.len());
    let mut wildcard = false;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.extend(chars.next()),
            '*' if chars.peek().is_none() => wildcard = true,
            c => literal.push(c),
        }
    }
    if wildcard {
        key.starts_with(&literal)
    } else {
        key == literal
    }
}

impl CacheConnection for MemoryCache {
    fn ping(&mut self) -> RedisResult<()> {
        self.check_reachable()
    }

    fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        self.check_reachable()?;
        Ok(self.raw_get(key))
    }

    fn keys(&mut self, pattern: &str) -> RedisResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    fn mget(&mut self, keys: &[String]) -> RedisResult<Vec<Option<String>>> {
        self.check_reachable()?;
        let state = self.state();
        Ok(keys.iter().map(|key| state.entries.get(key).cloned()).collect())
    }

    fn set_pipelined(&mut self, entries: &[(String, String)]) -> RedisResult<()> {
        self.check_reachable()?;
        let mut state = self.state();
        let limit = state.fail_after.take();
        for (written, (key, value)) in entries.iter().enumerate() {
            if limit == Some(written) {
                return Err((redis::ErrorKind::IoError, "connection dropped mid-pipeline").into());
            }
            state.entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

impl CacheConnector for MemoryCache {
    fn connect(&self, _config: &RedisConfig) -> RedisResult<Box<dyn CacheConnection>> {
        self.check_reachable()?;
        Ok(Box::new(self.clone()))
    }
}
