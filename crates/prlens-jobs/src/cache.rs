//! Expiring key/value storage for serialized analysis results.
//!
//! Two backends: a process-local map and a SQLite file that several processes
//! can share. Entries are immutable once written; a re-run simply overwrites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prlens_core::{CacheBackend, CacheConfig, CacheKey, PrLensError};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Atomic get / set-with-expiry over opaque bytes.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name for logs and health reports.
    fn backend_name(&self) -> &'static str;

    /// Fetch a live entry. Expired entries read as absent.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, PrLensError>;

    /// Store `value` under `key` for `ttl_secs` seconds, replacing any previous entry.
    async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), PrLensError>;
}

/// Build the store selected by `config.backend`.
///
/// # Errors
///
/// Returns [`PrLensError::Database`] if the SQLite file cannot be opened.
pub fn open_cache(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, PrLensError> {
    Ok(match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Sqlite => Arc::new(SqliteCache::open(&config.path)?),
    })
}

/// In-process cache. Contents are lost when the process exits.
///
/// # Examples
///
/// ```
/// use prlens_core::CacheKey;
/// use prlens_jobs::cache::{CacheStore, MemoryCache};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let cache = MemoryCache::new();
/// let key = CacheKey::new("prreview", "https://github.com/o/r", 1, Some("abc"));
/// cache.set_with_ttl(&key, b"{}".to_vec(), 60).await.unwrap();
/// assert_eq!(cache.get(&key).await.unwrap(), Some(b"{}".to_vec()));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: tokio::sync::Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

fn live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|at| now < at)
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, PrLensError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key.as_str()) {
            Some((value, expires_at)) if live(*expires_at, Instant::now()) => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key.as_str());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), PrLensError> {
        // `None` when the TTL is too large to represent: the entry never expires.
        let expires_at = Instant::now().checked_add(Duration::from_secs(ttl_secs));
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (_, at)| live(*at, now));
        entries.insert(key.as_str().to_string(), (value, expires_at));
        Ok(())
    }
}

/// SQLite-backed cache. Expiry is stored as a unix timestamp per row.
///
/// # Examples
///
/// ```
/// use prlens_jobs::cache::SqliteCache;
///
/// let cache = SqliteCache::in_memory().unwrap();
/// # drop(cache);
/// ```
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    /// Open or create a cache database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Database`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, PrLensError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PrLensError::Database(format!("failed to create cache directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| PrLensError::Database(format!("failed to open cache database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Create a cache that lives only as long as this value (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Database`] if schema creation fails.
    pub fn in_memory() -> Result<Self, PrLensError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            PrLensError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, PrLensError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS cache_entries_expiry ON cache_entries(expires_at);
            ",
        )
        .map_err(|e| PrLensError::Database(format!("failed to create schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on a blocking thread.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, PrLensError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PrLensError::Cache("cache connection lock poisoned".into()))?;
            f(&guard).map_err(|e| PrLensError::Database(e.to_string()))
        })
        .await
        .map_err(|e| PrLensError::Cache(format!("cache task failed: {e}")))?
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, PrLensError> {
        let key = key.as_str().to_string();
        let now = chrono::Utc::now().timestamp();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
        .await
    }

    async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), PrLensError> {
        let key = key.as_str().to_string();
        let now = chrono::Utc::now().timestamp();
        let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        let purged = self
            .with_conn(move |conn| {
                let purged =
                    conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])?;
                conn.execute(
                    "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, value, expires_at],
                )?;
                Ok(purged)
            })
            .await?;
        if purged > 0 {
            debug!(purged, "expired cache entries removed");
        }
        Ok(())
    }
}
