//! Session cache store
//!
//! Two logically separate namespaces share one store handle:
//! - the file-listing cache (owner -> packaged listing payload, plus the
//!   owner's staged file count)
//! - the session-activity cache (`processing:<session_id>` -> expiry, Unix
//!   seconds)
//!
//! Every operation touches a single key; there are no cross-key
//! transactions. Writes to one owner's listing are last-writer-wins.

use async_trait::async_trait;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::packager::ListingPayload;

/// Key prefix of session-activity entries
pub const ACTIVITY_PREFIX: &str = "processing:";

const LISTING_CF: &str = "listing";
const COUNT_CF: &str = "counts";
const ACTIVITY_CF: &str = "activity";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Corrupt(e.to_string())
    }
}

/// Activity-cache key for a session
pub fn activity_key(session_id: &str) -> String {
    format!("{}{}", ACTIVITY_PREFIX, session_id)
}

fn parse_expiry(key: &str, raw: &[u8]) -> Result<u64, CacheError> {
    let text = std::str::from_utf8(raw).map_err(|e| CacheError::Corrupt(format!("{}: {}", key, e)))?;
    // Older writers stored fractional seconds
    text.trim()
        .parse::<f64>()
        .map(|v| v as u64)
        .map_err(|e| CacheError::Corrupt(format!("{}: {}", key, e)))
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Replace the owner's listing wholesale
    async fn set_listing(&self, owner_id: &str, payload: &ListingPayload) -> Result<(), CacheError>;

    async fn get_listing(&self, owner_id: &str) -> Result<Option<ListingPayload>, CacheError>;

    /// Remove the owner's listing and file count
    async fn clear_listing(&self, owner_id: &str) -> Result<(), CacheError>;

    async fn set_file_count(&self, owner_id: &str, count: u64) -> Result<(), CacheError>;

    /// Number of files staged by the owner's last session, 0 when unknown
    async fn get_file_count(&self, owner_id: &str) -> Result<u64, CacheError>;

    async fn set_activity(&self, session_id: &str, expiry_ts: u64) -> Result<(), CacheError>;

    async fn get_activity(&self, session_id: &str) -> Result<Option<u64>, CacheError>;

    /// Removing an absent entry is not an error
    async fn delete_activity(&self, session_id: &str) -> Result<(), CacheError>;

    /// All activity entries as `(session_id, expiry_ts)`
    async fn scan_activity(&self) -> Result<Vec<(String, u64)>, CacheError>;

    /// Release the handle. Later calls fail with `Unavailable`.
    async fn close(&self);
}

/// RocksDB-backed cache store, one column family per namespace
pub struct RocksCacheStore {
    db: Arc<DB>,
    closed: AtomicBool,
}

impl RocksCacheStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);

        let db = DB::open_cf(&opts, path.as_ref(), [LISTING_CF, COUNT_CF, ACTIVITY_CF])?;

        info!("Opened session cache store at {:?}", path.as_ref());
        Ok(Self {
            db: Arc::new(db),
            closed: AtomicBool::new(false),
        })
    }

    fn db(&self) -> Result<Arc<DB>, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("cache store is closed".to_string()));
        }
        Ok(Arc::clone(&self.db))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T, CacheError> + Send + 'static,
    {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?
    }
}

fn column<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, CacheError> {
    db.cf_handle(name)
        .ok_or_else(|| CacheError::Unavailable(format!("missing column family {}", name)))
}

#[async_trait]
impl CacheStore for RocksCacheStore {
    async fn set_listing(&self, owner_id: &str, payload: &ListingPayload) -> Result<(), CacheError> {
        let value = serde_json::to_vec(payload)?;
        let key = owner_id.to_string();
        let size = value.len();

        self.blocking(move |db| Ok(db.put_cf(column(db, LISTING_CF)?, key.as_bytes(), value)?))
            .await?;

        debug!(owner_id, bytes = size, "Wrote file listing");
        Ok(())
    }

    async fn get_listing(&self, owner_id: &str) -> Result<Option<ListingPayload>, CacheError> {
        let key = owner_id.to_string();
        let raw = self
            .blocking(move |db| Ok(db.get_cf(column(db, LISTING_CF)?, key.as_bytes())?))
            .await?;

        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from))
            .transpose()
    }

    async fn clear_listing(&self, owner_id: &str) -> Result<(), CacheError> {
        let key = owner_id.to_string();
        self.blocking(move |db| {
            let mut batch = WriteBatch::default();
            batch.delete_cf(column(db, LISTING_CF)?, key.as_bytes());
            batch.delete_cf(column(db, COUNT_CF)?, key.as_bytes());
            Ok(db.write(batch)?)
        })
        .await?;

        info!(owner_id, "Cleared file listing");
        Ok(())
    }

    async fn set_file_count(&self, owner_id: &str, count: u64) -> Result<(), CacheError> {
        let key = owner_id.to_string();
        self.blocking(move |db| {
            Ok(db.put_cf(column(db, COUNT_CF)?, key.as_bytes(), count.to_string())?)
        })
        .await
    }

    async fn get_file_count(&self, owner_id: &str) -> Result<u64, CacheError> {
        let key = owner_id.to_string();
        let raw = self
            .blocking(move |db| Ok(db.get_cf(column(db, COUNT_CF)?, key.as_bytes())?))
            .await?;

        match raw {
            None => Ok(0),
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse()
                .map_err(|e| CacheError::Corrupt(format!("file count for {}: {}", owner_id, e))),
        }
    }

    async fn set_activity(&self, session_id: &str, expiry_ts: u64) -> Result<(), CacheError> {
        let key = activity_key(session_id);
        self.blocking(move |db| {
            Ok(db.put_cf(column(db, ACTIVITY_CF)?, key.as_bytes(), expiry_ts.to_string())?)
        })
        .await
    }

    async fn get_activity(&self, session_id: &str) -> Result<Option<u64>, CacheError> {
        let key = activity_key(session_id);
        self.blocking(move |db| {
            db.get_cf(column(db, ACTIVITY_CF)?, key.as_bytes())?
                .map(|raw| parse_expiry(&key, &raw))
                .transpose()
        })
        .await
    }

    async fn delete_activity(&self, session_id: &str) -> Result<(), CacheError> {
        let key = activity_key(session_id);
        self.blocking(move |db| Ok(db.delete_cf(column(db, ACTIVITY_CF)?, key.as_bytes())?))
            .await
    }

    async fn scan_activity(&self) -> Result<Vec<(String, u64)>, CacheError> {
        self.blocking(|db| {
            let cf = column(db, ACTIVITY_CF)?;
            let mut entries = Vec::new();

            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = item?;
                let key = String::from_utf8_lossy(&key).into_owned();
                let Some(session_id) = key.strip_prefix(ACTIVITY_PREFIX) else {
                    continue;
                };
                match parse_expiry(&key, &value) {
                    Ok(expiry) => entries.push((session_id.to_string(), expiry)),
                    // Unparseable expiry reads as already expired
                    Err(e) => {
                        warn!("Treating unreadable activity entry as expired: {}", e);
                        entries.push((session_id.to_string(), 0));
                    }
                }
            }

            Ok(entries)
        })
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let db = Arc::clone(&self.db);
        let flushed = tokio::task::spawn_blocking(move || db.flush()).await;
        if let Ok(Err(e)) = flushed {
            warn!("Failed to flush cache store on close: {}", e);
        }
        info!("Closed session cache store");
    }
}

/// In-memory cache store. Payloads are kept serialized so reads go through
/// the same encoding as the persistent store.
#[derive(Default)]
pub struct MemoryCacheStore {
    listings: Mutex<HashMap<String, Vec<u8>>>,
    counts: Mutex<HashMap<String, u64>>,
    activity: Mutex<HashMap<String, u64>>,
    closed: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Unavailable("cache store is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn set_listing(&self, owner_id: &str, payload: &ListingPayload) -> Result<(), CacheError> {
        self.ensure_open()?;
        let value = serde_json::to_vec(payload)?;
        lock(&self.listings).insert(owner_id.to_string(), value);
        Ok(())
    }

    async fn get_listing(&self, owner_id: &str) -> Result<Option<ListingPayload>, CacheError> {
        self.ensure_open()?;
        let raw = lock(&self.listings).get(owner_id).cloned();
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from))
            .transpose()
    }

    async fn clear_listing(&self, owner_id: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        lock(&self.listings).remove(owner_id);
        lock(&self.counts).remove(owner_id);
        Ok(())
    }

    async fn set_file_count(&self, owner_id: &str, count: u64) -> Result<(), CacheError> {
        self.ensure_open()?;
        lock(&self.counts).insert(owner_id.to_string(), count);
        Ok(())
    }

    async fn get_file_count(&self, owner_id: &str) -> Result<u64, CacheError> {
        self.ensure_open()?;
        Ok(lock(&self.counts).get(owner_id).copied().unwrap_or(0))
    }

    async fn set_activity(&self, session_id: &str, expiry_ts: u64) -> Result<(), CacheError> {
        self.ensure_open()?;
        lock(&self.activity).insert(activity_key(session_id), expiry_ts);
        Ok(())
    }

    async fn get_activity(&self, session_id: &str) -> Result<Option<u64>, CacheError> {
        self.ensure_open()?;
        Ok(lock(&self.activity).get(&activity_key(session_id)).copied())
    }

    async fn delete_activity(&self, session_id: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        lock(&self.activity).remove(&activity_key(session_id));
        Ok(())
    }

    async fn scan_activity(&self) -> Result<Vec<(String, u64)>, CacheError> {
        self.ensure_open()?;
        Ok(lock(&self.activity)
            .iter()
            .filter_map(|(key, expiry)| {
                key.strip_prefix(ACTIVITY_PREFIX)
                    .map(|id| (id.to_string(), *expiry))
            })
            .collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
