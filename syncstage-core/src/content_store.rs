//! Content-addressed store client interface
//!
//! Retrieval is `fetch(address) -> bytes`, insertion is
//! `insert(bytes) -> address`, and `list_links` exposes the store's
//! structured listing for derived-hash lookups. Backends live in
//! [`crate::kubo`] and [`crate::block_store`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::block_store::content_address;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Content store unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid content address: {0}")]
    InvalidAddress(String),

    #[error("Unexpected store response: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether another attempt could succeed. Absent content never appears
    /// by retrying, so only transport failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Io(_))
    }
}

/// One entry of a `list_links` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub address: String,
    pub size: u64,
    pub name: String,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch(&self, address: &str) -> Result<Bytes, StoreError>;

    async fn insert(&self, data: Bytes) -> Result<String, StoreError>;

    async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError>;
}

/// In-memory store with fault injection, for tests and benchmarks
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    /// Remaining number of `Unreachable` failures to report per address
    faults: Mutex<HashMap<String, u32>>,
    fetches: Mutex<HashMap<String, u32>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under a caller-chosen address
    pub fn put_at(&self, address: &str, data: impl Into<Bytes>) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string(), data.into());
    }

    /// Make the next `times` fetches of `address` fail as unreachable
    pub fn fail_next(&self, address: &str, times: u32) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string(), times);
    }

    /// Number of fetch attempts seen for `address`
    pub fn fetch_count(&self, address: &str) -> u32 {
        self.fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn fetch(&self, address: &str) -> Result<Bytes, StoreError> {
        *self
            .fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_default() += 1;

        {
            let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = faults.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    trace!(address, remaining = *remaining, "Injected fetch failure");
                    return Err(StoreError::Unreachable(format!(
                        "injected failure for {}",
                        address
                    )));
                }
            }
        }

        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(address.to_string()))
    }

    async fn insert(&self, data: Bytes) -> Result<String, StoreError> {
        let address = content_address(&data)?.to_string();
        self.put_at(&address, data);
        Ok(address)
    }

    async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        match blobs.get(address) {
            Some(_) => Ok(Vec::new()),
            None => Err(StoreError::NotFound(address.to_string())),
        }
    }
}
