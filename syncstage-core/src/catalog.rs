//! Content catalog: the read-only view of which files an owner has stored
//!
//! The relational metadata store lives outside this crate. `ContentLocator`
//! is the seam it plugs into; `Catalog` is an in-memory implementation that
//! can be loaded from a JSON export and is used by the CLI and in tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::content_store::{ContentStore, StoreError};

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
}

/// A stored file as recorded by the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: u64,
    pub owner_id: String,
    /// Key of the bytes in the content-addressed store
    pub content_address: String,
    pub display_name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: String,
    /// Unix seconds
    #[serde(default)]
    pub upload_timestamp: u64,
}

/// Read-only queries against the metadata store
#[async_trait]
pub trait ContentLocator: Send + Sync {
    /// All records owned by `owner_id`, in catalog order
    async fn records_for_owner(&self, owner_id: &str) -> Result<Vec<ContentRecord>, LocatorError>;

    /// A single record, if it exists and belongs to `owner_id`
    async fn record_by_id(
        &self,
        owner_id: &str,
        id: u64,
    ) -> Result<Option<ContentRecord>, LocatorError>;

    /// Sum of `size_bytes` over the owner's records
    async fn total_bytes(&self, owner_id: &str) -> Result<u64, LocatorError> {
        let records = self.records_for_owner(owner_id).await?;
        Ok(records.iter().map(|r| r.size_bytes).sum())
    }
}

/// In-memory catalog keyed by owner
#[derive(Default)]
pub struct Catalog {
    records: RwLock<HashMap<String, Vec<ContentRecord>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a flat list of records
    pub fn from_records(records: impl IntoIterator<Item = ContentRecord>) -> Self {
        let catalog = Self::new();
        for record in records {
            catalog.insert(record);
        }
        catalog
    }

    /// Load a JSON array of records. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self, LocatorError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No catalog at {:?}, starting empty", path);
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let records: Vec<ContentRecord> = serde_json::from_str(&content)?;
        info!("Loaded {} content records from {:?}", records.len(), path);
        Ok(Self::from_records(records))
    }

    /// Add a record, replacing any existing record with the same owner and id
    pub fn insert(&self, record: ContentRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let owned = records.entry(record.owner_id.clone()).or_default();
        match owned.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => owned.push(record),
        }
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentLocator for Catalog {
    async fn records_for_owner(&self, owner_id: &str) -> Result<Vec<ContentRecord>, LocatorError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(owner_id).cloned().unwrap_or_default())
    }

    async fn record_by_id(
        &self,
        owner_id: &str,
        id: u64,
    ) -> Result<Option<ContentRecord>, LocatorError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(owner_id)
            .and_then(|owned| owned.iter().find(|r| r.id == id))
            .cloned())
    }
}

/// Content type derived from the file extension
pub fn content_type_for(name: &str) -> String {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Insert `data` into the content store and describe it as a record
pub async fn assemble_record(
    store: &dyn ContentStore,
    owner_id: &str,
    id: u64,
    display_name: &str,
    data: Bytes,
) -> Result<ContentRecord, LocatorError> {
    let size_bytes = data.len() as u64;
    let content_address = store.insert(data).await?;
    let upload_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    debug!(owner_id, id, %content_address, size_bytes, "Assembled content record");

    Ok(ContentRecord {
        id,
        owner_id: owner_id.to_string(),
        content_address,
        display_name: display_name.to_string(),
        size_bytes,
        content_type: content_type_for(display_name),
        upload_timestamp,
    })
}
