//! RocksDB-backed local content store
//!
//! Blocks are keyed by CIDv1 (raw codec, sha2-256 multihash), so an address
//! produced here is interchangeable with one produced by a Kubo node for
//! the same single-block content. Used for the `local` backend and in tests.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use multihash::Multihash;
use rocksdb::{Options, DB};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::content_store::{ContentStore, Link, StoreError};

/// sha2-256 multihash code
const SHA256_CODE: u64 = 0x12;

/// Raw binary multicodec
const RAW_CODEC: u64 = 0x55;

/// Compute the CIDv1 address of `data`
pub fn content_address(data: &[u8]) -> Result<Cid, StoreError> {
    let digest = Sha256::digest(data);
    let mh = Multihash::wrap(SHA256_CODE, digest.as_slice())
        .map_err(|e| StoreError::InvalidAddress(format!("cannot wrap digest: {}", e)))?;
    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Check that `data` hashes to `cid`
pub fn verify_address(data: &[u8], cid: &Cid) -> Result<(), StoreError> {
    let computed = content_address(data)?;
    if computed.hash() != cid.hash() {
        return Err(StoreError::Protocol(format!(
            "hash mismatch: expected {}, got {}",
            cid, computed
        )));
    }
    Ok(())
}

fn parse_address(address: &str) -> Result<Cid, StoreError> {
    address
        .parse::<Cid>()
        .map_err(|e| StoreError::InvalidAddress(format!("{}: {}", address, e)))
}

fn db_error(e: rocksdb::Error) -> StoreError {
    StoreError::Unreachable(format!("block database: {}", e))
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(e.to_string()))
}

/// Persistent block storage with CID-based indexing
pub struct LocalBlockStore {
    db: Arc<DB>,
}

impl LocalBlockStore {
    pub fn new_with_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // CID -> block is a pure point lookup
        opts.optimize_for_point_lookup(64);
        opts.set_compression_type(rocksdb::DBCompressionType::None);
        opts.increase_parallelism(num_cpus::get() as i32);

        let db = DB::open(&opts, path.as_ref()).map_err(db_error)?;

        info!("Opened local block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    /// Store a block under its computed address. Idempotent.
    pub async fn put(&self, data: Bytes) -> Result<Cid, StoreError> {
        let cid = content_address(&data)?;
        let db = Arc::clone(&self.db);
        let key = cid.to_string();
        let size = data.len();

        tokio::task::spawn_blocking(move || {
            if db.get_pinned(&key).map_err(db_error)?.is_some() {
                debug!("Block already exists: {}", key);
                return Ok::<(), StoreError>(());
            }
            db.put(&key, &data).map_err(db_error)
        })
        .await
        .map_err(join_error)??;

        debug!("Stored block {}, size: {} bytes", cid, size);
        Ok(cid)
    }

    pub async fn get(&self, cid: &Cid) -> Result<Bytes, StoreError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_string();

        let data = tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(join_error)?
            .map_err(db_error)?
            .ok_or_else(|| StoreError::NotFound(cid.to_string()))?;

        verify_address(&data, cid)?;
        Ok(Bytes::from(data))
    }

    pub async fn has(&self, cid: &Cid) -> bool {
        let db = Arc::clone(&self.db);
        let key = cid.to_string();

        tokio::task::spawn_blocking(move || {
            db.get_pinned(&key).map(|opt| opt.is_some()).unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }

    pub async fn delete(&self, cid: &Cid) -> Result<(), StoreError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_string();

        tokio::task::spawn_blocking(move || {
            if db.get_pinned(&key).map_err(db_error)?.is_none() {
                return Err(StoreError::NotFound(key));
            }
            db.delete(&key).map_err(db_error)
        })
        .await
        .map_err(join_error)??;

        info!("Deleted block {}", cid);
        Ok(())
    }
}

#[async_trait]
impl ContentStore for LocalBlockStore {
    async fn fetch(&self, address: &str) -> Result<Bytes, StoreError> {
        let cid = parse_address(address)?;
        self.get(&cid).await
    }

    async fn insert(&self, data: Bytes) -> Result<String, StoreError> {
        Ok(self.put(data).await?.to_string())
    }

    /// Raw blocks carry no links; the listing is empty for any stored block.
    async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError> {
        let cid = parse_address(address)?;
        if self.has(&cid).await {
            Ok(Vec::new())
        } else {
            Err(StoreError::NotFound(address.to_string()))
        }
    }
}
