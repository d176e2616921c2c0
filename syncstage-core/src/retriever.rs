//! Concurrent retrieval of a session's records into its working directory
//!
//! Fetches run as a bounded pool (`min(records, workers)` in flight, one per
//! record). Transient store failures are retried under a `RetryPolicy`; the
//! first unrecoverable failure drops every other in-flight fetch of the
//! session and no manifest is written. The manifest is written only after
//! every fetch has landed.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ContentRecord;
use crate::content_store::{ContentStore, StoreError};
use crate::manifest::{Manifest, ManifestError};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::session::Session;

/// Default ceiling on concurrent fetches per session
pub const DEFAULT_FETCH_WORKERS: usize = 8;

#[derive(Debug, Error)]
pub enum DownloadCause {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("writing file: {0}")]
    Write(#[from] std::io::Error),
}

/// A record whose content could not be retrieved
#[derive(Debug, Error)]
#[error("download of record {record_id} failed after {attempts} attempt(s): {cause}")]
pub struct DownloadFailure {
    pub record_id: u64,
    pub attempts: u32,
    #[source]
    pub cause: DownloadCause,
}

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    Download(#[from] DownloadFailure),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Retrieval cancelled")]
    Cancelled,
}

pub struct Retriever {
    store: Arc<dyn ContentStore>,
    workers: usize,
    policy: RetryPolicy,
    metrics: Metrics,
}

impl Retriever {
    pub fn new(store: Arc<dyn ContentStore>, workers: usize, policy: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            store,
            workers: workers.max(1),
            policy,
            metrics,
        }
    }

    /// Fetch every record of `session` into its working directory, then
    /// write the manifest
    pub async fn retrieve(&self, session: &Session) -> Result<Manifest, RetrieveError> {
        let records = session.records();
        let manifest = Manifest::from_records(records)?;
        let limit = records.len().min(self.workers).max(1);
        let cancel = session.cancel_token().child_token();
        let dir = session.working_dir();
        let start = Instant::now();

        debug!(
            session_id = %session.id(),
            records = records.len(),
            workers = limit,
            "Starting retrieval"
        );

        let fetches: Vec<_> = records
            .iter()
            .map(|record| self.fetch_record(record, dir, &cancel))
            .collect();
        let fetched: Result<Vec<u64>, RetrieveError> = stream::iter(fetches)
            .buffer_unordered(limit)
            .try_collect()
            .await;

        let sizes = match fetched {
            Ok(sizes) => sizes,
            Err(e) => {
                // Remaining fetches were dropped with the stream
                cancel.cancel();
                warn!(session_id = %session.id(), "Retrieval aborted: {}", e);
                return Err(e);
            }
        };

        let path = session.manifest_path();
        let to_write = manifest.clone();
        tokio::task::spawn_blocking(move || to_write.write_new(&path))
            .await
            .map_err(|e| ManifestError::Io(std::io::Error::other(e.to_string())))??;

        info!(
            session_id = %session.id(),
            files = sizes.len(),
            bytes = sizes.iter().sum::<u64>(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieved session files"
        );

        Ok(manifest)
    }

    async fn fetch_record(
        &self,
        record: &ContentRecord,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, RetrieveError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                outcome = self.store.fetch(&record.content_address) => outcome,
            };

            match outcome {
                Ok(data) => {
                    if data.len() as u64 != record.size_bytes {
                        warn!(
                            record_id = record.id,
                            expected = record.size_bytes,
                            actual = data.len(),
                            "Fetched size differs from record"
                        );
                    }

                    let path = dir.join(&record.display_name);
                    tokio::fs::write(&path, &data).await.map_err(|e| DownloadFailure {
                        record_id: record.id,
                        attempts: attempt,
                        cause: e.into(),
                    })?;

                    self.metrics.file_retrieved(data.len());
                    debug!(record_id = record.id, file = %record.display_name, bytes = data.len(), "Fetched record");
                    return Ok(data.len() as u64);
                }
                Err(e) if e.is_transient() && self.policy.allows_retry_after(attempt) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        record_id = record.id,
                        address = %record.content_address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying: {}",
                        e
                    );
                    self.metrics.fetch_retry();

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(DownloadFailure {
                        record_id: record.id,
                        attempts: attempt,
                        cause: e.into(),
                    }
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::content_store::{Link, MemoryContentStore};
    use crate::session::SessionCoordinator;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn record(id: u64, address: &str, name: &str, size: u64) -> ContentRecord {
        ContentRecord {
            id,
            owner_id: "U1".to_string(),
            content_address: address.to_string(),
            display_name: name.to_string(),
            size_bytes: size,
            content_type: String::new(),
            upload_timestamp: 0,
        }
    }

    async fn active_session(
        records: Vec<ContentRecord>,
    ) -> (tempfile::TempDir, SessionCoordinator, Session) {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = SessionCoordinator::new(
            Arc::new(MemoryCacheStore::new()),
            dir.path().join("work"),
            Duration::from_secs(30),
        );
        let mut session = coordinator.open("U1", records).unwrap();
        coordinator.activate(&mut session).await.unwrap();
        (dir, coordinator, session)
    }

    fn retriever(store: Arc<dyn ContentStore>, workers: usize) -> Retriever {
        Retriever::new(
            store,
            workers,
            RetryPolicy::fixed(3, Duration::from_millis(10)),
            Metrics::new(),
        )
    }

    /// Delays every fetch and records the peak number in flight
    struct SlowStore {
        inner: MemoryContentStore,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ContentStore for SlowStore {
        async fn fetch(&self, address: &str) -> Result<Bytes, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if address != "cidMissing" {
                tokio::time::sleep(self.delay).await;
            }
            let result = self.inner.fetch(address).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn insert(&self, data: Bytes) -> Result<String, StoreError> {
            self.inner.insert(data).await
        }

        async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError> {
            self.inner.list_links(address).await
        }
    }

    #[tokio::test]
    async fn test_retrieve_writes_files_and_manifest() {
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"hello world"[..]);
        store.put_at("cidB", &b"bye"[..]);

        let (_dir, _coordinator, session) = active_session(vec![
            record(1, "cidA", "a.txt", 11),
            record(2, "cidB", "b.txt", 3),
        ])
        .await;

        let manifest = retriever(store, 4).retrieve(&session).await.unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(std::fs::read(session.working_dir().join("a.txt")).unwrap(), b"hello world");
        assert_eq!(std::fs::read(session.working_dir().join("b.txt")).unwrap(), b"bye");
        assert_eq!(Manifest::read(&session.manifest_path()).unwrap(), manifest);
    }

    #[tokio::test]
    async fn test_not_found_fails_without_retry_or_manifest() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, _coordinator, session) =
            active_session(vec![record(9, "cidMissing", "m.txt", 5)]).await;

        let err = retriever(store.clone(), 4).retrieve(&session).await.unwrap_err();

        match err {
            RetrieveError::Download(failure) => {
                assert_eq!(failure.record_id, 9);
                assert_eq!(failure.attempts, 1);
                assert!(matches!(failure.cause, DownloadCause::Store(StoreError::NotFound(_))));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.fetch_count("cidMissing"), 1);
        assert!(!session.manifest_path().exists());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"abc"[..]);
        store.fail_next("cidA", 2);
        let (_dir, _coordinator, session) = active_session(vec![record(1, "cidA", "a", 3)]).await;

        let metrics = Metrics::new();
        let retriever = Retriever::new(
            store.clone(),
            2,
            RetryPolicy::fixed(3, Duration::from_millis(5)),
            metrics.clone(),
        );
        retriever.retrieve(&session).await.unwrap();

        assert_eq!(store.fetch_count("cidA"), 3);
        assert_eq!(metrics.fetch_retries(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"abc"[..]);
        store.fail_next("cidA", 100);
        let (_dir, _coordinator, session) = active_session(vec![record(1, "cidA", "a", 3)]).await;

        let err = retriever(store.clone(), 2).retrieve(&session).await.unwrap_err();

        assert!(matches!(err, RetrieveError::Download(ref f) if f.attempts == 3));
        assert_eq!(store.fetch_count("cidA"), 3);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let store = Arc::new(SlowStore {
            inner: MemoryContentStore::new(),
            delay: Duration::from_millis(50),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut records = Vec::new();
        for i in 0..10u64 {
            let address = format!("cid{}", i);
            store.inner.put_at(&address, vec![0u8; 4]);
            records.push(record(i, &address, &format!("f{}", i), 4));
        }
        let (_dir, _coordinator, session) = active_session(records).await;

        retriever(store.clone(), 3).retrieve(&session).await.unwrap();

        let peak = store.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight was {}", peak);
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn test_failure_aborts_in_flight_fetches() {
        let store = Arc::new(SlowStore {
            inner: MemoryContentStore::new(),
            delay: Duration::from_secs(30),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        store.inner.put_at("cidSlow", vec![1u8; 8]);
        let (_dir, _coordinator, session) = active_session(vec![
            record(1, "cidSlow", "slow.bin", 8),
            record(2, "cidMissing", "missing.bin", 8),
        ])
        .await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            retriever(store.clone(), 4).retrieve(&session),
        )
        .await
        .expect("retrieval should abort promptly");

        assert!(matches!(result, Err(RetrieveError::Download(ref f)) if f.record_id == 2));
        assert!(!session.working_dir().join("slow.bin").exists());
    }

    #[tokio::test]
    async fn test_deactivation_cancels_retrieval() {
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"abc"[..]);
        store.fail_next("cidA", 100);
        let (_dir, coordinator, session) = active_session(vec![record(1, "cidA", "a", 3)]).await;

        let slow = Retriever::new(
            store,
            1,
            RetryPolicy::fixed(100, Duration::from_secs(10)),
            Metrics::new(),
        );
        let id = session.id();
        let deactivate = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator.deactivate_by_id(id).await.unwrap();
        };

        let (result, _) = tokio::join!(slow.retrieve(&session), deactivate);
        assert!(matches!(result, Err(RetrieveError::Cancelled)));
    }
}
