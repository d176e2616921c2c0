//! Session orchestration
//!
//! `SyncEngine` drives one session through the whole pipeline:
//! locate records, open and activate a session, retrieve, verify, package
//! and publish the owner's listing, then clean up and deactivate. Any
//! failure leaves the previously cached listing untouched.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache_store::{CacheError, CacheStore};
use crate::catalog::{ContentLocator, ContentRecord, LocatorError};
use crate::content_store::ContentStore;
use crate::manifest::Manifest;
use crate::metrics::Metrics;
use crate::packager::{self, ListingPayload, PackageError};
use crate::reaper::Reaper;
use crate::retriever::{RetrieveError, Retriever, DEFAULT_FETCH_WORKERS};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionCoordinator, SessionError, SessionId, DEFAULT_SESSION_TTL};
use crate::verifier::{self, IntegrityError, Mismatch, DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Retrieval failed: {0}")]
    Retrieve(#[from] RetrieveError),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Packaging failed: {0}")]
    Package(#[from] PackageError),

    #[error("Cache store error: {0}")]
    Cache(#[from] CacheError),

    #[error("Record {record_id} not found for owner {owner_id}")]
    RecordNotFound { owner_id: String, record_id: u64 },
}

/// Tunables of one engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub work_root: PathBuf,
    pub session_ttl: Duration,
    pub fetch_workers: usize,
    pub fetch_policy: RetryPolicy,
    pub verify_policy: RetryPolicy,
}

impl EngineSettings {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            session_ttl: DEFAULT_SESSION_TTL,
            fetch_workers: DEFAULT_FETCH_WORKERS,
            fetch_policy: RetryPolicy::default(),
            verify_policy: RetryPolicy::fixed(DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL),
        }
    }
}

/// Summary of a session that published a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub session_id: SessionId,
    pub files: usize,
    pub bytes: u64,
}

/// Checksum comparison of a freshly retrieved file against the cached copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditResult {
    pub record_id: u64,
    pub file_name: String,
    /// Hex sha-256 of the retrieved bytes
    pub checksum: String,
    /// Whether the owner's cached listing holds identical bytes
    pub matches: bool,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct SyncEngine {
    locator: Arc<dyn ContentLocator>,
    cache: Arc<dyn CacheStore>,
    coordinator: SessionCoordinator,
    retriever: Retriever,
    verify_policy: RetryPolicy,
    metrics: Metrics,
}

impl SyncEngine {
    pub fn new(
        locator: Arc<dyn ContentLocator>,
        store: Arc<dyn ContentStore>,
        cache: Arc<dyn CacheStore>,
        settings: EngineSettings,
        metrics: Metrics,
    ) -> Self {
        let coordinator =
            SessionCoordinator::new(Arc::clone(&cache), settings.work_root, settings.session_ttl);
        let retriever = Retriever::new(
            store,
            settings.fetch_workers,
            settings.fetch_policy,
            metrics.clone(),
        );

        Self {
            locator,
            cache,
            coordinator,
            retriever,
            verify_policy: settings.verify_policy,
            metrics,
        }
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// A reaper over the same cache and work root. Directories without an
    /// activity entry are treated as orphans once older than the session TTL.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.cache),
            self.coordinator.work_root(),
            self.coordinator.ttl(),
            self.metrics.clone(),
        )
    }

    /// Stage every record of `owner_id`
    pub async fn sync_owner(&self, owner_id: &str) -> Result<SyncOutcome, SyncError> {
        let total = self.locator.total_bytes(owner_id).await?;
        let records = self.locator.records_for_owner(owner_id).await?;
        info!(owner_id, records = records.len(), total_bytes = total, "Starting owner sync");
        self.run_session(owner_id, records).await
    }

    /// Stage only the given records of `owner_id`, in the given order
    pub async fn sync_records(&self, owner_id: &str, ids: &[u64]) -> Result<SyncOutcome, SyncError> {
        let records = self.resolve(owner_id, ids).await?;
        let total: u64 = records.iter().map(|r| r.size_bytes).sum();
        info!(owner_id, records = records.len(), total_bytes = total, "Starting selective sync");
        self.run_session(owner_id, records).await
    }

    /// Spawn `sync_owner` on the runtime
    pub fn dispatch(self: &Arc<Self>, owner_id: impl Into<String>) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let engine = Arc::clone(self);
        let owner_id = owner_id.into();
        tokio::spawn(async move { engine.sync_owner(&owner_id).await })
    }

    async fn resolve(&self, owner_id: &str, ids: &[u64]) -> Result<Vec<ContentRecord>, SyncError> {
        let mut records = Vec::with_capacity(ids.len());
        for &record_id in ids {
            match self.locator.record_by_id(owner_id, record_id).await? {
                Some(record) => records.push(record),
                None => {
                    return Err(SyncError::RecordNotFound {
                        owner_id: owner_id.to_string(),
                        record_id,
                    })
                }
            }
        }
        Ok(records)
    }

    /// Run one full session over `records` and publish the owner's listing
    pub async fn run_session(
        &self,
        owner_id: &str,
        records: Vec<ContentRecord>,
    ) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();
        let mut session = self.coordinator.open(owner_id, records)?;
        self.metrics.session_opened();

        let published = self.publish(&mut session).await;
        let result = self.finish(session, published, started).await;

        if let Ok(outcome) = &result {
            info!(
                session_id = %outcome.session_id,
                owner_id,
                files = outcome.files,
                bytes = outcome.bytes,
                "Session published listing"
            );
        }
        result
    }

    async fn publish(&self, session: &mut Session) -> Result<SyncOutcome, SyncError> {
        self.coordinator.activate(session).await?;
        let heartbeat = self.coordinator.heartbeat(session);

        let result = async {
            let manifest = self.retrieve_verified(session).await?;
            let payload = packager::package(session, &manifest).await?;
            self.cache.set_listing(session.owner_id(), &payload).await?;
            self.cache
                .set_file_count(session.owner_id(), manifest.len() as u64)
                .await?;
            Ok::<_, SyncError>(SyncOutcome {
                session_id: session.id(),
                files: manifest.len(),
                bytes: manifest.total_bytes(),
            })
        }
        .await;

        heartbeat.stop().await;
        result
    }

    async fn retrieve_verified(&self, session: &mut Session) -> Result<Manifest, SyncError> {
        let manifest = self.retriever.retrieve(session).await?;

        // Every fetch has landed, so a wrong size now can never converge
        let settled = verifier::check(&manifest, session.working_dir())
            .await
            .iter()
            .any(|m| matches!(m, Mismatch::WrongSize { .. }));
        let policy = if settled {
            warn!(session_id = %session.id(), "Retrieved sizes differ from records; verifying once");
            RetryPolicy::fixed(1, Duration::ZERO)
        } else {
            self.verify_policy
        };

        verifier::await_verified(session, policy).await?;
        self.coordinator.mark_verified(session)?;
        Ok(manifest)
    }

    /// Remove the working directory, deactivate and close. The first error
    /// wins; cleanup failures are only counted.
    async fn finish<T>(
        &self,
        mut session: Session,
        result: Result<T, SyncError>,
        started: Instant,
    ) -> Result<T, SyncError> {
        if !self.coordinator.cleanup(&session).await {
            self.metrics.cleanup_failure();
        }
        let deactivated = self.coordinator.deactivate(&mut session).await;
        let session_id = session.id();
        self.coordinator.close(session);

        let result = match (result, deactivated) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.metrics.session_completed(elapsed_ms),
            Err(e) => {
                match e {
                    SyncError::Retrieve(RetrieveError::Download(_)) => self.metrics.download_failure(),
                    SyncError::Integrity(IntegrityError::Timeout { .. }) => {
                        self.metrics.integrity_timeout()
                    }
                    _ => {}
                }
                self.metrics.session_failed(elapsed_ms);
                error!(session_id = %session_id, elapsed_ms, "Session failed: {}", e);
            }
        }
        result
    }

    /// Retrieve fresh copies of the given records in a private session and
    /// compare their sha-256 against the owner's cached listing. The
    /// listing is not modified.
    pub async fn audit_records(&self, owner_id: &str, ids: &[u64]) -> Result<Vec<AuditResult>, SyncError> {
        let records = self.resolve(owner_id, ids).await?;
        let cached = self.cache.get_listing(owner_id).await?;

        let started = Instant::now();
        let mut session = self.coordinator.open(owner_id, records)?;
        self.metrics.session_opened();

        let audited = self.audit(&mut session, cached.as_ref()).await;
        let results = self.finish(session, audited, started).await?;

        let mismatched = results.iter().filter(|r| !r.matches).count();
        if mismatched > 0 {
            warn!(owner_id, mismatched, "Audit found records differing from the cached listing");
        } else {
            info!(owner_id, audited = results.len(), "Audit matched cached listing");
        }
        Ok(results)
    }

    async fn audit(
        &self,
        session: &mut Session,
        cached: Option<&ListingPayload>,
    ) -> Result<Vec<AuditResult>, SyncError> {
        self.coordinator.activate(session).await?;
        let heartbeat = self.coordinator.heartbeat(session);

        let result = async {
            let manifest = self.retrieve_verified(session).await?;
            let mut results = Vec::with_capacity(manifest.len());

            for entry in manifest.entries() {
                let path = session.working_dir().join(&entry.file_name);
                let bytes = tokio::fs::read(&path).await.map_err(|source| PackageError::Io {
                    file_name: entry.file_name.clone(),
                    source,
                })?;
                let checksum = sha256_hex(&bytes);

                let cached_checksum = cached
                    .and_then(|listing| listing.find(entry.record_id))
                    .and_then(|listed| listed.decode().ok())
                    .map(|data| sha256_hex(&data));

                results.push(AuditResult {
                    record_id: entry.record_id,
                    file_name: entry.file_name.clone(),
                    matches: cached_checksum.as_deref() == Some(checksum.as_str()),
                    checksum,
                });
            }
            Ok::<_, SyncError>(results)
        }
        .await;

        heartbeat.stop().await;
        result
    }

    pub async fn cached_listing(&self, owner_id: &str) -> Result<Option<ListingPayload>, SyncError> {
        Ok(self.cache.get_listing(owner_id).await?)
    }

    pub async fn file_count(&self, owner_id: &str) -> Result<u64, SyncError> {
        Ok(self.cache.get_file_count(owner_id).await?)
    }

    pub async fn clear_listing(&self, owner_id: &str) -> Result<(), SyncError> {
        self.cache.clear_listing(owner_id).await?;
        info!(owner_id, "Cleared cached listing");
        Ok(())
    }

    /// Drop one record from the owner's cached listing. Returns whether an
    /// entry was removed.
    pub async fn remove_listing_entry(&self, owner_id: &str, record_id: u64) -> Result<bool, SyncError> {
        let Some(mut listing) = self.cache.get_listing(owner_id).await? else {
            return Ok(false);
        };
        if !listing.remove_record(record_id) {
            return Ok(false);
        }

        self.cache.set_listing(owner_id, &listing).await?;
        self.cache
            .set_file_count(owner_id, listing.entries.len() as u64)
            .await?;
        info!(owner_id, record_id, "Removed record from cached listing");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::catalog::Catalog;
    use crate::content_store::MemoryContentStore;

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

    struct Fixture {
        _dir: tempfile::TempDir,
        work_root: PathBuf,
        store: Arc<MemoryContentStore>,
        cache: Arc<MemoryCacheStore>,
        engine: Arc<SyncEngine>,
    }

    fn fixture(records: Vec<ContentRecord>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_root = dir.path().join("sessions");
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"hello world"[..]);
        store.put_at("cidB", &b"second file"[..]);
        let cache = Arc::new(MemoryCacheStore::new());

        let mut settings = EngineSettings::new(&work_root);
        settings.fetch_policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        settings.verify_policy = RetryPolicy::fixed(3, Duration::from_millis(5));

        let engine = Arc::new(SyncEngine::new(
            Arc::new(Catalog::from_records(records)),
            store.clone(),
            cache.clone(),
            settings,
            Metrics::new(),
        ));

        Fixture {
            _dir: dir,
            work_root,
            store,
            cache,
            engine,
        }
    }

    fn two_records() -> Vec<ContentRecord> {
        vec![record(1, "cidA", "a.txt", 11), record(2, "cidB", "b.txt", 11)]
    }

    #[tokio::test]
    async fn test_sync_owner_publishes_and_cleans_up() {
        let fx = fixture(two_records());

        let outcome = fx.engine.sync_owner("U1").await.unwrap();

        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.bytes, 22);
        let listing = fx.engine.cached_listing("U1").await.unwrap().unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].file_name, "a.txt");
        assert_eq!(fx.engine.file_count("U1").await.unwrap(), 2);

        assert!(!fx.work_root.join(outcome.session_id.to_string()).exists());
        assert!(fx.cache.scan_activity().await.unwrap().is_empty());
        assert_eq!(fx.engine.coordinator().open_sessions(), 0);
        assert_eq!(fx.engine.metrics().sessions_completed(), 1);
    }

    #[tokio::test]
    async fn test_sync_records_selects_and_rejects_unknown() {
        let fx = fixture(two_records());

        let outcome = fx.engine.sync_records("U1", &[2]).await.unwrap();
        assert_eq!(outcome.files, 1);
        let listing = fx.engine.cached_listing("U1").await.unwrap().unwrap();
        assert!(listing.find(2).is_some());
        assert!(listing.find(1).is_none());

        let err = fx.engine.sync_records("U1", &[2, 99]).await.unwrap_err();
        assert!(matches!(err, SyncError::RecordNotFound { record_id: 99, .. }));
    }

    #[tokio::test]
    async fn test_failed_session_keeps_previous_listing() {
        let fx = fixture(vec![record(1, "cidA", "a.txt", 11)]);
        fx.engine.sync_owner("U1").await.unwrap();
        let before = fx.engine.cached_listing("U1").await.unwrap();

        let err = fx
            .engine
            .run_session("U1", vec![record(3, "cidMissing", "m.txt", 4)])
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Retrieve(RetrieveError::Download(_))));
        assert_eq!(fx.engine.cached_listing("U1").await.unwrap(), before);
        assert_eq!(fx.engine.metrics().download_failures(), 1);
        assert_eq!(fx.engine.metrics().sessions_failed(), 1);
        assert!(fx.cache.scan_activity().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(&fx.work_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_an_integrity_timeout() {
        let fx = fixture(vec![record(1, "cidA", "a.txt", 12)]);

        let err = fx.engine.sync_owner("U1").await.unwrap_err();

        assert!(matches!(err, SyncError::Integrity(IntegrityError::Timeout { .. })));
        assert!(fx.engine.cached_listing("U1").await.unwrap().is_none());
        assert_eq!(fx.engine.metrics().integrity_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_without_polling() {
        let fx = fixture(vec![record(1, "cidA", "a.txt", 12)]);
        let engine = SyncEngine::new(
            Arc::new(Catalog::from_records(vec![record(1, "cidA", "a.txt", 12)])),
            fx.store.clone(),
            fx.cache.clone(),
            EngineSettings::new(&fx.work_root),
            Metrics::new(),
        );

        let started = Instant::now();
        let err = engine.sync_owner("U1").await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::Integrity(IntegrityError::Timeout { attempts: 1, .. })
        ));
        assert!(started.elapsed() < DEFAULT_POLL_INTERVAL);
        assert_eq!(std::fs::read_dir(&fx.work_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_audit_compares_against_cached_listing() {
        let fx = fixture(two_records());

        let unaudited = fx.engine.audit_records("U1", &[1]).await.unwrap();
        assert!(!unaudited[0].matches);

        fx.engine.sync_owner("U1").await.unwrap();
        let before = fx.engine.cached_listing("U1").await.unwrap();

        fx.store.put_at("cidB", &b"SECOND FILE"[..]);
        let results = fx.engine.audit_records("U1", &[1, 2]).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record_id, 1);
        assert_eq!(results[0].checksum, sha256_hex(b"hello world"));
        assert!(results[0].matches);
        assert!(!results[1].matches);
        assert_eq!(fx.engine.cached_listing("U1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_listing_entry() {
        let fx = fixture(two_records());
        assert!(!fx.engine.remove_listing_entry("U1", 1).await.unwrap());

        fx.engine.sync_owner("U1").await.unwrap();
        assert!(fx.engine.remove_listing_entry("U1", 1).await.unwrap());
        assert!(!fx.engine.remove_listing_entry("U1", 1).await.unwrap());

        let listing = fx.engine.cached_listing("U1").await.unwrap().unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(fx.engine.file_count("U1").await.unwrap(), 1);

        fx.engine.clear_listing("U1").await.unwrap();
        assert!(fx.engine.cached_listing("U1").await.unwrap().is_none());
        assert_eq!(fx.engine.file_count("U1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_runs_in_background() {
        let fx = fixture(two_records());

        let outcome = fx.engine.dispatch("U1").await.unwrap().unwrap();

        assert_eq!(outcome.files, 2);
        assert!(fx.engine.cached_listing("U1").await.unwrap().is_some());
    }
}
