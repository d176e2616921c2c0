//! Retrieval session lifecycle
//!
//! A session moves `Pending -> Active -> Verified -> Deactivated`. Its
//! working directory exists only while it is Active or Verified, and the
//! activity entry `processing:<session_id>` is written before the directory
//! is created, so a live directory always has a live entry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache_store::{CacheError, CacheStore};
use crate::catalog::ContentRecord;

/// Default lifetime of one activation
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid file name {0:?}")]
    InvalidName(String),

    #[error("Duplicate file name {0:?} in one session")]
    DuplicateName(String),

    #[error("Session {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current Unix time in whole seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session id as found in an activity key or directory name
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Verified,
    Deactivated,
}

/// One retrieval operation over a fixed, ordered set of records
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    owner_id: String,
    working_dir: PathBuf,
    records: Vec<ContentRecord>,
    state: SessionState,
    cancel: CancellationToken,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn records(&self) -> &[ContentRecord] {
        &self.records
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cancelled when the session is deactivated, including from outside
    /// the task driving it
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.working_dir.join(manifest_file_name(self.id))
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        use SessionState::*;
        let allowed = matches!(
            (self.state, to),
            (Pending, Active) | (Active, Verified) | (_, Deactivated)
        );
        if !allowed {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

pub fn manifest_file_name(id: SessionId) -> String {
    format!("{}.manifest.json", id)
}

fn validate_name(name: &str) -> Result<(), SessionError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SessionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Owns session identifiers, working-directory allocation and the activity
/// markers in the cache store
pub struct SessionCoordinator {
    cache: Arc<dyn CacheStore>,
    work_root: PathBuf,
    ttl: Duration,
    open: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl SessionCoordinator {
    pub fn new(cache: Arc<dyn CacheStore>, work_root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            cache,
            work_root: work_root.into(),
            ttl,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for an activation starting now
    fn next_expiry(&self) -> u64 {
        let secs = self.ttl.as_secs() + u64::from(self.ttl.subsec_nanos() > 0);
        unix_now() + secs.max(1)
    }

    /// Create a Pending session with a fresh id and a reserved working
    /// directory path. Nothing is written yet.
    pub fn open(&self, owner_id: &str, records: Vec<ContentRecord>) -> Result<Session, SessionError> {
        let mut names = HashSet::new();
        for record in &records {
            validate_name(&record.display_name)?;
            if !names.insert(record.display_name.as_str()) {
                return Err(SessionError::DuplicateName(record.display_name.clone()));
            }
        }

        let cancel = CancellationToken::new();
        let id = {
            let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
            let id = loop {
                let id = SessionId::generate();
                if !open.contains_key(&id) {
                    break id;
                }
            };
            if names.contains(manifest_file_name(id).as_str()) {
                return Err(SessionError::InvalidName(manifest_file_name(id)));
            }
            open.insert(id, cancel.clone());
            id
        };

        debug!(session_id = %id, owner_id, records = records.len(), "Opened session");

        Ok(Session {
            id,
            owner_id: owner_id.to_string(),
            working_dir: self.work_root.join(id.to_string()),
            records,
            state: SessionState::Pending,
            cancel,
        })
    }

    /// Write or refresh the activity entry; on first activation also create
    /// the working directory
    pub async fn activate(&self, session: &mut Session) -> Result<(), SessionError> {
        let expiry = self.next_expiry();
        match session.state {
            SessionState::Pending => {
                self.cache.set_activity(&session.id.to_string(), expiry).await?;
                tokio::fs::create_dir_all(&self.work_root).await?;
                // create_dir, not create_dir_all: the leaf must be new
                tokio::fs::create_dir(&session.working_dir).await?;
                session.transition(SessionState::Active)?;
                info!(
                    session_id = %session.id,
                    owner_id = %session.owner_id,
                    expiry,
                    "Activated session"
                );
            }
            SessionState::Active | SessionState::Verified => {
                self.cache.set_activity(&session.id.to_string(), expiry).await?;
                debug!(session_id = %session.id, expiry, "Refreshed session activity");
            }
            SessionState::Deactivated => {
                return Err(SessionError::InvalidTransition {
                    id: session.id,
                    from: session.state,
                    to: SessionState::Active,
                });
            }
        }
        Ok(())
    }

    pub fn mark_verified(&self, session: &mut Session) -> Result<(), SessionError> {
        session.transition(SessionState::Verified)
    }

    /// Keep the activity entry fresh every TTL/2 until stopped or the
    /// session is deactivated
    pub fn heartbeat(&self, session: &Session) -> Heartbeat {
        let cancel = session.cancel.child_token();
        let cache = Arc::clone(&self.cache);
        let session_id = session.id.to_string();
        let ttl = self.ttl;
        let period = (ttl / 2).max(Duration::from_millis(10));
        let expiry_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expiry = unix_now() + expiry_secs.max(1);
                        if let Err(e) = cache.set_activity(&session_id, expiry).await {
                            warn!(session_id = %session_id, "Failed to refresh session activity: {}", e);
                        }
                    }
                }
            }
        });

        Heartbeat {
            cancel,
            handle: Some(handle),
        }
    }

    /// Remove the working directory. Failures are logged, never returned;
    /// the reaper retries later.
    pub async fn cleanup(&self, session: &Session) -> bool {
        match tokio::fs::remove_dir_all(&session.working_dir).await {
            Ok(()) => {
                debug!(session_id = %session.id, "Removed working directory");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(
                    session_id = %session.id,
                    path = ?session.working_dir,
                    "Failed to remove working directory: {}",
                    e
                );
                false
            }
        }
    }

    /// Remove the activity entry and stop any work bound to the session.
    /// Idempotent.
    pub async fn deactivate(&self, session: &mut Session) -> Result<(), SessionError> {
        session.cancel.cancel();
        self.cache.delete_activity(&session.id.to_string()).await?;
        if session.state != SessionState::Deactivated {
            session.transition(SessionState::Deactivated)?;
            info!(session_id = %session.id, owner_id = %session.owner_id, "Deactivated session");
        }
        Ok(())
    }

    /// Deactivate a session owned by another task. Its retrieval or
    /// verification stops at the next suspend point.
    pub async fn deactivate_by_id(&self, id: SessionId) -> Result<(), SessionError> {
        let token = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
        self.cache.delete_activity(&id.to_string()).await?;
        info!(session_id = %id, "Deactivated session externally");
        Ok(())
    }

    /// Release the coordinator's handle. Does not touch the directory.
    pub fn close(&self, session: Session) {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id);
        debug!(session_id = %session.id, state = ?session.state, "Closed session");
    }

    pub fn open_sessions(&self) -> usize {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Background refresher of one session's activity entry. Dropping it stops
/// the refresher.
pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Stop and wait until no further refresh can be written
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task failed: {}", e);
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;

    fn record(id: u64, name: &str) -> ContentRecord {
        ContentRecord {
            id,
            owner_id: "U1".to_string(),
            content_address: format!("cid{}", id),
            display_name: name.to_string(),
            size_bytes: 1,
            content_type: String::new(),
            upload_timestamp: 0,
        }
    }

    fn coordinator(ttl: Duration) -> (tempfile::TempDir, Arc<MemoryCacheStore>, SessionCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCacheStore::new());
        let coordinator = SessionCoordinator::new(cache.clone(), dir.path().join("work"), ttl);
        (dir, cache, coordinator)
    }

    #[tokio::test]
    async fn test_open_is_pending_without_directory() {
        let (_dir, cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);
        let session = coordinator.open("U1", vec![record(1, "a.txt")]).unwrap();

        assert_eq!(session.state(), SessionState::Pending);
        assert!(!session.working_dir().exists());
        assert!(cache.scan_activity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_bad_names() {
        let (_dir, _cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);

        for name in ["", ".", "..", "../escape", "dir/file", "a\\b"] {
            assert!(matches!(
                coordinator.open("U1", vec![record(1, name)]),
                Err(SessionError::InvalidName(_))
            ));
        }
        assert!(matches!(
            coordinator.open("U1", vec![record(1, "a"), record(2, "a")]),
            Err(SessionError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_writes_entry_then_directory() {
        let (_dir, cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);
        let mut session = coordinator.open("U1", vec![]).unwrap();
        let before = unix_now();

        coordinator.activate(&mut session).await.unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.working_dir().is_dir());
        let expiry = cache
            .get_activity(&session.id().to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(expiry >= before + 30 && expiry <= unix_now() + 30);

        // Re-activation refreshes without touching the directory
        coordinator.activate(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (_dir, cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);
        let mut session = coordinator.open("U1", vec![record(1, "a.txt")]).unwrap();
        let id = session.id().to_string();

        assert!(coordinator.mark_verified(&mut session).is_err());

        coordinator.activate(&mut session).await.unwrap();
        coordinator.mark_verified(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Verified);

        assert!(coordinator.cleanup(&session).await);
        assert!(!session.working_dir().exists());

        coordinator.deactivate(&mut session).await.unwrap();
        coordinator.deactivate(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Deactivated);
        assert!(session.cancel_token().is_cancelled());
        assert!(cache.get_activity(&id).await.unwrap().is_none());

        assert!(coordinator.activate(&mut session).await.is_err());

        assert_eq!(coordinator.open_sessions(), 1);
        coordinator.close(session);
        assert_eq!(coordinator.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_and_directories() {
        let (_dir, _cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);
        let a = coordinator.open("U1", vec![]).unwrap();
        let b = coordinator.open("U1", vec![]).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.working_dir(), b.working_dir());
    }

    #[tokio::test]
    async fn test_closed_sessions_leave_no_state() {
        let (_dir, _cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);

        for _ in 0..1_000 {
            let session = coordinator.open("U1", vec![record(1, "a.txt")]).unwrap();
            coordinator.close(session);
        }

        assert_eq!(coordinator.open_sessions(), 0);
        assert!(coordinator.open.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_by_id_cancels_session() {
        let (_dir, cache, coordinator) = coordinator(DEFAULT_SESSION_TTL);
        let mut session = coordinator.open("U1", vec![]).unwrap();
        coordinator.activate(&mut session).await.unwrap();

        coordinator.deactivate_by_id(session.id()).await.unwrap();

        assert!(session.cancel_token().is_cancelled());
        assert!(cache
            .get_activity(&session.id().to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_entry() {
        let (_dir, cache, coordinator) = coordinator(Duration::from_millis(200));
        let mut session = coordinator.open("U1", vec![]).unwrap();
        coordinator.activate(&mut session).await.unwrap();
        let id = session.id().to_string();

        let heartbeat = coordinator.heartbeat(&session);
        cache.delete_activity(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(cache.get_activity(&id).await.unwrap().is_some());

        heartbeat.stop().await;
        cache.delete_activity(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.get_activity(&id).await.unwrap().is_none());
    }
}
