//! Integrity verification of a session's working directory
//!
//! A session verifies when every manifest entry names a regular file in the
//! working directory whose byte length equals the recorded size. Polling is
//! bounded by a `RetryPolicy` and stops when the session is deactivated.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::manifest::{Manifest, ManifestEntry};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionId};

/// Default delay between verification polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of verification polls
pub const DEFAULT_MAX_POLLS: u32 = 12;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Session {session_id} did not verify after {attempts} attempt(s)")]
    Timeout { session_id: SessionId, attempts: u32 },

    #[error("Verification of session {0} cancelled")]
    Cancelled(SessionId),
}

/// Why one manifest entry is not satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Missing { file_name: String },
    WrongSize { file_name: String, expected: u64, actual: u64 },
}

async fn check_entry(dir: &Path, entry: &ManifestEntry) -> Option<Mismatch> {
    match tokio::fs::metadata(dir.join(&entry.file_name)).await {
        Ok(meta) if meta.is_file() => {
            if meta.len() == entry.size_bytes {
                None
            } else {
                Some(Mismatch::WrongSize {
                    file_name: entry.file_name.clone(),
                    expected: entry.size_bytes,
                    actual: meta.len(),
                })
            }
        }
        Ok(_) => Some(Mismatch::Missing {
            file_name: entry.file_name.clone(),
        }),
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!(file = %entry.file_name, "Cannot stat staged file: {}", e);
            }
            Some(Mismatch::Missing {
                file_name: entry.file_name.clone(),
            })
        }
    }
}

/// Every unsatisfied entry of `manifest` against `dir`
pub async fn check(manifest: &Manifest, dir: &Path) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    for entry in manifest.entries() {
        if let Some(mismatch) = check_entry(dir, entry).await {
            mismatches.push(mismatch);
        }
    }
    mismatches
}

/// Single check of `session` against its on-disk manifest. A session
/// without a readable manifest does not verify.
pub async fn verify(session: &Session) -> bool {
    let path = session.manifest_path();
    let manifest = match tokio::task::spawn_blocking(move || Manifest::read(&path)).await {
        Ok(Ok(manifest)) => manifest,
        Ok(Err(e)) => {
            debug!(session_id = %session.id(), "No readable manifest: {}", e);
            return false;
        }
        Err(e) => {
            warn!(session_id = %session.id(), "Manifest read task failed: {}", e);
            return false;
        }
    };

    let mismatches = check(&manifest, session.working_dir()).await;
    if !mismatches.is_empty() {
        debug!(session_id = %session.id(), ?mismatches, "Session not verified yet");
    }
    mismatches.is_empty()
}

/// Re-check until verified, waiting `policy` delays between checks
pub async fn await_verified(session: &Session, policy: RetryPolicy) -> Result<(), IntegrityError> {
    let cancel = session.cancel_token();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(IntegrityError::Cancelled(session.id()));
        }

        if verify(session).await {
            info!(session_id = %session.id(), attempts = attempt, "Session verified");
            return Ok(());
        }

        if !policy.allows_retry_after(attempt) {
            warn!(session_id = %session.id(), attempts = attempt, "Session never verified");
            return Err(IntegrityError::Timeout {
                session_id: session.id(),
                attempts: attempt,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(IntegrityError::Cancelled(session.id())),
            _ = tokio::time::sleep(policy.delay_after(attempt)) => {}
        }
    }
}
