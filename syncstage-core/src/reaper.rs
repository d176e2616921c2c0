//! Expiry reaper: periodic reclamation of stale sessions
//!
//! A sweep scans the activity cache, and for every entry whose expiry has
//! passed removes the session's working directory and then the entry.
//! Entries that have not expired are never touched. Failures on one entry
//! are logged and the sweep moves on.
//!
//! Directories under the work root that have no activity entry at all and
//! are older than the grace period are leftovers of failed cleanups and are
//! removed as well.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache_store::{CacheError, CacheStore};
use crate::metrics::Metrics;
use crate::session::{unix_now, SessionId};

/// Default period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired activity entries removed
    pub reaped: usize,
    /// Entries left alone because they have not expired
    pub live: usize,
    /// Expired sessions whose directory could not be removed
    pub cleanup_failures: usize,
    /// Directories removed that had no activity entry
    pub orphans_removed: usize,
}

pub struct Reaper {
    cache: Arc<dyn CacheStore>,
    work_root: PathBuf,
    orphan_grace: Duration,
    metrics: Metrics,
}

impl Reaper {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        work_root: impl Into<PathBuf>,
        orphan_grace: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            cache,
            work_root: work_root.into(),
            orphan_grace,
            metrics,
        }
    }

    /// Run one sweep and return the number of sessions reaped
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        Ok(self.sweep_report().await?.reaped)
    }

    pub async fn sweep_report(&self) -> Result<SweepReport, CacheError> {
        let now = unix_now();
        let entries = self.cache.scan_activity().await?;
        let (expired, live): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, expiry)| *expiry < now);

        let mut report = SweepReport {
            live: live.len(),
            ..SweepReport::default()
        };

        let mut known: HashSet<String> = live.into_iter().map(|(id, _)| id).collect();

        for (session_id, expiry) in expired {
            // A heartbeat or re-activation may have refreshed the entry since the scan
            match self.cache.get_activity(&session_id).await {
                Ok(Some(current)) if current < now => {}
                Ok(Some(current)) => {
                    debug!(session_id, expiry = current, "Session refreshed during sweep; keeping it");
                    report.live += 1;
                    known.insert(session_id);
                    continue;
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(session_id, "Failed to re-read activity entry: {}", e);
                    continue;
                }
            }

            match SessionId::parse(&session_id) {
                Some(id) => {
                    if !self.remove_working_dir(id).await {
                        report.cleanup_failures += 1;
                        self.metrics.cleanup_failure();
                    }
                }
                None => warn!(session_id, "Activity entry has a malformed session id; dropping it"),
            }

            match self.cache.delete_activity(&session_id).await {
                Ok(()) => {
                    debug!(session_id, expiry, "Reaped expired session");
                    report.reaped += 1;
                }
                Err(e) => error!(session_id, "Failed to delete activity entry: {}", e),
            }
        }

        report.orphans_removed = self.sweep_orphans(&known).await;

        self.metrics.sweep_finished(report.reaped);
        info!(
            reaped = report.reaped,
            live = report.live,
            cleanup_failures = report.cleanup_failures,
            orphans_removed = report.orphans_removed,
            "Expiry sweep finished"
        );
        Ok(report)
    }

    /// Whether the directory is gone afterwards
    async fn remove_working_dir(&self, id: SessionId) -> bool {
        let path = self.work_root.join(id.to_string());
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(session_id = %id, ?path, "Failed to remove working directory: {}", e);
                false
            }
        }
    }

    async fn sweep_orphans(&self, live: &HashSet<String>) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.work_root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = ?self.work_root, "Cannot scan work root: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Work root scan interrupted: {}", e);
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = SessionId::parse(&name) else {
                continue;
            };
            if live.contains(&name) {
                continue;
            }

            let age = match entry.metadata().await {
                Ok(meta) if meta.is_dir() => match meta.modified() {
                    Ok(modified) => modified.elapsed().unwrap_or_default(),
                    Err(_) => continue,
                },
                _ => continue,
            };
            if age < self.orphan_grace {
                continue;
            }

            // The entry may have been written after the scan
            match self.cache.get_activity(&name).await {
                Ok(None) => {}
                _ => continue,
            }

            if self.remove_working_dir(id).await {
                debug!(session_id = %id, "Removed orphaned working directory");
                removed += 1;
            } else {
                self.metrics.cleanup_failure();
            }
        }
        removed
    }

    /// Sweep every `interval` until cancelled. The first sweep runs
    /// immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Expiry reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_report().await {
                        error!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Expiry reaper stopped");
    }
}
