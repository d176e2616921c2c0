//! Prometheus metrics for the session engine
//!
//! Thread-safe counters using atomic types

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared by every component of one engine
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Session lifecycle
    active_sessions: AtomicUsize,
    sessions_opened: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,

    // Failure taxonomy
    download_failures: AtomicU64,
    integrity_timeouts: AtomicU64,
    cleanup_failures: AtomicU64,

    // Retrieval
    files_retrieved: AtomicU64,
    bytes_retrieved: AtomicU64,
    fetch_retries: AtomicU64,

    // Reaper
    sessions_reaped: AtomicU64,
    sweeps: AtomicU64,

    // Session duration (simple moving average in milliseconds)
    total_session_time_ms: AtomicU64,
    timed_sessions: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                active_sessions: AtomicUsize::new(0),
                sessions_opened: AtomicU64::new(0),
                sessions_completed: AtomicU64::new(0),
                sessions_failed: AtomicU64::new(0),
                download_failures: AtomicU64::new(0),
                integrity_timeouts: AtomicU64::new(0),
                cleanup_failures: AtomicU64::new(0),
                files_retrieved: AtomicU64::new(0),
                bytes_retrieved: AtomicU64::new(0),
                fetch_retries: AtomicU64::new(0),
                sessions_reaped: AtomicU64::new(0),
                sweeps: AtomicU64::new(0),
                total_session_time_ms: AtomicU64::new(0),
                timed_sessions: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Session lifecycle

    pub fn session_opened(&self) {
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self, duration_ms: u64) {
        self.inner.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.session_ended(duration_ms);
    }

    pub fn session_failed(&self, duration_ms: u64) {
        self.inner.sessions_failed.fetch_add(1, Ordering::Relaxed);
        self.session_ended(duration_ms);
    }

    fn session_ended(&self, duration_ms: u64) {
        self.inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_session_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.inner.timed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_completed(&self) -> u64 {
        self.inner.sessions_completed.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.inner.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn avg_session_time_ms(&self) -> f64 {
        let total = self.inner.total_session_time_ms.load(Ordering::Relaxed);
        let count = self.inner.timed_sessions.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    // Failures

    pub fn download_failure(&self) {
        self.inner.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn integrity_timeout(&self) {
        self.inner.integrity_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cleanup_failure(&self) {
        self.inner.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_failures(&self) -> u64 {
        self.inner.download_failures.load(Ordering::Relaxed)
    }

    pub fn integrity_timeouts(&self) -> u64 {
        self.inner.integrity_timeouts.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> u64 {
        self.inner.cleanup_failures.load(Ordering::Relaxed)
    }

    // Retrieval

    pub fn file_retrieved(&self, size: usize) {
        self.inner.files_retrieved.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_retrieved.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn fetch_retry(&self) {
        self.inner.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_retrieved(&self) -> u64 {
        self.inner.files_retrieved.load(Ordering::Relaxed)
    }

    pub fn bytes_retrieved(&self) -> u64 {
        self.inner.bytes_retrieved.load(Ordering::Relaxed)
    }

    pub fn fetch_retries(&self) -> u64 {
        self.inner.fetch_retries.load(Ordering::Relaxed)
    }

    // Reaper

    pub fn sweep_finished(&self, reaped: usize) {
        self.inner.sweeps.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_reaped.fetch_add(reaped as u64, Ordering::Relaxed);
    }

    pub fn sessions_reaped(&self) -> u64 {
        self.inner.sessions_reaped.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.inner.sweeps.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP syncstage_uptime_seconds Time since the engine started in seconds\n\
             # TYPE syncstage_uptime_seconds counter\n\
             syncstage_uptime_seconds {}\n\
             \n\
             # HELP syncstage_active_sessions Sessions currently in progress\n\
             # TYPE syncstage_active_sessions gauge\n\
             syncstage_active_sessions {}\n\
             \n\
             # HELP syncstage_sessions_opened_total Sessions opened since start\n\
             # TYPE syncstage_sessions_opened_total counter\n\
             syncstage_sessions_opened_total {}\n\
             \n\
             # HELP syncstage_sessions_completed_total Sessions that staged a listing\n\
             # TYPE syncstage_sessions_completed_total counter\n\
             syncstage_sessions_completed_total {}\n\
             \n\
             # HELP syncstage_sessions_failed_total Sessions aborted with an error\n\
             # TYPE syncstage_sessions_failed_total counter\n\
             syncstage_sessions_failed_total {}\n\
             \n\
             # HELP syncstage_download_failures_total Sessions aborted by an unrecoverable fetch\n\
             # TYPE syncstage_download_failures_total counter\n\
             syncstage_download_failures_total {}\n\
             \n\
             # HELP syncstage_integrity_timeouts_total Sessions whose files never verified\n\
             # TYPE syncstage_integrity_timeouts_total counter\n\
             syncstage_integrity_timeouts_total {}\n\
             \n\
             # HELP syncstage_cleanup_failures_total Working directories that could not be removed\n\
             # TYPE syncstage_cleanup_failures_total counter\n\
             syncstage_cleanup_failures_total {}\n\
             \n\
             # HELP syncstage_files_retrieved_total Files written to working directories\n\
             # TYPE syncstage_files_retrieved_total counter\n\
             syncstage_files_retrieved_total {}\n\
             \n\
             # HELP syncstage_bytes_retrieved_total Bytes written to working directories\n\
             # TYPE syncstage_bytes_retrieved_total counter\n\
             syncstage_bytes_retrieved_total {}\n\
             \n\
             # HELP syncstage_fetch_retries_total Fetch attempts repeated after a transient failure\n\
             # TYPE syncstage_fetch_retries_total counter\n\
             syncstage_fetch_retries_total {}\n\
             \n\
             # HELP syncstage_sweeps_total Expiry sweeps run\n\
             # TYPE syncstage_sweeps_total counter\n\
             syncstage_sweeps_total {}\n\
             \n\
             # HELP syncstage_sessions_reaped_total Expired sessions reclaimed by sweeps\n\
             # TYPE syncstage_sessions_reaped_total counter\n\
             syncstage_sessions_reaped_total {}\n\
             \n\
             # HELP syncstage_avg_session_time_ms Average session duration in milliseconds\n\
             # TYPE syncstage_avg_session_time_ms gauge\n\
             syncstage_avg_session_time_ms {:.2}\n",
            self.uptime_seconds(),
            self.active_sessions(),
            self.sessions_opened(),
            self.sessions_completed(),
            self.sessions_failed(),
            self.download_failures(),
            self.integrity_timeouts(),
            self.cleanup_failures(),
            self.files_retrieved(),
            self.bytes_retrieved(),
            self.fetch_retries(),
            self.sweeps(),
            self.sessions_reaped(),
            self.avg_session_time_ms(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
