//! Syncstage Core
//!
//! Retrieval sessions over a content-addressed store: concurrent fetch into
//! an exclusive working directory, size verification against a manifest,
//! staging of the verified bytes into an owner-keyed cache, and expiry
//! reclamation of abandoned sessions.

pub mod api;
pub mod block_store;
pub mod cache_store;
pub mod catalog;
pub mod config;
pub mod content_store;
pub mod engine;
pub mod kubo;
pub mod manifest;
pub mod metrics;
pub mod packager;
pub mod reaper;
pub mod retriever;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod verifier;

pub use block_store::{content_address, verify_address, LocalBlockStore};
pub use cache_store::{activity_key, CacheError, CacheStore, MemoryCacheStore, RocksCacheStore};
pub use catalog::{assemble_record, Catalog, ContentLocator, ContentRecord, LocatorError};
pub use config::{Action, Config, ConfigError, StoreBackend};
pub use content_store::{ContentStore, Link, MemoryContentStore, StoreError};
pub use engine::{AuditResult, EngineSettings, SyncEngine, SyncError, SyncOutcome};
pub use kubo::{KuboCli, KuboHttp};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
pub use metrics::Metrics;
pub use packager::{package, EntryMeta, ListingEntry, ListingPayload, PackageError};
pub use reaper::{Reaper, SweepReport};
pub use retriever::{DownloadFailure, RetrieveError, Retriever};
pub use retry::{Backoff, RetryPolicy};
pub use runtime::{run_service, run_sweep, run_sync, RuntimeError};
pub use session::{Heartbeat, Session, SessionCoordinator, SessionError, SessionId, SessionState};
pub use verifier::{IntegrityError, Mismatch};

// Re-export Cid for external use
pub use cid::Cid;
