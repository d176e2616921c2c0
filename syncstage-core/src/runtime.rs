//! Process-level wiring of the engine
//!
//! Builds the cache, content store, catalog and engine from a `Config`, and
//! runs one of the binary's actions: the long-running service (reaper plus
//! HTTP endpoint accepting sessions), a single sync, or a single sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::block_store::LocalBlockStore;
use crate::cache_store::{CacheError, CacheStore, RocksCacheStore};
use crate::catalog::{Catalog, LocatorError};
use crate::config::{Config, StoreBackend};
use crate::content_store::{ContentStore, StoreError};
use crate::engine::{SyncEngine, SyncError, SyncOutcome};
use crate::kubo::{KuboCli, KuboHttp};
use crate::metrics::Metrics;
use crate::reaper::SweepReport;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache store error: {0}")]
    Cache(#[from] CacheError),

    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] LocatorError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Everything one process needs, wired from config
pub struct Components {
    pub engine: Arc<SyncEngine>,
    pub cache: Arc<dyn CacheStore>,
    pub metrics: Metrics,
}

fn content_store(config: &Config) -> Result<Arc<dyn ContentStore>, RuntimeError> {
    let store: Arc<dyn ContentStore> = match &config.store {
        StoreBackend::KuboCli { binary, repo } => {
            let mut cli = KuboCli::new(binary).with_timeout(config.store_timeout());
            if let Some(repo) = repo {
                cli = cli.with_repo(repo);
            }
            info!(binary = ?binary, "Using Kubo CLI content store");
            Arc::new(cli)
        }
        StoreBackend::KuboHttp { api_url } => {
            info!(api_url = %api_url, "Using Kubo RPC content store");
            Arc::new(KuboHttp::new(api_url.as_str(), config.store_timeout())?)
        }
        StoreBackend::Local { path } => {
            let path = path.clone().unwrap_or_else(|| config.data_dir.join("blocks"));
            Arc::new(LocalBlockStore::new_with_path(path)?)
        }
    };
    Ok(store)
}

pub fn build(config: &Config) -> Result<Components, RuntimeError> {
    std::fs::create_dir_all(&config.data_dir)?;

    let cache: Arc<dyn CacheStore> = Arc::new(RocksCacheStore::open(config.cache_dir())?);
    let store = content_store(config)?;
    let catalog = Arc::new(Catalog::load(&config.catalog_path())?);
    let metrics = Metrics::new();

    let engine = Arc::new(SyncEngine::new(
        catalog,
        store,
        Arc::clone(&cache),
        config.engine_settings(),
        metrics.clone(),
    ));

    Ok(Components {
        engine,
        cache,
        metrics,
    })
}

/// Run the reaper and the HTTP endpoint until Ctrl+C. Sessions started
/// through `POST /sync/:owner` share this process's cache handle.
pub async fn run_service(config: Config) -> Result<(), RuntimeError> {
    let components = build(&config)?;
    let cancel = CancellationToken::new();

    let reaper = Arc::new(components.engine.reaper());
    let reaper_task = tokio::spawn(reaper.run(config.reaper_interval(), cancel.clone()));

    let app = api::create_router(Arc::clone(&components.engine));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Service endpoint listening on http://{}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    if let Err(e) = reaper_task.await {
        error!("Reaper task failed: {}", e);
    }
    components.cache.close().await;

    info!("Service stopped");
    Ok(())
}

/// Stage one owner's records, or only `record_ids` when given
pub async fn run_sync(
    config: Config,
    owner_id: &str,
    record_ids: &[u64],
) -> Result<SyncOutcome, RuntimeError> {
    let components = build(&config)?;

    let result = if record_ids.is_empty() {
        components.engine.sync_owner(owner_id).await
    } else {
        components.engine.sync_records(owner_id, record_ids).await
    };

    components.cache.close().await;
    Ok(result?)
}

pub async fn run_sweep(config: Config) -> Result<SweepReport, RuntimeError> {
    let components = build(&config)?;
    let result = components.engine.reaper().sweep_report().await;
    components.cache.close().await;
    Ok(result?)
}
