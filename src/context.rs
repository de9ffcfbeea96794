//! Explicit application context.
//!
//! Wires the store, tracker, cache manager and sync engine together once at
//! startup and hands the bundle to the host. Every collaborator is passed in
//! explicitly, so tests can assemble a context from in-memory parts and
//! nothing in the crate reaches for hidden global state.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::info;

use crate::cache::{CacheManager, CacheStore, SqliteCacheStore, WorkerEvent};
use crate::config::Config;
use crate::http::{Fetch, ReqwestFetch};
use crate::migrate::JsonFileLegacyStore;
use crate::store::PersistentStore;
use crate::sync::{HttpPreferencesApi, SyncEngine};
use crate::tracker::ActivityTracker;

/// Everything the offline layer needs, wired together.
pub struct OfflineContext {
  pub config: Config,
  pub store: Arc<PersistentStore>,
  pub tracker: Arc<ActivityTracker>,
  pub cache: Arc<CacheManager>,
  pub sync: SyncEngine,
}

impl OfflineContext {
  /// Production wiring: SQLite stores in the platform data directory, real
  /// HTTP for both cache traffic and the preferences API, and the legacy
  /// flat file picked up for migration if it exists.
  pub fn new(config: Config) -> Result<Self> {
    let store = Arc::new(match &config.store.path {
      Some(path) => PersistentStore::open_at(path)?,
      None => PersistentStore::open_default()?,
    });
    let tracker = Arc::new(ActivityTracker::new(config.tracker.clone()));
    let fetcher: Arc<dyn Fetch> = Arc::new(ReqwestFetch::new());
    let cache_store: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::open_default()?);

    let cache = Arc::new(
      CacheManager::new(&config, cache_store, Arc::clone(&fetcher))?
        .with_tracker(Arc::clone(&tracker)),
    );

    let api = Arc::new(HttpPreferencesApi::new(&config.api)?);
    let mut sync = SyncEngine::new(Arc::clone(&store)).with_api(api);

    let legacy_path = legacy_storage_path()?;
    if legacy_path.exists() {
      info!(path = %legacy_path.display(), "found legacy storage, scheduling migration");
      sync = sync.with_legacy(Arc::new(JsonFileLegacyStore::open(&legacy_path)?));
    }

    Ok(Self {
      config,
      store,
      tracker,
      cache,
      sync,
    })
  }

  /// Assemble a context from pre-built parts. Tests use this with in-memory
  /// stores and closure fetchers.
  pub fn from_parts(
    config: Config,
    store: Arc<PersistentStore>,
    tracker: Arc<ActivityTracker>,
    cache: Arc<CacheManager>,
    sync: SyncEngine,
  ) -> Self {
    Self {
      config,
      store,
      tracker,
      cache,
      sync,
    }
  }

  /// Bring the whole layer up: migrate and hydrate the sync engine, then
  /// install and activate the cache worker.
  pub async fn init(&self) -> Result<()> {
    self.sync.init().await?;
    self.cache.handle_event(WorkerEvent::Install).await?;
    self.cache.handle_event(WorkerEvent::Activate).await?;
    info!("offline layer ready");
    Ok(())
  }

  /// Flush pending local writes and stop intercepting traffic.
  pub async fn teardown(&self) {
    self.sync.flush().await;
    self.cache.terminate();
  }
}

fn legacy_storage_path() -> Result<PathBuf> {
  let dir = dirs::data_dir().ok_or_else(|| eyre!("Unable to determine data directory"))?;
  Ok(dir.join("holdfast").join("legacy-storage.json"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopCacheStore, WorkerPhase};
  use crate::config::TrackerConfig;
  use crate::http::{FetchFuture, Request, Response};

  fn ok_fetcher() -> Arc<dyn Fetch> {
    Arc::new(|_request: Request| -> FetchFuture {
      Box::pin(async { Ok(Response::new(200, b"ok".to_vec())) })
    })
  }

  fn context() -> OfflineContext {
    let config = Config::default();
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let tracker = Arc::new(ActivityTracker::new(TrackerConfig::default()));
    let cache = Arc::new(
      CacheManager::new(&config, Arc::new(NoopCacheStore), ok_fetcher())
        .unwrap()
        .with_tracker(Arc::clone(&tracker)),
    );
    let sync = SyncEngine::new(Arc::clone(&store));
    OfflineContext::from_parts(config, store, tracker, cache, sync)
  }

  #[tokio::test]
  async fn init_brings_the_cache_worker_to_active() {
    let ctx = context();
    assert_eq!(ctx.cache.phase(), WorkerPhase::Uninstalled);

    ctx.init().await.unwrap();
    assert_eq!(ctx.cache.phase(), WorkerPhase::Active);
  }

  #[tokio::test]
  async fn teardown_flushes_and_terminates() {
    let ctx = context();
    ctx.init().await.unwrap();

    ctx.sync.set_path("frontend", "beginner");
    ctx.teardown().await;

    assert_eq!(ctx.cache.phase(), WorkerPhase::Terminated);
    assert_eq!(
      ctx.store.get_journey().unwrap().unwrap().path_id.as_deref(),
      Some("frontend")
    );
  }
}
