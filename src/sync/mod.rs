//! Optimistic-write synchronization engine.
//!
//! One process-wide mutable view of journey state, backed by the persistent
//! store and eventually reconciled with the remote preferences API. Every
//! mutation updates the in-memory view synchronously, so the UI reflects it
//! with zero perceived latency, then appends the change to a durable outbox
//! that is drained asynchronously. Local persistence failures are logged and
//! never roll back the in-memory state; remote pushes retry with backoff a
//! bounded number of times and are then dropped.

mod api;
mod recommend;

pub use api::{ApiFuture, HttpPreferencesApi, NextAction, PreferencesApi, RemoteJourney};
pub use recommend::{DerivedSlot, SlotState};

use chrono::Utc;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::migrate::{LegacyMigrator, LegacyStore};
use crate::store::records::{BookmarkRecord, JourneyState, OutboxEntry};
use crate::store::PersistentStore;

// Outbox entry kinds
const OP_JOURNEY: &str = "journey";
const OP_JOURNEY_RESET: &str = "journey_reset";
const OP_BOOKMARK_PUT: &str = "bookmark_put";
const OP_BOOKMARK_DELETE: &str = "bookmark_delete";

/// Attempts before a queued write or a server push is dropped.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(50);

fn backoff(attempt: u32) -> Duration {
  BACKOFF_BASE * 2u32.saturating_pow(attempt)
}

struct EngineState {
  initialized: bool,
  journey: JourneyState,
  bookmarks: HashMap<String, BookmarkRecord>,
}

struct Inner {
  store: Arc<PersistentStore>,
  api: Option<Arc<dyn PreferencesApi>>,
  legacy: Option<Arc<dyn LegacyStore>>,
  state: Mutex<EngineState>,
  /// Serializes outbox drains so entries apply in queue order.
  drain_gate: tokio::sync::Mutex<()>,
  recommendation: DerivedSlot<NextAction>,
}

/// The synchronization engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<Inner>,
}

impl SyncEngine {
  pub fn new(store: Arc<PersistentStore>) -> Self {
    Self::assemble(store, None, None)
  }

  /// Attach the remote preferences API. Builder-style; call before `init`.
  pub fn with_api(self, api: Arc<dyn PreferencesApi>) -> Self {
    Self::assemble(
      Arc::clone(&self.inner.store),
      Some(api),
      self.inner.legacy.clone(),
    )
  }

  /// Attach legacy flat storage so `init` can migrate it. Builder-style;
  /// call before `init`.
  pub fn with_legacy(self, legacy: Arc<dyn LegacyStore>) -> Self {
    Self::assemble(
      Arc::clone(&self.inner.store),
      self.inner.api.clone(),
      Some(legacy),
    )
  }

  fn assemble(
    store: Arc<PersistentStore>,
    api: Option<Arc<dyn PreferencesApi>>,
    legacy: Option<Arc<dyn LegacyStore>>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        api,
        legacy,
        state: Mutex::new(EngineState {
          initialized: false,
          journey: JourneyState::default(),
          bookmarks: HashMap::new(),
        }),
        drain_gate: tokio::sync::Mutex::new(()),
        recommendation: DerivedSlot::new(),
      }),
    }
  }

  /// Idempotent initialization: on first call runs the legacy migration,
  /// hydrates in-memory state from the store, and drains any outbox left
  /// over from a previous run. Subsequent calls are no-ops.
  pub async fn init(&self) -> Result<()> {
    {
      let state = self.lock_state();
      if state.initialized {
        return Ok(());
      }
    }

    if let Some(legacy) = &self.inner.legacy {
      let report = LegacyMigrator::run(&self.inner.store, legacy.as_ref())?;
      if report.ran {
        debug!(
          bookmarks = report.bookmarks_migrated,
          journey = report.journey_migrated,
          "legacy migration completed"
        );
      }
    }

    let journey = self.inner.store.get_journey()?.unwrap_or_default();
    let bookmarks = self
      .inner
      .store
      .bookmarks()?
      .into_iter()
      .map(|b| (b.id.clone(), b))
      .collect();

    {
      let mut state = self.lock_state();
      state.journey = journey;
      state.bookmarks = bookmarks;
      state.initialized = true;
    }

    // Writes queued before a previous shutdown
    self.drain().await;
    Ok(())
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current in-memory journey snapshot.
  pub fn journey(&self) -> JourneyState {
    self.lock_state().journey.clone()
  }

  /// Current in-memory bookmarks.
  pub fn bookmarks(&self) -> Vec<BookmarkRecord> {
    let mut bookmarks: Vec<_> = self.lock_state().bookmarks.values().cloned().collect();
    bookmarks.sort_by(|a, b| a.id.cmp(&b.id));
    bookmarks
  }

  // Mutations: in-memory first, durable outbox second.

  pub fn set_path(&self, path_id: &str, experience_level: &str) {
    let snapshot = {
      let mut state = self.lock_state();
      state.journey.path_id = Some(path_id.to_string());
      state.journey.experience_level = Some(experience_level.to_string());
      state.journey.last_path_change = Some(Utc::now());
      state.journey.clone()
    };
    self.queue_journey(snapshot);
  }

  pub fn set_goals(&self, goals: Vec<String>) {
    let snapshot = {
      let mut state = self.lock_state();
      state.journey.goals = goals;
      state.journey.clone()
    };
    // One idempotent upsert regardless of whether a row exists yet
    self.queue_journey(snapshot);
  }

  pub fn complete_onboarding(&self, path_id: &str, experience_level: &str, goals: Vec<String>) {
    let snapshot = {
      let mut state = self.lock_state();
      state.journey.path_id = Some(path_id.to_string());
      state.journey.experience_level = Some(experience_level.to_string());
      state.journey.goals = goals;
      state.journey.onboarding_completed = true;
      state.journey.onboarding_completed_at = Some(Utc::now());
      state.journey.clone()
    };
    self.queue_journey(snapshot);
  }

  /// Clear journey state, e.g. on logout.
  pub fn reset(&self) {
    {
      let mut state = self.lock_state();
      state.journey = JourneyState::default();
    }
    self.queue(OP_JOURNEY_RESET, Vec::new());
  }

  pub fn add_bookmark(&self, bookmark: BookmarkRecord) {
    let payload = match serde_json::to_vec(&bookmark) {
      Ok(payload) => payload,
      Err(e) => {
        warn!("failed to serialize bookmark {}: {}", bookmark.id, e);
        return;
      }
    };
    {
      let mut state = self.lock_state();
      state.bookmarks.insert(bookmark.id.clone(), bookmark);
    }
    self.queue(OP_BOOKMARK_PUT, payload);
  }

  pub fn remove_bookmark(&self, id: &str) {
    {
      let mut state = self.lock_state();
      state.bookmarks.remove(id);
    }
    self.queue(OP_BOOKMARK_DELETE, id.as_bytes().to_vec());
  }

  fn queue_journey(&self, snapshot: JourneyState) {
    match serde_json::to_vec(&snapshot) {
      // Each entry carries the full snapshot, so out-of-order completion of
      // older entries cannot resurrect stale fields
      Ok(payload) => self.queue(OP_JOURNEY, payload),
      Err(e) => warn!("failed to serialize journey snapshot: {}", e),
    }
  }

  /// Append to the durable write-ahead queue and kick off a drain. An append
  /// failure is a persistence failure: logged, in-memory state kept.
  fn queue(&self, kind: &str, payload: Vec<u8>) {
    if let Err(e) = self.inner.store.outbox_append(kind, &payload) {
      warn!(kind, "failed to queue write, keeping optimistic state: {}", e);
      return;
    }
    let engine = self.clone();
    tokio::spawn(async move {
      engine.drain().await;
    });
  }

  /// Apply queued writes to the store in order. Entries that keep failing
  /// are dropped after a bounded number of attempts.
  async fn drain(&self) {
    let _gate = self.inner.drain_gate.lock().await;

    let entries = match self.inner.store.outbox_entries() {
      Ok(entries) => entries,
      Err(e) => {
        warn!("failed to read outbox: {}", e);
        return;
      }
    };

    for entry in entries {
      match self.apply_entry(&entry) {
        Ok(()) => {
          if let Err(e) = self.inner.store.outbox_delete(entry.seq) {
            warn!(seq = entry.seq, "failed to remove applied outbox entry: {}", e);
          }
        }
        Err(e) => {
          let attempts = entry.attempts + 1;
          if attempts >= MAX_ATTEMPTS {
            error!(
              seq = entry.seq,
              kind = %entry.kind,
              "dropping queued write after {} attempts: {}",
              attempts,
              e
            );
            let _ = self.inner.store.outbox_delete(entry.seq);
          } else {
            warn!(seq = entry.seq, kind = %entry.kind, "queued write failed, will retry: {}", e);
            let _ = self.inner.store.outbox_bump_attempts(entry.seq);
            tokio::time::sleep(backoff(attempts)).await;
            // Stop here; the next drain retries from this entry in order
            return;
          }
        }
      }
    }
  }

  fn apply_entry(&self, entry: &OutboxEntry) -> Result<()> {
    match entry.kind.as_str() {
      OP_JOURNEY => {
        let snapshot: JourneyState = serde_json::from_slice(&entry.payload)?;
        self.inner.store.put_journey(&snapshot)
      }
      OP_JOURNEY_RESET => self.inner.store.clear_journey(),
      OP_BOOKMARK_PUT => {
        let bookmark: BookmarkRecord = serde_json::from_slice(&entry.payload)?;
        self.inner.store.put_bookmark(&bookmark)
      }
      OP_BOOKMARK_DELETE => {
        let id = String::from_utf8_lossy(&entry.payload);
        self.inner.store.delete_bookmark(&id)
      }
      kind => {
        warn!(kind, "dropping outbox entry of unknown kind");
        Ok(())
      }
    }
  }

  /// Await one full outbox drain. Used by teardown and tests.
  pub async fn flush(&self) {
    self.drain().await;
  }

  /// Push the current snapshot to the remote authority. Failures retry with
  /// backoff up to a bound, then are logged and dropped; nothing propagates
  /// to the caller.
  pub async fn sync_with_server(&self) {
    let Some(api) = &self.inner.api else {
      return;
    };
    let snapshot: RemoteJourney = self.journey().into();

    for attempt in 0..MAX_ATTEMPTS {
      match api.push_journey(snapshot.clone()).await {
        Ok(()) => {
          debug!("journey synced to server");
          return;
        }
        Err(e) => {
          warn!(attempt, "server sync failed: {}", e);
          if attempt + 1 < MAX_ATTEMPTS {
            tokio::time::sleep(backoff(attempt)).await;
          }
        }
      }
    }
    error!("giving up on server sync after {} attempts", MAX_ATTEMPTS);
  }

  /// Overwrite both in-memory state and the store with server-supplied
  /// values. Used on login to reconcile anonymous local state with the
  /// authenticated account.
  pub fn load_from_server(&self, remote: RemoteJourney) -> Result<()> {
    let journey: JourneyState = remote.into();
    {
      let mut state = self.lock_state();
      state.journey = journey.clone();
    }
    self.inner.store.put_journey(&journey)
  }

  /// Fetch the server-side journey and apply it. Returns whether the server
  /// had one.
  pub async fn pull_from_server(&self) -> Result<bool> {
    let Some(api) = &self.inner.api else {
      return Ok(false);
    };
    match api.fetch_journey().await? {
      Some(remote) => {
        self.load_from_server(remote)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  // Recommendation slot, decoupled from the core journey fields.

  /// Start (or restart) fetching the recommended next action.
  pub fn refresh_recommendation(&self) {
    let Some(api) = &self.inner.api else {
      return;
    };
    self.inner.recommendation.begin(api.fetch_next_action());
  }

  /// Fold in a pending recommendation result; `true` when the state changed.
  pub fn poll_recommendation(&self) -> bool {
    self.inner.recommendation.poll()
  }

  pub fn recommendation(&self) -> SlotState<NextAction> {
    self.inner.recommendation.state()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::migrate::tests::MemoryLegacyStore;
  use crate::migrate::{LEGACY_BOOKMARKS_KEY, LEGACY_JOURNEY_KEY};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Canned preferences API whose pushes can be made to fail.
  struct FakeApi {
    fail_push: bool,
    pushes: AtomicUsize,
    remote: Option<RemoteJourney>,
  }

  impl FakeApi {
    fn new(fail_push: bool) -> Self {
      Self {
        fail_push,
        pushes: AtomicUsize::new(0),
        remote: None,
      }
    }
  }

  impl PreferencesApi for FakeApi {
    fn push_journey(&self, _journey: RemoteJourney) -> ApiFuture<()> {
      self.pushes.fetch_add(1, Ordering::SeqCst);
      let fail = self.fail_push;
      Box::pin(async move {
        if fail {
          Err(eyre!("connection reset"))
        } else {
          Ok(())
        }
      })
    }

    fn fetch_journey(&self) -> ApiFuture<Option<RemoteJourney>> {
      let remote = self.remote.clone();
      Box::pin(async move { Ok(remote) })
    }

    fn fetch_next_action(&self) -> ApiFuture<NextAction> {
      Box::pin(async move {
        Ok(NextAction {
          title: "Continue with ownership".to_string(),
          href: "/guide/ownership".to_string(),
          reason: None,
        })
      })
    }
  }

  fn engine() -> SyncEngine {
    SyncEngine::new(Arc::new(PersistentStore::open_in_memory().unwrap()))
  }

  fn bookmark(id: &str) -> BookmarkRecord {
    BookmarkRecord {
      id: id.to_string(),
      kind: "article".to_string(),
      title: format!("Bookmark {}", id),
      topic_slug: "rust-basics".to_string(),
      category_slug: "lang".to_string(),
      created_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn init_runs_migration_and_hydrates() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let legacy = Arc::new(MemoryLegacyStore::new(&[
      (LEGACY_JOURNEY_KEY, r#"{"pathId":"frontend"}"#),
      (
        LEGACY_BOOKMARKS_KEY,
        r#"[{"id":"b1","type":"article","title":"Ownership","topicSlug":"rust-basics"}]"#,
      ),
    ]));

    let engine = SyncEngine::new(Arc::clone(&store)).with_legacy(legacy);
    engine.init().await.unwrap();

    assert_eq!(engine.journey().path_id.as_deref(), Some("frontend"));
    assert_eq!(engine.bookmarks().len(), 1);
  }

  #[tokio::test]
  async fn init_is_idempotent() {
    let engine = engine();
    engine.init().await.unwrap();

    engine.set_path("backend", "intermediate");
    // A second init must not re-hydrate over the optimistic state
    engine.init().await.unwrap();
    assert_eq!(engine.journey().path_id.as_deref(), Some("backend"));
  }

  #[tokio::test]
  async fn mutations_apply_in_memory_before_persistence() {
    let engine = engine();
    engine.init().await.unwrap();

    engine.set_path("frontend", "beginner");
    // Visible immediately, no await needed
    let journey = engine.journey();
    assert_eq!(journey.path_id.as_deref(), Some("frontend"));
    assert_eq!(journey.experience_level.as_deref(), Some("beginner"));
    assert!(journey.last_path_change.is_some());
  }

  #[tokio::test]
  async fn set_goals_upserts_without_an_existing_row() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();

    // No journey row exists yet; a single upsert must create it
    engine.set_goals(vec!["learn rust".to_string()]);
    engine.flush().await;

    let stored = store.get_journey().unwrap().unwrap();
    assert_eq!(stored.goals, vec!["learn rust".to_string()]);
  }

  #[tokio::test]
  async fn complete_onboarding_sets_all_fields() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();

    engine.complete_onboarding("frontend", "beginner", vec!["ship".to_string()]);
    engine.flush().await;

    let stored = store.get_journey().unwrap().unwrap();
    assert!(stored.onboarding_completed);
    assert!(stored.onboarding_completed_at.is_some());
    assert_eq!(stored.path_id.as_deref(), Some("frontend"));
  }

  #[tokio::test]
  async fn reset_clears_memory_and_store() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();

    engine.set_path("frontend", "beginner");
    engine.flush().await;
    assert!(store.get_journey().unwrap().is_some());

    engine.reset();
    assert_eq!(engine.journey(), JourneyState::default());
    engine.flush().await;
    assert!(store.get_journey().unwrap().is_none());
  }

  #[tokio::test]
  async fn outbox_survives_a_restart() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    // Queue a write without draining it, as if the process died first
    store
      .outbox_append(
        OP_JOURNEY,
        &serde_json::to_vec(&JourneyState {
          path_id: Some("frontend".to_string()),
          ..Default::default()
        })
        .unwrap(),
      )
      .unwrap();

    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();

    assert!(store.outbox_entries().unwrap().is_empty());
    assert_eq!(
      store.get_journey().unwrap().unwrap().path_id.as_deref(),
      Some("frontend")
    );
  }

  #[tokio::test]
  async fn network_failure_never_disturbs_the_optimistic_update() {
    // End-to-end: a bookmark write with the network down
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let api = Arc::new(FakeApi::new(true));
    let api_trait: Arc<dyn PreferencesApi> = api.clone();
    let engine = SyncEngine::new(Arc::clone(&store)).with_api(api_trait);
    engine.init().await.unwrap();

    engine.add_bookmark(bookmark("b1"));
    engine.flush().await;
    engine.sync_with_server().await;

    // In-memory state still reflects the optimistic update
    assert_eq!(engine.bookmarks().len(), 1);
    // The store contains the updated record
    assert!(store.get_bookmark("b1").unwrap().is_some());
    // The push was retried up to the bound, then dropped
    assert_eq!(api.pushes.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
  }

  #[tokio::test]
  async fn remove_bookmark_deletes_everywhere() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();

    engine.add_bookmark(bookmark("b1"));
    engine.remove_bookmark("b1");
    engine.flush().await;

    assert!(engine.bookmarks().is_empty());
    assert!(store.get_bookmark("b1").unwrap().is_none());
  }

  #[tokio::test]
  async fn load_from_server_overwrites_local_state() {
    let store = Arc::new(PersistentStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(Arc::clone(&store));
    engine.init().await.unwrap();
    engine.set_path("frontend", "beginner");

    let remote = RemoteJourney {
      path_id: Some("data-engineering".to_string()),
      experience_level: Some("advanced".to_string()),
      goals: vec!["pipelines".to_string()],
      onboarding_completed: true,
      onboarding_completed_at: None,
      last_path_change: None,
    };
    engine.load_from_server(remote).unwrap();

    assert_eq!(engine.journey().path_id.as_deref(), Some("data-engineering"));
    assert_eq!(
      store.get_journey().unwrap().unwrap().path_id.as_deref(),
      Some("data-engineering")
    );
  }

  #[tokio::test]
  async fn pull_from_server_reports_whether_remote_state_existed() {
    let engine = engine();
    engine.init().await.unwrap();
    // No API attached at all
    assert!(!engine.pull_from_server().await.unwrap());

    let mut api = FakeApi::new(false);
    api.remote = Some(RemoteJourney {
      path_id: Some("frontend".to_string()),
      experience_level: None,
      goals: Vec::new(),
      onboarding_completed: false,
      onboarding_completed_at: None,
      last_path_change: None,
    });
    let engine = SyncEngine::new(Arc::new(PersistentStore::open_in_memory().unwrap()))
      .with_api(Arc::new(api));
    engine.init().await.unwrap();

    assert!(engine.pull_from_server().await.unwrap());
    assert_eq!(engine.journey().path_id.as_deref(), Some("frontend"));
  }

  #[tokio::test]
  async fn recommendation_loads_independently() {
    let engine = SyncEngine::new(Arc::new(PersistentStore::open_in_memory().unwrap()))
      .with_api(Arc::new(FakeApi::new(false)));
    engine.init().await.unwrap();

    assert_eq!(engine.recommendation(), SlotState::Idle);
    engine.refresh_recommendation();
    assert!(engine.recommendation().is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.poll_recommendation());
    let state = engine.recommendation();
    assert_eq!(state.value().unwrap().href, "/guide/ownership");
  }
}
