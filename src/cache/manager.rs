//! Request interception: lifecycle state machine and per-route strategies.
//!
//! The manager mirrors an installable worker: it moves through
//! `Uninstalled -> Installing -> Waiting -> Active -> Terminated`, precaches
//! the application shell during install, prunes stale cache generations
//! during activate, and classifies every intercepted GET into a cache-first
//! or network-first strategy while it is active. Host events arrive through
//! [`CacheManager::handle_event`]; no implicit event registration exists.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use url::Url;

use super::storage::{request_key, CacheStore};
use crate::config::Config;
use crate::http::{Fetch, Method, Request, Response};
use crate::tracker::ActivityTracker;

/// Response header marking a cache-served API response.
pub const SERVED_FROM_HEADER: &str = "x-served-from";

/// Lifecycle phase of the interception layer.
///
/// Transitions: `Uninstalled -> Installing -> Waiting -> Active`, and any
/// phase `-> Terminated`. `Waiting -> Active` happens on an activate event
/// or a skip-waiting message; re-activation from `Active` is permitted and
/// prunes generations again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
  Uninstalled,
  Installing,
  Waiting,
  Active,
  Terminated,
}

/// Host lifecycle events dispatched to the manager.
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Message(ControlMessage),
}

/// Out-of-band commands from the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Force-activate-now: supersede the previous instance immediately.
  SkipWaiting,
  /// Purge every cache generation.
  ClearCache,
}

/// Strategy a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteClass {
  Passthrough,
  CacheFirst,
  NetworkFirst,
}

pub struct CacheManager {
  origin: Url,
  api_prefix: String,
  cacheable_routes: Vec<String>,
  precache: Vec<String>,
  offline_document: String,
  static_generation: String,
  dynamic_generation: String,
  store: Arc<dyn CacheStore>,
  fetcher: Arc<dyn Fetch>,
  tracker: Option<Arc<ActivityTracker>>,
  phase: Mutex<WorkerPhase>,
}

impl CacheManager {
  pub fn new(config: &Config, store: Arc<dyn CacheStore>, fetcher: Arc<dyn Fetch>) -> Result<Self> {
    let origin = Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", config.api.base_url, e))?;

    Ok(Self {
      origin,
      api_prefix: config.api.prefix.clone(),
      cacheable_routes: config.api.cacheable_routes.clone(),
      precache: config.cache.precache.clone(),
      offline_document: config.cache.offline_document.clone(),
      static_generation: config.cache.static_generation(),
      dynamic_generation: config.cache.dynamic_generation(),
      store,
      fetcher,
      tracker: None,
      phase: Mutex::new(WorkerPhase::Uninstalled),
    })
  }

  /// Record every foreground network attempt with the given tracker.
  pub fn with_tracker(mut self, tracker: Arc<ActivityTracker>) -> Self {
    self.tracker = Some(tracker);
    self
  }

  pub fn phase(&self) -> WorkerPhase {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_phase(&self, phase: WorkerPhase) {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
  }

  /// Dispatch one host event. Fetch events resolve to a response; lifecycle
  /// events resolve to `None`.
  pub async fn handle_event(&self, event: WorkerEvent) -> Result<Option<Response>> {
    match event {
      WorkerEvent::Install => {
        self.install().await?;
        Ok(None)
      }
      WorkerEvent::Activate => {
        self.activate()?;
        Ok(None)
      }
      WorkerEvent::Fetch(request) => Ok(Some(self.intercept(request).await?)),
      WorkerEvent::Message(message) => {
        self.handle_message(message)?;
        Ok(None)
      }
    }
  }

  /// Precache the application shell into the static generation.
  ///
  /// Individual precache failures are logged and skipped so one unreachable
  /// resource cannot block installation. Ends in `Waiting`, ready to
  /// supersede a previous instance immediately.
  pub async fn install(&self) -> Result<()> {
    if self.phase() != WorkerPhase::Uninstalled {
      return Err(eyre!("install is only valid from Uninstalled, current phase {:?}", self.phase()));
    }
    self.set_phase(WorkerPhase::Installing);

    for path in &self.precache {
      match self.precache_one(path).await {
        Ok(()) => debug!(%path, "precached shell resource"),
        Err(e) => warn!(%path, "failed to precache shell resource: {}", e),
      }
    }

    self.set_phase(WorkerPhase::Waiting);
    Ok(())
  }

  async fn precache_one(&self, path: &str) -> Result<()> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))?;
    let request = Request {
      method: Method::Get,
      url: url.clone(),
      headers: Default::default(),
      body: None,
    };

    let response = self.tracked_fetch(request).await?;
    if !response.is_success() {
      return Err(eyre!("unexpected status {}", response.status));
    }

    let key = request_key(Method::Get, &url);
    self.store.put(&self.static_generation, &key, &response)
  }

  /// Delete every generation whose name does not match the current version
  /// tags, then take control of traffic.
  pub fn activate(&self) -> Result<()> {
    match self.phase() {
      WorkerPhase::Waiting | WorkerPhase::Active => {}
      phase => return Err(eyre!("activate is only valid from Waiting, current phase {:?}", phase)),
    }

    for generation in self.store.generations()? {
      if generation != self.static_generation && generation != self.dynamic_generation {
        debug!(%generation, "removing stale cache generation");
        self.store.delete_generation(&generation)?;
      }
    }

    self.set_phase(WorkerPhase::Active);
    Ok(())
  }

  pub fn handle_message(&self, message: ControlMessage) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => {
        if self.phase() == WorkerPhase::Waiting {
          self.activate()?;
        }
        Ok(())
      }
      ControlMessage::ClearCache => self.store.purge_all(),
    }
  }

  /// Stop intercepting. Terminal; a new manager must be constructed to
  /// resume.
  pub fn terminate(&self) {
    self.set_phase(WorkerPhase::Terminated);
  }

  /// Resolve one outgoing request through the active caching strategy.
  ///
  /// Until the manager is active (and after termination) everything is
  /// forwarded to the network untouched.
  pub async fn intercept(&self, request: Request) -> Result<Response> {
    if self.phase() != WorkerPhase::Active {
      return self.tracked_fetch(request).await;
    }

    match self.classify(&request) {
      RouteClass::Passthrough => self.tracked_fetch(request).await,
      RouteClass::CacheFirst => self.cache_first(request).await,
      RouteClass::NetworkFirst => self.network_first(request).await,
    }
  }

  fn classify(&self, request: &Request) -> RouteClass {
    if request.method != Method::Get {
      return RouteClass::Passthrough;
    }
    if request.url.origin() != self.origin.origin() {
      return RouteClass::Passthrough;
    }
    if request.url.path().starts_with(&self.api_prefix) {
      RouteClass::NetworkFirst
    } else {
      RouteClass::CacheFirst
    }
  }

  /// Static assets: serve from cache immediately, refresh in the background.
  async fn cache_first(&self, request: Request) -> Result<Response> {
    let key = request_key(request.method, &request.url);

    if let Some(cached) = self.store.get(&self.static_generation, &key)? {
      // Stale-while-revalidate: one background refresh per served request
      self.spawn_revalidate(request, key);
      return Ok(cached.response);
    }

    match self.tracked_fetch(request.clone()).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = self.store.put(&self.static_generation, &key, &response) {
            warn!("failed to cache static response: {}", e);
          }
        }
        Ok(response)
      }
      Err(network_err) => {
        // Total failure: fall back to the designated offline document
        let fallback_url = self
          .origin
          .join(&self.offline_document)
          .map_err(|e| eyre!("Invalid offline document path: {}", e))?;
        let fallback_key = request_key(Method::Get, &fallback_url);

        match self.store.get(&self.static_generation, &fallback_key)? {
          Some(cached) => {
            debug!(url = %request.url, "serving offline fallback document");
            Ok(cached.response)
          }
          None => Err(network_err),
        }
      }
    }
  }

  fn spawn_revalidate(&self, request: Request, key: String) {
    let fetcher = Arc::clone(&self.fetcher);
    let store = Arc::clone(&self.store);
    let generation = self.static_generation.clone();

    tokio::spawn(async move {
      match fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = store.put(&generation, &key, &response) {
            debug!("background refresh store failed: {}", e);
          }
        }
        Ok(response) => debug!(status = response.status, "background refresh not stored"),
        Err(e) => debug!("background refresh failed: {}", e),
      }
    });
  }

  /// API routes: try the network, fall back to the dynamic generation, then
  /// to the terminal offline payload.
  async fn network_first(&self, request: Request) -> Result<Response> {
    let key = request_key(request.method, &request.url);
    let path = request.url.path().to_string();

    match self.tracked_fetch(request).await {
      Ok(response) => {
        if response.is_success() && self.is_cacheable_route(&path) {
          if let Err(e) = self.store.put(&self.dynamic_generation, &key, &response) {
            warn!("failed to cache API response: {}", e);
          }
        }
        Ok(response)
      }
      Err(network_err) => match self.store.get(&self.dynamic_generation, &key)? {
        Some(cached) => {
          debug!(%path, "network failed, serving cached API response");
          let mut response = cached.response;
          response.set_header(SERVED_FROM_HEADER, "cache");
          Ok(response)
        }
        None => {
          debug!(%path, "offline with no cached copy: {}", network_err);
          Ok(Response::json_error(
            503,
            "offline",
            "You appear to be offline and this content has not been cached.",
          ))
        }
      },
    }
  }

  fn is_cacheable_route(&self, path: &str) -> bool {
    self.cacheable_routes.iter().any(|route| path.starts_with(route))
  }

  async fn tracked_fetch(&self, request: Request) -> Result<Response> {
    let Some(tracker) = &self.tracker else {
      return self.fetcher.fetch(request).await;
    };

    let id = tracker.start(request.url.as_str(), request.method.as_str());
    let result = self.fetcher.fetch(request).await;
    tracker.end_with(id, result.is_ok());
    result
  }
}
