//! In-flight request registry with per-endpoint latency estimation.
//!
//! Each observed request contributes to an exponentially weighted moving
//! average keyed by its normalized path, so instance-specific requests
//! (item 42 vs. item 99) share one estimate. The derived pending count, ETA,
//! and progress percentage drive the UI's progress indicator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

use crate::config::TrackerConfig;

/// Handle to one in-flight request, returned by [`ActivityTracker::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Handle to a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct InFlight {
  key: String,
  started_at: Instant,
}

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
  next_request: u64,
  next_subscription: u64,
  in_flight: HashMap<u64, InFlight>,
  /// EWMA per normalized key, in milliseconds.
  estimates: HashMap<String, f64>,
  subscribers: HashMap<u64, ChangeCallback>,
}

/// Registry of in-flight network operations.
///
/// Mutations happen only at request start/end call sites; entries for
/// different ids never race because each owns a distinct slot.
pub struct ActivityTracker {
  config: TrackerConfig,
  inner: Mutex<Inner>,
}

impl ActivityTracker {
  pub fn new(config: TrackerConfig) -> Self {
    Self {
      config,
      inner: Mutex::new(Inner {
        next_request: 1,
        next_subscription: 1,
        in_flight: HashMap::new(),
        estimates: HashMap::new(),
        subscribers: HashMap::new(),
      }),
    }
  }

  /// Register a request as in-flight and notify subscribers.
  pub fn start(&self, url: &str, method: &str) -> RequestId {
    let _ = method; // methods share one estimate per path
    let key = normalize_path(url);
    let id = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      let id = inner.next_request;
      inner.next_request += 1;
      inner.in_flight.insert(
        id,
        InFlight {
          key,
          started_at: Instant::now(),
        },
      );
      id
    };
    self.notify();
    RequestId(id)
  }

  /// Finish a successful request. Unknown or already-ended ids are a no-op.
  pub fn end(&self, id: RequestId) {
    self.end_with(id, true);
  }

  /// Finish a request, recording its duration into the EWMA only when it
  /// succeeded. Unknown or already-ended ids are a no-op.
  pub fn end_with(&self, id: RequestId, success: bool) {
    let removed = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      inner.in_flight.remove(&id.0)
    };
    let Some(entry) = removed else {
      return;
    };
    if success {
      self.observe(&entry.key, entry.started_at.elapsed());
    }
    self.notify();
  }

  /// Fold one observed duration into the key's estimate. Durations are
  /// floored at the configured minimum so degenerate zero-duration samples
  /// cannot collapse the average.
  fn observe(&self, key: &str, elapsed: Duration) {
    let sample = (elapsed.as_millis() as f64).max(self.config.min_sample_ms as f64);
    let alpha = self.config.smoothing;
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    let estimate = inner
      .estimates
      .entry(key.to_string())
      .or_insert(sample);
    *estimate = alpha * sample + (1.0 - alpha) * *estimate;
  }

  /// Current latency estimate for a URL, or the configured default when the
  /// normalized key has no history yet.
  pub fn estimate(&self, url: &str) -> Duration {
    let key = normalize_path(url);
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    let millis = inner
      .estimates
      .get(&key)
      .copied()
      .unwrap_or(self.config.default_estimate_ms as f64);
    Duration::from_millis(millis.round() as u64)
  }

  /// Number of requests currently in flight.
  pub fn pending_count(&self) -> usize {
    self.inner.lock().unwrap_or_else(|e| e.into_inner()).in_flight.len()
  }

  /// Expected time until the slowest in-flight request completes: the max of
  /// `estimate - elapsed` over all entries, floored at zero.
  pub fn eta(&self) -> Duration {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner
      .in_flight
      .values()
      .map(|entry| {
        let estimate = inner
          .estimates
          .get(&entry.key)
          .copied()
          .unwrap_or(self.config.default_estimate_ms as f64);
        let elapsed = entry.started_at.elapsed().as_millis() as f64;
        Duration::from_millis((estimate - elapsed).max(0.0).round() as u64)
      })
      .max()
      .unwrap_or(Duration::ZERO)
  }

  /// Heuristic completion percentage for the progress indicator. 100 when
  /// idle, otherwise the ETA mapped against a fixed ceiling and clamped to a
  /// visible minimum so the indicator never appears stalled at 0%.
  pub fn progress_percent(&self) -> u8 {
    if self.pending_count() == 0 {
      return 100;
    }
    let eta = self.eta().as_millis() as f64;
    let ceiling = self.config.eta_ceiling_ms as f64;
    let percent = ((1.0 - eta / ceiling) * 100.0).round();
    (percent as i64).clamp(self.config.min_progress as i64, 99) as u8
  }

  /// Register a callback invoked after every registry change.
  pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    let id = inner.next_subscription;
    inner.next_subscription += 1;
    inner.subscribers.insert(id, Arc::new(callback));
    SubscriptionId(id)
  }

  pub fn unsubscribe(&self, id: SubscriptionId) {
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.subscribers.remove(&id.0);
  }

  /// Remove in-flight entries older than `max_age` and return how many were
  /// dropped. A request whose end call never arrives would otherwise leak
  /// its entry forever.
  pub fn reap(&self, max_age: Duration) -> usize {
    let dropped = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      let before = inner.in_flight.len();
      inner.in_flight.retain(|_, entry| entry.started_at.elapsed() <= max_age);
      before - inner.in_flight.len()
    };
    if dropped > 0 {
      self.notify();
    }
    dropped
  }

  fn notify(&self) {
    // Clone the callbacks out so subscribers may call back into the tracker
    let callbacks: Vec<ChangeCallback> = {
      let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      inner.subscribers.values().cloned().collect()
    };
    for callback in callbacks {
      callback();
    }
  }
}

/// Tracking key for a URL: its path with every maximal run of digits
/// replaced by a placeholder.
pub fn normalize_path(url: &str) -> String {
  let path = match Url::parse(url) {
    Ok(parsed) => parsed.path().to_string(),
    // Not an absolute URL; treat everything before the query as the path
    Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
  };

  let mut normalized = String::with_capacity(path.len());
  let mut in_digits = false;
  for ch in path.chars() {
    if ch.is_ascii_digit() {
      if !in_digits {
        normalized.push_str(":n");
        in_digits = true;
      }
    } else {
      normalized.push(ch);
      in_digits = false;
    }
  }
  normalized
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn normalizes_digit_runs_to_one_key() {
    assert_eq!(normalize_path("/api/items/42"), "/api/items/:n");
    assert_eq!(
      normalize_path("https://example.com/api/items/42/sections/7?x=1"),
      "/api/items/:n/sections/:n"
    );
    assert_eq!(normalize_path("/api/items/42"), normalize_path("/api/items/99"));
    assert_eq!(normalize_path("/api/topics"), "/api/topics");
  }

  #[test]
  fn estimate_defaults_without_history() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    assert_eq!(tracker.estimate("/api/items/42"), Duration::from_millis(800));
  }

  #[test]
  fn first_sample_sets_the_estimate_exactly() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    tracker.observe("/api/items/:n", Duration::from_millis(120));
    assert_eq!(tracker.estimate("/api/items/7"), Duration::from_millis(120));
  }

  #[test]
  fn ewma_stays_strictly_between_min_and_max() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    let durations = [100u64, 300, 200, 500];
    for d in durations {
      tracker.observe("/api/items/:n", Duration::from_millis(d));
    }

    let estimate = tracker.estimate("/api/items/1").as_millis() as u64;
    assert!(estimate > *durations.iter().min().unwrap());
    assert!(estimate < *durations.iter().max().unwrap());
  }

  #[test]
  fn samples_are_floored_at_the_minimum() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    tracker.observe("/ping", Duration::ZERO);
    assert_eq!(tracker.estimate("/ping"), Duration::from_millis(10));
  }

  #[test]
  fn ending_an_unknown_id_is_a_noop() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    let id = tracker.start("/api/items/1", "GET");
    tracker.end(id);

    // Same id again, and a never-issued id: nothing changes, nothing panics
    tracker.end(id);
    tracker.end_with(RequestId(9999), false);
    assert_eq!(tracker.pending_count(), 0);
  }

  #[test]
  fn pending_count_follows_start_and_end() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    let a = tracker.start("/api/items/1", "GET");
    let b = tracker.start("/api/topics", "GET");
    assert_eq!(tracker.pending_count(), 2);

    tracker.end(a);
    assert_eq!(tracker.pending_count(), 1);
    tracker.end_with(b, false);
    assert_eq!(tracker.pending_count(), 0);
  }

  #[test]
  fn failed_requests_leave_the_estimate_untouched() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    let id = tracker.start("/api/items/1", "GET");
    tracker.end_with(id, false);
    assert_eq!(tracker.estimate("/api/items/1"), Duration::from_millis(800));
  }

  #[test]
  fn progress_is_clamped_and_completes_at_idle() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    assert_eq!(tracker.progress_percent(), 100);

    let id = tracker.start("/api/items/1", "GET");
    let percent = tracker.progress_percent();
    assert!(percent >= 5 && percent < 100);

    tracker.end(id);
    assert_eq!(tracker.progress_percent(), 100);
  }

  #[test]
  fn eta_never_goes_negative() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    // A key whose estimate is tiny compared to elapsed time
    tracker.observe("/api/slow", Duration::from_millis(10));
    let id = tracker.start("/api/slow", "GET");
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(tracker.eta(), Duration::ZERO);
    tracker.end(id);
  }

  #[test]
  fn subscribers_are_notified_until_unsubscribed() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);

    let sub = tracker.subscribe(move || {
      calls_clone.fetch_add(1, Ordering::SeqCst);
    });

    let id = tracker.start("/api/items/1", "GET");
    tracker.end(id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tracker.unsubscribe(sub);
    let id = tracker.start("/api/items/2", "GET");
    tracker.end(id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn reap_drops_leaked_entries() {
    let tracker = ActivityTracker::new(TrackerConfig::default());
    tracker.start("/api/items/1", "GET");
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(tracker.reap(Duration::from_millis(5)), 1);
    assert_eq!(tracker.pending_count(), 0);
    assert_eq!(tracker.reap(Duration::from_millis(5)), 0);
  }
}
