//! One-time migration of legacy flat key-value data into the structured store.
//!
//! Earlier releases kept a preferences blob and a bookmark array as opaque
//! JSON strings in flat storage. [`LegacyMigrator::run`] moves both into the
//! persistent store inside a single cross-table transaction, guarded by a
//! durable completed-flag so it happens at most once. Removing the flat keys
//! is a separate step ([`LegacyMigrator::cleanup`]) that is never chained
//! automatically, so both storage forms may coexist during a grace period.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::store::records::{BookmarkRecord, JourneyState};
use crate::store::PersistentStore;

/// Flat key holding the serialized journey preferences blob.
pub const LEGACY_JOURNEY_KEY: &str = "journey_preferences";
/// Flat key holding the serialized bookmark array.
pub const LEGACY_BOOKMARKS_KEY: &str = "saved_bookmarks";

/// Meta flag set once migration has processed every legacy key.
const MIGRATED_FLAG: &str = "legacy_migration_completed";

/// Abstraction over the legacy flat key-value storage.
pub trait LegacyStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;
  fn remove(&self, key: &str) -> Result<()>;
}

/// Legacy flat storage persisted as a single JSON object on disk.
pub struct JsonFileLegacyStore {
  path: PathBuf,
  entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileLegacyStore {
  pub fn open(path: &Path) -> Result<Self> {
    let entries = if path.exists() {
      let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read legacy storage {}: {}", path.display(), e))?;
      serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse legacy storage {}: {}", path.display(), e))?
    } else {
      BTreeMap::new()
    };

    Ok(Self {
      path: path.to_path_buf(),
      entries: Mutex::new(entries),
    })
  }

  fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
    let contents = serde_json::to_string_pretty(entries)
      .map_err(|e| eyre!("Failed to serialize legacy storage: {}", e))?;
    std::fs::write(&self.path, contents)
      .map_err(|e| eyre!("Failed to write legacy storage {}: {}", self.path.display(), e))?;
    Ok(())
  }
}

impl LegacyStore for JsonFileLegacyStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if entries.remove(key).is_some() {
      self.persist(&entries)?;
    }
    Ok(())
  }
}

// Legacy wire shapes. Field names follow the old flat-storage format.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyJourney {
  path_id: Option<String>,
  experience_level: Option<String>,
  #[serde(default)]
  goals: Vec<String>,
  #[serde(default)]
  onboarding_completed: bool,
  onboarding_completed_at: Option<DateTime<Utc>>,
  last_path_change: Option<DateTime<Utc>>,
}

impl From<LegacyJourney> for JourneyState {
  fn from(legacy: LegacyJourney) -> Self {
    Self {
      path_id: legacy.path_id,
      experience_level: legacy.experience_level,
      goals: legacy.goals,
      onboarding_completed: legacy.onboarding_completed,
      onboarding_completed_at: legacy.onboarding_completed_at,
      last_path_change: legacy.last_path_change,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBookmark {
  id: String,
  #[serde(rename = "type")]
  kind: String,
  title: String,
  topic_slug: String,
  #[serde(default)]
  category_slug: String,
  created_at: Option<DateTime<Utc>>,
}

impl From<LegacyBookmark> for BookmarkRecord {
  fn from(legacy: LegacyBookmark) -> Self {
    Self {
      id: legacy.id,
      kind: legacy.kind,
      title: legacy.title,
      topic_slug: legacy.topic_slug,
      category_slug: legacy.category_slug,
      created_at: legacy.created_at.unwrap_or_else(Utc::now),
    }
  }
}

/// What a migration run did, mostly for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
  /// False when the completed-flag was already set and nothing ran.
  pub ran: bool,
  pub journey_migrated: bool,
  pub bookmarks_migrated: usize,
  /// Legacy keys whose contents could not be parsed and were skipped.
  pub skipped_keys: Vec<String>,
}

pub struct LegacyMigrator;

impl LegacyMigrator {
  /// Transfer legacy flat data into the store, at most once.
  ///
  /// A parse failure on one key is logged and skipped, never aborting the
  /// migration of the others. The journey insert is skipped when a singleton
  /// row already exists. The completed-flag is written inside the same
  /// transaction, after all keys are processed.
  pub fn run(store: &PersistentStore, legacy: &dyn LegacyStore) -> Result<MigrationReport> {
    if store.get_meta(MIGRATED_FLAG)?.as_deref() == Some("true") {
      debug!("legacy migration already completed, skipping");
      return Ok(MigrationReport::default());
    }

    let journey_raw = legacy.get(LEGACY_JOURNEY_KEY)?;
    let bookmarks_raw = legacy.get(LEGACY_BOOKMARKS_KEY)?;

    let mut report = MigrationReport {
      ran: true,
      ..Default::default()
    };

    store.transaction(|tx| {
      if let Some(raw) = &journey_raw {
        match serde_json::from_str::<LegacyJourney>(raw) {
          Ok(journey) => {
            if tx.get_journey()?.is_none() {
              tx.put_journey(&journey.into())?;
              report.journey_migrated = true;
            } else {
              debug!("journey row already present, keeping it over legacy data");
            }
          }
          Err(e) => {
            warn!(key = LEGACY_JOURNEY_KEY, "skipping unparseable legacy record: {}", e);
            report.skipped_keys.push(LEGACY_JOURNEY_KEY.to_string());
          }
        }
      }

      if let Some(raw) = &bookmarks_raw {
        match serde_json::from_str::<Vec<LegacyBookmark>>(raw) {
          Ok(bookmarks) => {
            for bookmark in bookmarks {
              tx.put_bookmark(&bookmark.into())?;
              report.bookmarks_migrated += 1;
            }
          }
          Err(e) => {
            warn!(key = LEGACY_BOOKMARKS_KEY, "skipping unparseable legacy record: {}", e);
            report.skipped_keys.push(LEGACY_BOOKMARKS_KEY.to_string());
          }
        }
      }

      tx.put_meta(MIGRATED_FLAG, "true")
    })?;

    Ok(report)
  }

  /// Remove the legacy flat keys. Invoked independently of [`run`], after
  /// the grace period.
  ///
  /// [`run`]: LegacyMigrator::run
  pub fn cleanup(legacy: &dyn LegacyStore) -> Result<()> {
    legacy.remove(LEGACY_JOURNEY_KEY)?;
    legacy.remove(LEGACY_BOOKMARKS_KEY)?;
    Ok(())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::collections::HashMap;

  /// In-memory legacy storage for tests.
  pub(crate) struct MemoryLegacyStore {
    entries: Mutex<HashMap<String, String>>,
  }

  impl MemoryLegacyStore {
    pub(crate) fn new(entries: &[(&str, &str)]) -> Self {
      Self {
        entries: Mutex::new(
          entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ),
      }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
      self.entries.lock().unwrap().contains_key(key)
    }
  }

  impl LegacyStore for MemoryLegacyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
      Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
      self.entries.lock().unwrap().remove(key);
      Ok(())
    }
  }

  fn legacy_fixture() -> MemoryLegacyStore {
    MemoryLegacyStore::new(&[
      (
        LEGACY_JOURNEY_KEY,
        r#"{"pathId":"frontend","experienceLevel":"beginner","goals":["learn rust"],"onboardingCompleted":true}"#,
      ),
      (
        LEGACY_BOOKMARKS_KEY,
        r#"[
          {"id":"b1","type":"article","title":"Ownership","topicSlug":"rust-basics","categorySlug":"lang"},
          {"id":"b2","type":"video","title":"Lifetimes","topicSlug":"rust-basics","categorySlug":"lang"}
        ]"#,
      ),
    ])
  }

  #[test]
  fn migrates_journey_and_bookmarks() {
    let store = PersistentStore::open_in_memory().unwrap();
    let legacy = legacy_fixture();

    let report = LegacyMigrator::run(&store, &legacy).unwrap();
    assert!(report.ran);
    assert!(report.journey_migrated);
    assert_eq!(report.bookmarks_migrated, 2);
    assert!(report.skipped_keys.is_empty());

    let journey = store.get_journey().unwrap().unwrap();
    assert_eq!(journey.path_id.as_deref(), Some("frontend"));
    assert!(journey.onboarding_completed);
    assert_eq!(store.bookmarks().unwrap().len(), 2);
  }

  #[test]
  fn second_run_performs_zero_writes() {
    let store = PersistentStore::open_in_memory().unwrap();
    let legacy = legacy_fixture();

    LegacyMigrator::run(&store, &legacy).unwrap();
    let second = LegacyMigrator::run(&store, &legacy).unwrap();

    assert!(!second.ran);
    assert!(!second.journey_migrated);
    assert_eq!(second.bookmarks_migrated, 0);
    // Flag remains set and data is unchanged
    assert_eq!(store.bookmarks().unwrap().len(), 2);
  }

  #[test]
  fn parse_failure_on_one_key_never_aborts_the_others() {
    let store = PersistentStore::open_in_memory().unwrap();
    let legacy = MemoryLegacyStore::new(&[
      (LEGACY_JOURNEY_KEY, "{not json"),
      (
        LEGACY_BOOKMARKS_KEY,
        r#"[{"id":"b1","type":"article","title":"Ownership","topicSlug":"rust-basics"}]"#,
      ),
    ]);

    let report = LegacyMigrator::run(&store, &legacy).unwrap();
    assert!(report.ran);
    assert!(!report.journey_migrated);
    assert_eq!(report.bookmarks_migrated, 1);
    assert_eq!(report.skipped_keys, vec![LEGACY_JOURNEY_KEY.to_string()]);

    // Completed-flag is still set: the bad key was skipped, not retried
    assert!(!LegacyMigrator::run(&store, &legacy).unwrap().ran);
  }

  #[test]
  fn existing_journey_row_is_never_overwritten() {
    let store = PersistentStore::open_in_memory().unwrap();
    store
      .put_journey(&JourneyState {
        path_id: Some("backend".to_string()),
        ..Default::default()
      })
      .unwrap();

    let report = LegacyMigrator::run(&store, &legacy_fixture()).unwrap();
    assert!(!report.journey_migrated);
    assert_eq!(
      store.get_journey().unwrap().unwrap().path_id.as_deref(),
      Some("backend")
    );
  }

  #[test]
  fn cleanup_is_a_separate_step() {
    let store = PersistentStore::open_in_memory().unwrap();
    let legacy = legacy_fixture();

    LegacyMigrator::run(&store, &legacy).unwrap();
    // Migration alone leaves the flat keys in place
    assert!(legacy.contains(LEGACY_JOURNEY_KEY));
    assert!(legacy.contains(LEGACY_BOOKMARKS_KEY));

    LegacyMigrator::cleanup(&legacy).unwrap();
    assert!(!legacy.contains(LEGACY_JOURNEY_KEY));
    assert!(!legacy.contains(LEGACY_BOOKMARKS_KEY));
  }

  #[test]
  fn json_file_store_round_trips() {
    let dir = std::env::temp_dir().join(format!("holdfast-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("legacy.json");
    std::fs::write(&path, r#"{"journey_preferences":"{}"}"#).unwrap();

    let legacy = JsonFileLegacyStore::open(&path).unwrap();
    assert_eq!(legacy.get(LEGACY_JOURNEY_KEY).unwrap().as_deref(), Some("{}"));

    legacy.remove(LEGACY_JOURNEY_KEY).unwrap();
    assert!(legacy.get(LEGACY_JOURNEY_KEY).unwrap().is_none());

    // Removal was persisted to disk
    let reopened = JsonFileLegacyStore::open(&path).unwrap();
    assert!(reopened.get(LEGACY_JOURNEY_KEY).unwrap().is_none());

    std::fs::remove_dir_all(&dir).ok();
  }
}
