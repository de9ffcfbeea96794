//! Record types stored in the persistent store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed key of the journey singleton row. At most one row ever exists.
pub const JOURNEY_ROW_ID: &str = "journey";

/// The user's journey through the content: chosen path, experience level,
/// goals, and onboarding status. One logical record per installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneyState {
  pub path_id: Option<String>,
  pub experience_level: Option<String>,
  #[serde(default)]
  pub goals: Vec<String>,
  #[serde(default)]
  pub onboarding_completed: bool,
  pub onboarding_completed_at: Option<DateTime<Utc>>,
  pub last_path_change: Option<DateTime<Utc>>,
}

/// A saved bookmark, unique by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkRecord {
  pub id: String,
  pub kind: String,
  pub title: String,
  pub topic_slug: String,
  pub category_slug: String,
  pub created_at: DateTime<Utc>,
}

/// Per-section completion, keyed by (topic_slug, section_slug).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
  pub topic_slug: String,
  pub section_slug: String,
  pub completed_at: DateTime<Utc>,
}

/// Content cached for offline reading, keyed by slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineContent {
  pub slug: String,
  pub title: String,
  pub body: String,
  pub updated_at: DateTime<Utc>,
}

/// A queued mutation awaiting durable persistence.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
  pub seq: i64,
  pub kind: String,
  pub payload: Vec<u8>,
  pub queued_at: DateTime<Utc>,
  pub attempts: u32,
}
