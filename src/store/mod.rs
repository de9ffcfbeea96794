//! Versioned, indexed local store replacing ad-hoc flat key-value blobs.
//!
//! Records are serialized as JSON blobs alongside real columns for every
//! secondary index, so lookups stay queryable while the payload schema can
//! evolve freely. Schema evolution is forward-only: see [`schema`].

pub mod records;
mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use records::{
  BookmarkRecord, JourneyState, OfflineContent, OutboxEntry, ProgressRecord, JOURNEY_ROW_ID,
};

/// Durable, transactional store for journey state, bookmarks, progress,
/// offline content, and the sync outbox.
///
/// Writes are serialized through one connection; a multi-table transaction
/// blocks other writers until commit, so readers never observe a partially
/// applied logical update.
pub struct PersistentStore {
  conn: Mutex<Connection>,
}

impl PersistentStore {
  /// Open or create the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory store. Used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    upgrade(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("holdfast").join("store.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// The schema version this store is currently at.
  pub fn schema_version(&self) -> Result<i64> {
    let conn = self.lock()?;
    current_version(&conn)
  }

  /// Run a multi-table transaction. Either every write in `f` becomes
  /// visible at once, or none of them do.
  pub fn transaction<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
    let conn = self.lock()?;
    conn
      .execute_batch("BEGIN IMMEDIATE")
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let tx = StoreTx { conn: &conn };
    match f(&tx) {
      Ok(value) => {
        conn
          .execute_batch("COMMIT")
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(value)
      }
      Err(err) => {
        let _ = conn.execute_batch("ROLLBACK");
        Err(err)
      }
    }
  }

  // Journey (singleton row)

  pub fn get_journey(&self) -> Result<Option<JourneyState>> {
    get_journey(&*self.lock()?)
  }

  pub fn put_journey(&self, state: &JourneyState) -> Result<()> {
    put_journey(&*self.lock()?, state)
  }

  pub fn clear_journey(&self) -> Result<()> {
    clear_journey(&*self.lock()?)
  }

  // Bookmarks

  pub fn get_bookmark(&self, id: &str) -> Result<Option<BookmarkRecord>> {
    get_bookmark(&*self.lock()?, id)
  }

  pub fn put_bookmark(&self, bookmark: &BookmarkRecord) -> Result<()> {
    put_bookmark(&*self.lock()?, bookmark)
  }

  pub fn bulk_put_bookmarks(&self, bookmarks: &[BookmarkRecord]) -> Result<()> {
    self.transaction(|tx| {
      for bookmark in bookmarks {
        tx.put_bookmark(bookmark)?;
      }
      Ok(())
    })
  }

  pub fn delete_bookmark(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM bookmarks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete bookmark {}: {}", id, e))?;
    Ok(())
  }

  pub fn bookmarks(&self) -> Result<Vec<BookmarkRecord>> {
    let conn = self.lock()?;
    query_records(&conn, "SELECT data FROM bookmarks ORDER BY id", params![])
  }

  pub fn bookmarks_by_kind(&self, kind: &str) -> Result<Vec<BookmarkRecord>> {
    let conn = self.lock()?;
    query_records(
      &conn,
      "SELECT data FROM bookmarks WHERE kind = ? ORDER BY id",
      params![kind],
    )
  }

  pub fn bookmarks_for_topic(&self, topic_slug: &str) -> Result<Vec<BookmarkRecord>> {
    let conn = self.lock()?;
    query_records(
      &conn,
      "SELECT data FROM bookmarks WHERE topic_slug = ? ORDER BY id",
      params![topic_slug],
    )
  }

  pub fn clear_bookmarks(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM bookmarks", [])
      .map_err(|e| eyre!("Failed to clear bookmarks: {}", e))?;
    Ok(())
  }

  // Progress (composite key)

  pub fn get_progress(&self, topic_slug: &str, section_slug: &str) -> Result<Option<ProgressRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM progress WHERE topic_slug = ? AND section_slug = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let data: Option<Vec<u8>> = stmt
      .query_row(params![topic_slug, section_slug], |row| row.get(0))
      .ok();

    match data {
      Some(data) => Ok(Some(
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize progress: {}", e))?,
      )),
      None => Ok(None),
    }
  }

  pub fn put_progress(&self, progress: &ProgressRecord) -> Result<()> {
    put_progress(&*self.lock()?, progress)
  }

  pub fn bulk_put_progress(&self, records: &[ProgressRecord]) -> Result<()> {
    self.transaction(|tx| {
      for record in records {
        put_progress(tx.conn, record)?;
      }
      Ok(())
    })
  }

  pub fn delete_progress(&self, topic_slug: &str, section_slug: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM progress WHERE topic_slug = ? AND section_slug = ?",
        params![topic_slug, section_slug],
      )
      .map_err(|e| eyre!("Failed to delete progress: {}", e))?;
    Ok(())
  }

  pub fn progress_for_topic(&self, topic_slug: &str) -> Result<Vec<ProgressRecord>> {
    let conn = self.lock()?;
    query_records(
      &conn,
      "SELECT data FROM progress WHERE topic_slug = ? ORDER BY section_slug",
      params![topic_slug],
    )
  }

  pub fn clear_progress(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM progress", [])
      .map_err(|e| eyre!("Failed to clear progress: {}", e))?;
    Ok(())
  }

  // Offline content (schema v2)

  pub fn get_offline_content(&self, slug: &str) -> Result<Option<OfflineContent>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM offline_content WHERE slug = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let data: Option<Vec<u8>> = stmt.query_row(params![slug], |row| row.get(0)).ok();

    match data {
      Some(data) => Ok(Some(
        serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize offline content: {}", e))?,
      )),
      None => Ok(None),
    }
  }

  pub fn put_offline_content(&self, content: &OfflineContent) -> Result<()> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(content)
      .map_err(|e| eyre!("Failed to serialize offline content: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO offline_content (slug, updated_at, data) VALUES (?, ?, ?)",
        params![content.slug, content.updated_at.to_rfc3339(), data],
      )
      .map_err(|e| eyre!("Failed to store offline content: {}", e))?;
    Ok(())
  }

  /// Content updated after the given instant, most recent first.
  pub fn offline_content_since(&self, since: DateTime<Utc>) -> Result<Vec<OfflineContent>> {
    let conn = self.lock()?;
    query_records(
      &conn,
      "SELECT data FROM offline_content WHERE updated_at > ? ORDER BY updated_at DESC",
      params![since.to_rfc3339()],
    )
  }

  pub fn clear_offline_content(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM offline_content", [])
      .map_err(|e| eyre!("Failed to clear offline content: {}", e))?;
    Ok(())
  }

  // Meta flags

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    get_meta(&*self.lock()?, key)
  }

  pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
    put_meta(&*self.lock()?, key, value)
  }

  // Sync outbox (schema v3)

  pub fn outbox_append(&self, kind: &str, payload: &[u8]) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO sync_outbox (kind, payload) VALUES (?, ?)",
        params![kind, payload],
      )
      .map_err(|e| eyre!("Failed to append to outbox: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  /// Pending entries in queue order.
  pub fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT seq, kind, payload, queued_at, attempts FROM sync_outbox ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let entries = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Vec<u8>>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, u32>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .filter_map(|r| r.ok())
      .map(|(seq, kind, payload, queued_at, attempts)| {
        Ok(OutboxEntry {
          seq,
          kind,
          payload,
          queued_at: parse_datetime(&queued_at)?,
          attempts,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(entries)
  }

  pub fn outbox_delete(&self, seq: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_outbox WHERE seq = ?", params![seq])
      .map_err(|e| eyre!("Failed to delete outbox entry {}: {}", seq, e))?;
    Ok(())
  }

  pub fn outbox_bump_attempts(&self, seq: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE sync_outbox SET attempts = attempts + 1 WHERE seq = ?",
        params![seq],
      )
      .map_err(|e| eyre!("Failed to bump outbox attempts for {}: {}", seq, e))?;
    Ok(())
  }

  pub fn outbox_clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_outbox", [])
      .map_err(|e| eyre!("Failed to clear outbox: {}", e))?;
    Ok(())
  }
}

/// Write handle passed to [`PersistentStore::transaction`] closures. Offers
/// the same operations as the store but inside the open transaction.
pub struct StoreTx<'a> {
  conn: &'a Connection,
}

impl StoreTx<'_> {
  pub fn get_journey(&self) -> Result<Option<JourneyState>> {
    get_journey(self.conn)
  }

  pub fn put_journey(&self, state: &JourneyState) -> Result<()> {
    put_journey(self.conn, state)
  }

  pub fn clear_journey(&self) -> Result<()> {
    clear_journey(self.conn)
  }

  pub fn put_bookmark(&self, bookmark: &BookmarkRecord) -> Result<()> {
    put_bookmark(self.conn, bookmark)
  }

  pub fn put_progress(&self, progress: &ProgressRecord) -> Result<()> {
    put_progress(self.conn, progress)
  }

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    get_meta(self.conn, key)
  }

  pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
    put_meta(self.conn, key, value)
  }
}

// Shared row-level operations, usable both through the store lock and inside
// an open transaction.

fn current_version(conn: &Connection) -> Result<i64> {
  conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

fn upgrade(conn: &Connection) -> Result<()> {
  let mut version = current_version(conn)?;

  for (target, batch) in schema::MIGRATIONS {
    if version < *target {
      conn
        .execute_batch(batch)
        .map_err(|e| eyre!("Failed to apply schema v{}: {}", target, e))?;
      conn
        .pragma_update(None, "user_version", target)
        .map_err(|e| eyre!("Failed to record schema v{}: {}", target, e))?;
      version = *target;
    }
  }

  Ok(())
}

fn get_journey(conn: &Connection) -> Result<Option<JourneyState>> {
  let mut stmt = conn
    .prepare("SELECT data FROM journey WHERE id = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let data: Option<Vec<u8>> = stmt.query_row(params![JOURNEY_ROW_ID], |row| row.get(0)).ok();

  match data {
    Some(data) => Ok(Some(
      serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize journey: {}", e))?,
    )),
    None => Ok(None),
  }
}

fn put_journey(conn: &Connection, state: &JourneyState) -> Result<()> {
  let data = serde_json::to_vec(state).map_err(|e| eyre!("Failed to serialize journey: {}", e))?;
  conn
    .execute(
      "INSERT OR REPLACE INTO journey (id, data) VALUES (?, ?)",
      params![JOURNEY_ROW_ID, data],
    )
    .map_err(|e| eyre!("Failed to store journey: {}", e))?;
  Ok(())
}

fn clear_journey(conn: &Connection) -> Result<()> {
  conn
    .execute("DELETE FROM journey WHERE id = ?", params![JOURNEY_ROW_ID])
    .map_err(|e| eyre!("Failed to clear journey: {}", e))?;
  Ok(())
}

fn get_bookmark(conn: &Connection, id: &str) -> Result<Option<BookmarkRecord>> {
  let mut stmt = conn
    .prepare("SELECT data FROM bookmarks WHERE id = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let data: Option<Vec<u8>> = stmt.query_row(params![id], |row| row.get(0)).ok();

  match data {
    Some(data) => Ok(Some(
      serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize bookmark: {}", e))?,
    )),
    None => Ok(None),
  }
}

fn put_bookmark(conn: &Connection, bookmark: &BookmarkRecord) -> Result<()> {
  let data =
    serde_json::to_vec(bookmark).map_err(|e| eyre!("Failed to serialize bookmark: {}", e))?;
  conn
    .execute(
      "INSERT OR REPLACE INTO bookmarks (id, kind, title, topic_slug, category_slug, data)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        bookmark.id,
        bookmark.kind,
        bookmark.title,
        bookmark.topic_slug,
        bookmark.category_slug,
        data
      ],
    )
    .map_err(|e| eyre!("Failed to store bookmark {}: {}", bookmark.id, e))?;
  Ok(())
}

fn put_progress(conn: &Connection, progress: &ProgressRecord) -> Result<()> {
  let data =
    serde_json::to_vec(progress).map_err(|e| eyre!("Failed to serialize progress: {}", e))?;
  conn
    .execute(
      "INSERT OR REPLACE INTO progress (topic_slug, section_slug, completed_at, data)
       VALUES (?, ?, ?, ?)",
      params![
        progress.topic_slug,
        progress.section_slug,
        progress.completed_at.to_rfc3339(),
        data
      ],
    )
    .map_err(|e| eyre!("Failed to store progress: {}", e))?;
  Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
  let mut stmt = conn
    .prepare("SELECT value FROM meta WHERE key = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  Ok(stmt.query_row(params![key], |row| row.get(0)).ok())
}

fn put_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
      params![key, value],
    )
    .map_err(|e| eyre!("Failed to store meta {}: {}", key, e))?;
  Ok(())
}

fn query_records<T: serde::de::DeserializeOwned>(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<T>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let records = stmt
    .query_map(params, |row| {
      let data: Vec<u8> = row.get(0)?;
      Ok(data)
    })
    .map_err(|e| eyre!("Failed to query records: {}", e))?
    .filter_map(|r| r.ok())
    .filter_map(|data| serde_json::from_slice(&data).ok())
    .collect();

  Ok(records)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
