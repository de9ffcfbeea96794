//! Versioned schema for the persistent store.
//!
//! Each entry declares the tables and indexes introduced at that version.
//! Opening a store applies every batch past the database's current
//! `user_version`, in order, so old databases upgrade sequentially while
//! preserving existing rows.

/// Ordered (version, batch) pairs. Forward-only; batches are never edited
/// after release, only appended.
pub const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1), (2, SCHEMA_V2), (3, SCHEMA_V3)];

/// The schema version a freshly opened store ends up at.
pub const CURRENT_VERSION: i64 = 3;

const SCHEMA_V1: &str = r#"
-- Journey state: a singleton row addressed by one fixed id
CREATE TABLE journey (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE bookmarks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    topic_slug TEXT NOT NULL,
    category_slug TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX idx_bookmarks_kind ON bookmarks(kind);
CREATE INDEX idx_bookmarks_title ON bookmarks(title);
CREATE INDEX idx_bookmarks_topic ON bookmarks(topic_slug);
CREATE INDEX idx_bookmarks_category ON bookmarks(category_slug);

CREATE TABLE progress (
    topic_slug TEXT NOT NULL,
    section_slug TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (topic_slug, section_slug)
);

CREATE INDEX idx_progress_topic ON progress(topic_slug);
CREATE INDEX idx_progress_section ON progress(section_slug);
CREATE INDEX idx_progress_completed ON progress(completed_at);

-- Durable flags (e.g. the legacy migration marker)
CREATE TABLE meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SCHEMA_V2: &str = r#"
CREATE TABLE offline_content (
    slug TEXT PRIMARY KEY,
    updated_at TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX idx_offline_content_updated ON offline_content(updated_at);
"#;

const SCHEMA_V3: &str = r#"
-- Write-ahead queue for optimistic mutations awaiting durable persistence
CREATE TABLE sync_outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;
