//! Network-interception cache layer for offline support.
//!
//! This module decides, per request class, whether a request is served from
//! cache, the network, or a blended strategy:
//! - static assets are cache-first with background revalidation
//! - allow-listed API routes are network-first with a cached fallback
//! - everything else passes through untouched
//!
//! Cached responses live in named, versioned generations that are replaced
//! wholesale when the version tag changes.

mod manager;
mod storage;

pub use manager::{CacheManager, ControlMessage, WorkerEvent, WorkerPhase, SERVED_FROM_HEADER};
pub use storage::{request_key, CacheStore, CachedResponse, NoopCacheStore, SqliteCacheStore};
