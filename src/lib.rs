//! Offline resilience layer for a learning application.
//!
//! `holdfast` keeps an application usable without a network connection:
//! a versioned cache worker serves the application shell and remembers API
//! responses, a SQLite-backed store holds user state durably, an optimistic
//! sync engine applies writes locally first and reconciles with the server
//! when it can, and a latency tracker turns in-flight requests into honest
//! progress signals.
//!
//! [`context::OfflineContext`] wires the pieces together; each module also
//! stands alone behind trait seams for embedding and testing.

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod migrate;
pub mod store;
pub mod sync;
pub mod tracker;

pub use cache::{CacheManager, ControlMessage, WorkerEvent, WorkerPhase};
pub use config::Config;
pub use context::OfflineContext;
pub use store::PersistentStore;
pub use sync::SyncEngine;
pub use tracker::ActivityTracker;
