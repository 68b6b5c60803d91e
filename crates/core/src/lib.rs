//! karasync core library.
//!
//! Keeps local copies of karaoke content repositories in sync with their
//! origin: configuration, SQLite persistence, the patch and archive
//! transports, the git working-copy adapter, the commit planner, media
//! reconciliation, and the sync engine tying them together.

pub mod applier;
pub mod config;
pub mod db;
pub mod errors;
pub mod git;
pub mod lock;
pub mod media;
pub mod meta;
pub mod models;
pub mod patch;
pub mod planner;
pub mod remote;
pub mod snapshot;
pub mod sync_engine;
pub mod transfer;

// Re-exports for convenience.
pub use applier::ContentIndex;
pub use config::AppConfig;
pub use db::{Database, SqliteIndex};
pub use lock::RepoLocks;
pub use remote::{HttpRemote, RepositoryRemote};
pub use sync_engine::SyncEngine;
