//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed row structs returned by repositories.
//! - `repo`: SQL-only functions that map rows into those structs.
//!
//! External modules should import from `gh_syncd::db`; the repository API
//! and commonly used row models are re-exported for convenience.

pub mod model;
pub mod repo;

// Re-export the repository API at `crate::db::*`.
pub use repo::*;

// Surface row models used by callers (processor, sync engine, handlers).
pub use model::{
    CheckRunRow, CommitRow, IssueRow, PullRow, QueueItemRow, RepoRow, SyncJobRow, SyncStateRow,
    TreeEntryRow, UserRow,
};
