//! Database row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub login: String,
    pub token: Option<String>,
}

/// Webhook queue work item as selected by the processor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItemRow {
    pub id: String,
    pub delivery_id: String,
    pub event: String,
    pub action: Option<String>,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncStateRow {
    pub id: String,
    pub resource_type: String,
    pub user_id: String,
    pub resource_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_etag: Option<String>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_limit: Option<i64>,
    pub rate_limit_reset: Option<i64>,
    pub rate_limit_used: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncJobRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub resource_id: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepoRow {
    pub id: String,
    pub user_id: String,
    pub github_id: Option<i64>,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub private: bool,
    pub default_branch: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PullRow {
    pub id: String,
    pub repo_id: String,
    pub number: i64,
    pub title: Option<String>,
    pub state: Option<String>,
    pub author: Option<String>,
    pub head_sha: Option<String>,
    pub base_branch: Option<String>,
    pub draft: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IssueRow {
    pub id: String,
    pub repo_id: String,
    pub number: i64,
    pub title: Option<String>,
    pub state: Option<String>,
    pub author: Option<String>,
    pub comments: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommitRow {
    pub id: String,
    pub repo_id: String,
    pub branch: String,
    pub sha: String,
    pub message: Option<String>,
    pub author: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TreeEntryRow {
    pub id: String,
    pub repo_id: String,
    pub branch: String,
    pub path: String,
    pub sha: String,
    pub kind: String,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckRunRow {
    pub id: String,
    pub repo_id: String,
    pub github_id: Option<i64>,
    pub name: Option<String>,
    pub head_sha: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}
