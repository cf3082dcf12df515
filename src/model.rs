use serde::{Deserialize, Serialize};

/// Lifecycle of a webhook queue item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "processed" => Some(QueueStatus::Processed),
            "failed" => Some(QueueStatus::Failed),
            "dead_letter" => Some(QueueStatus::DeadLetter),
            _ => None,
        }
    }
}

/// Status of a sync_state row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Completed,
    AuthInvalid,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Completed => "completed",
            SyncStatus::AuthInvalid => "auth_invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncStatus::Idle),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            "completed" => Some(SyncStatus::Completed),
            "auth_invalid" => Some(SyncStatus::AuthInvalid),
            _ => None,
        }
    }
}

/// Kind of retryable background sync work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncJobKind {
    FullSync,
    RepoSync,
    PrSync,
}

impl SyncJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobKind::FullSync => "full_sync",
            SyncJobKind::RepoSync => "repo_sync",
            SyncJobKind::PrSync => "pr_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_sync" => Some(SyncJobKind::FullSync),
            "repo_sync" => Some(SyncJobKind::RepoSync),
            "pr_sync" => Some(SyncJobKind::PrSync),
            _ => None,
        }
    }
}

/// Point-in-time rate-limit snapshot taken from the most recent GitHub
/// response headers. Cached per client instance, never authoritative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: i64,
    pub limit: i64,
    /// Unix timestamp at which the window resets.
    pub reset: i64,
    pub used: i64,
}

/// Outcome of a webhook enqueue attempt. A duplicate is success-shaped, not
/// an error: GitHub retries deliveries and we must answer 2xx either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queued: bool,
    pub duplicate: bool,
    pub queue_item_id: Option<String>,
}

/// Aggregate counts returned by one queue-processor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub recovered: u64,
}

impl RunStats {
    pub fn merge(&mut self, other: RunStats) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.recovered += other.recovered;
    }
}

/// Progress snapshot written into sync_state during a multi-step full sync,
/// serialized into the last_etag column as an opaque blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub step: String,
    pub orgs: u64,
    pub repos: u64,
    pub hooks: u64,
    pub pulls: u64,
}

impl SyncProgress {
    pub fn at_step(step: &str) -> Self {
        Self {
            step: step.to_string(),
            orgs: 0,
            repos: 0,
            hooks: 0,
            pulls: 0,
        }
    }
}
