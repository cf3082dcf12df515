use super::model::{
    CheckRunRow, CommitRow, IssueRow, PullRow, QueueItemRow, RepoRow, SyncJobRow, SyncStateRow,
    TreeEntryRow, UserRow,
};
use crate::model::{EnqueueOutcome, QueueStatus, RateLimitInfo, SyncJobKind, SyncStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    // Expand leading ~/ to HOME
    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_or_create_user(pool: &Pool, login: &str, token: Option<&str>) -> Result<UserRow> {
    if let Some(row) =
        sqlx::query_as::<_, UserRow>("SELECT id, login, token FROM users WHERE login = ?")
            .bind(login)
            .fetch_optional(pool)
            .await?
    {
        return Ok(row);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO users (id, login, token, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(login)
        .bind(token)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(UserRow {
        id,
        login: login.to_string(),
        token: token.map(str::to_owned),
    })
}

pub async fn find_user_by_login(pool: &Pool, login: &str) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT id, login, token FROM users WHERE login = ?")
        .bind(login)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn find_user_by_id(pool: &Pool, id: &str) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT id, login, token FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Webhook queue & deliveries
// ---------------------------------------------------------------------------

/// Enqueue a received webhook delivery for asynchronous processing.
///
/// Dedupe checks both the terminal delivery table and the live queue by
/// delivery id. A uniqueness violation on insert (two concurrent enqueues of
/// the same delivery) is reported as a duplicate, not an error.
#[instrument(skip(pool, payload))]
pub async fn enqueue_webhook(
    pool: &Pool,
    delivery_id: &str,
    event: &str,
    action: Option<&str>,
    payload: &str,
    max_attempts: i64,
) -> Result<EnqueueOutcome> {
    let seen: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM webhook_deliveries WHERE delivery_id = ?")
            .bind(delivery_id)
            .fetch_optional(pool)
            .await?;
    if seen.is_none() {
        let queued: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM webhook_queue WHERE delivery_id = ?")
                .bind(delivery_id)
                .fetch_optional(pool)
                .await?;
        if queued.is_none() {
            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            let inserted = sqlx::query(
                "INSERT INTO webhook_queue \
                 (id, delivery_id, event, action, payload, status, attempts, max_attempts, next_retry_at, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(delivery_id)
            .bind(event)
            .bind(action)
            .bind(payload)
            .bind(max_attempts)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await;

            match inserted {
                Ok(_) => {
                    return Ok(EnqueueOutcome {
                        queued: true,
                        duplicate: false,
                        queue_item_id: Some(id),
                    })
                }
                Err(err) => {
                    let unique = err
                        .as_database_error()
                        .is_some_and(|db| db.is_unique_violation());
                    if !unique {
                        return Err(err.into());
                    }
                    // Lost the race against a concurrent enqueue of the same
                    // delivery; fall through to the duplicate outcome.
                }
            }
        }
    }

    Ok(EnqueueOutcome {
        queued: false,
        duplicate: true,
        queue_item_id: None,
    })
}

const QUEUE_COLUMNS: &str = "id, delivery_id, event, action, payload, status, attempts, \
                             max_attempts, next_retry_at, last_error, created_at, updated_at";

/// Fetch a superset of candidate items, oldest first. Due-ness filtering
/// happens in the processor so clock comparisons stay in one place.
#[instrument(skip_all)]
pub async fn fetch_queue_candidates(pool: &Pool, limit: i64) -> Result<Vec<QueueItemRow>> {
    let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM webhook_queue \
         WHERE status IN ('pending', 'failed') ORDER BY created_at ASC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_queue_item(pool: &Pool, id: &str) -> Result<Option<QueueItemRow>> {
    let row = sqlx::query_as::<_, QueueItemRow>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM webhook_queue WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Flip an item to `processing` and increment its attempt counter.
/// Returns the new attempt count.
#[instrument(skip_all)]
pub async fn mark_item_processing(pool: &Pool, id: &str) -> Result<i64> {
    let attempts: i64 = sqlx::query_scalar(
        "UPDATE webhook_queue SET status = 'processing', attempts = attempts + 1, updated_at = ? \
         WHERE id = ? RETURNING attempts",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(attempts)
}

#[instrument(skip_all)]
pub async fn mark_item_processed(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_queue SET status = 'processed', next_retry_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_item_failed(
    pool: &Pool,
    id: &str,
    next_retry_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_queue SET status = 'failed', next_retry_at = ?, last_error = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(next_retry_at)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_item_dead_letter(pool: &Pool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_queue SET status = 'dead_letter', next_retry_at = NULL, last_error = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recover items stuck in `processing` since before `cutoff` back to `failed`
/// with an immediate retry. Guards against crashes mid-handler.
#[instrument(skip_all)]
pub async fn recover_stale_processing(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE webhook_queue SET status = 'failed', next_retry_at = ?, updated_at = ?, \
         last_error = COALESCE(last_error, 'recovered from stale processing') \
         WHERE status = 'processing' AND updated_at <= ?",
    )
    .bind(now)
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Record the terminal outcome for a delivery id. At most one row per id;
/// racing writers collapse onto the first outcome.
#[instrument(skip_all)]
pub async fn record_delivery(
    pool: &Pool,
    delivery_id: &str,
    event: &str,
    action: Option<&str>,
    status: QueueStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO webhook_deliveries (delivery_id, event, action, status, error, processed_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(delivery_id)
    .bind(event)
    .bind(action)
    .bind(status.as_str())
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

const SYNC_STATE_COLUMNS: &str = "id, resource_type, user_id, resource_id, last_synced_at, \
                                  last_etag, rate_limit_remaining, rate_limit_limit, \
                                  rate_limit_reset, rate_limit_used, status, error_message";

pub async fn get_sync_state(
    pool: &Pool,
    resource_type: &str,
    user_id: &str,
    resource_id: &str,
) -> Result<Option<SyncStateRow>> {
    let row = sqlx::query_as::<_, SyncStateRow>(&format!(
        "SELECT {SYNC_STATE_COLUMNS} FROM sync_state \
         WHERE resource_type = ? AND user_id = ? AND resource_id = ?"
    ))
    .bind(resource_type)
    .bind(user_id)
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Find-or-create by the (resource_type, user_id, resource_id) composite key,
/// then set the status and error message. Other columns are untouched.
#[instrument(skip(pool))]
pub async fn set_sync_status(
    pool: &Pool,
    resource_type: &str,
    user_id: &str,
    resource_id: &str,
    status: SyncStatus,
    error: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sync_state (id, resource_type, user_id, resource_id, status, error_message, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(resource_type, user_id, resource_id) DO UPDATE SET \
         status = excluded.status, error_message = excluded.error_message, updated_at = excluded.updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(resource_type)
    .bind(user_id)
    .bind(resource_id)
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a sync complete: status, last-synced timestamp, and the rate-limit
/// snapshot from the client that performed the fetch.
#[instrument(skip(pool, rate))]
pub async fn mark_sync_completed(
    pool: &Pool,
    resource_type: &str,
    user_id: &str,
    resource_id: &str,
    synced_at: DateTime<Utc>,
    rate: Option<RateLimitInfo>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sync_state (id, resource_type, user_id, resource_id, status, last_synced_at, \
         rate_limit_remaining, rate_limit_limit, rate_limit_reset, rate_limit_used, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'completed', ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(resource_type, user_id, resource_id) DO UPDATE SET \
         status = 'completed', error_message = NULL, last_synced_at = excluded.last_synced_at, \
         rate_limit_remaining = excluded.rate_limit_remaining, rate_limit_limit = excluded.rate_limit_limit, \
         rate_limit_reset = excluded.rate_limit_reset, rate_limit_used = excluded.rate_limit_used, \
         updated_at = excluded.updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(resource_type)
    .bind(user_id)
    .bind(resource_id)
    .bind(synced_at)
    .bind(rate.map(|r| r.remaining))
    .bind(rate.map(|r| r.limit))
    .bind(rate.map(|r| r.reset))
    .bind(rate.map(|r| r.used))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store an opaque progress/token blob in the reused last_etag column and
/// flip the row to `syncing`.
#[instrument(skip(pool, blob))]
pub async fn write_sync_progress(
    pool: &Pool,
    resource_type: &str,
    user_id: &str,
    resource_id: &str,
    blob: &str,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sync_state (id, resource_type, user_id, resource_id, status, last_etag, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'syncing', ?, ?, ?) \
         ON CONFLICT(resource_type, user_id, resource_id) DO UPDATE SET \
         status = 'syncing', last_etag = excluded.last_etag, updated_at = excluded.updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(resource_type)
    .bind(user_id)
    .bind(resource_id)
    .bind(blob)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync jobs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_sync_job(
    pool: &Pool,
    user_id: &str,
    kind: SyncJobKind,
    resource_id: Option<&str>,
    max_attempts: i64,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sync_jobs (id, user_id, kind, resource_id, status, attempts, max_attempts, next_retry_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(kind.as_str())
    .bind(resource_id)
    .bind(max_attempts)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn next_due_sync_job(pool: &Pool) -> Result<Option<SyncJobRow>> {
    let row = sqlx::query_as::<_, SyncJobRow>(
        "SELECT id, user_id, kind, resource_id, attempts, max_attempts FROM sync_jobs \
         WHERE status IN ('pending', 'failed') AND next_retry_at <= ? \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn delete_sync_job(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn backoff_sync_job(
    pool: &Pool,
    id: &str,
    next_retry_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET status = 'failed', attempts = attempts + 1, next_retry_at = ?, \
         last_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(next_retry_at)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn dead_letter_sync_job(pool: &Pool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET status = 'dead_letter', attempts = attempts + 1, last_error = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Domain entities (repos, pulls, issues, commits, tree entries, check runs)
// ---------------------------------------------------------------------------

const REPO_COLUMNS: &str = "id, user_id, github_id, owner, name, full_name, private, \
                            default_branch, pushed_at, updated_at";

pub async fn list_repos_for_user(pool: &Pool, user_id: &str) -> Result<Vec<RepoRow>> {
    let rows = sqlx::query_as::<_, RepoRow>(&format!(
        "SELECT {REPO_COLUMNS} FROM repos WHERE user_id = ? ORDER BY full_name ASC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn find_repo_by_github_id(pool: &Pool, github_id: i64) -> Result<Option<RepoRow>> {
    let row = sqlx::query_as::<_, RepoRow>(&format!(
        "SELECT {REPO_COLUMNS} FROM repos WHERE github_id = ?"
    ))
    .bind(github_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_repo(pool: &Pool, id: &str) -> Result<Option<RepoRow>> {
    let row =
        sqlx::query_as::<_, RepoRow>(&format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

/// Upsert a repository. A renamed repo keeps its row: the GitHub numeric id
/// wins over the deterministic (owner, name) id when both are present.
#[instrument(skip_all)]
pub async fn upsert_repo(pool: &Pool, row: &RepoRow) -> Result<String> {
    if let Some(github_id) = row.github_id {
        if let Some(existing) = find_repo_by_github_id(pool, github_id).await? {
            sqlx::query(
                "UPDATE repos SET owner = ?, name = ?, full_name = ?, private = ?, \
                 default_branch = ?, pushed_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&row.owner)
            .bind(&row.name)
            .bind(&row.full_name)
            .bind(row.private)
            .bind(&row.default_branch)
            .bind(row.pushed_at)
            .bind(row.updated_at)
            .bind(&existing.id)
            .execute(pool)
            .await?;
            return Ok(existing.id);
        }
    }

    sqlx::query(
        "INSERT INTO repos (id, user_id, github_id, owner, name, full_name, private, default_branch, pushed_at, updated_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         github_id = excluded.github_id, owner = excluded.owner, name = excluded.name, \
         full_name = excluded.full_name, private = excluded.private, \
         default_branch = excluded.default_branch, pushed_at = excluded.pushed_at, \
         updated_at = excluded.updated_at",
    )
    .bind(&row.id)
    .bind(&row.user_id)
    .bind(row.github_id)
    .bind(&row.owner)
    .bind(&row.name)
    .bind(&row.full_name)
    .bind(row.private)
    .bind(&row.default_branch)
    .bind(row.pushed_at)
    .bind(row.updated_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(row.id.clone())
}

pub async fn delete_repo(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM repos WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bump a repo's activity timestamps from webhook traffic.
#[instrument(skip_all)]
pub async fn touch_repo_activity(
    pool: &Pool,
    id: &str,
    pushed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE repos SET pushed_at = COALESCE(?, pushed_at), updated_at = COALESCE(?, updated_at) \
         WHERE id = ?",
    )
    .bind(pushed_at)
    .bind(updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

const PULL_COLUMNS: &str =
    "id, repo_id, number, title, state, author, head_sha, base_branch, draft, updated_at";

pub async fn list_pulls_for_repo(pool: &Pool, repo_id: &str) -> Result<Vec<PullRow>> {
    let rows = sqlx::query_as::<_, PullRow>(&format!(
        "SELECT {PULL_COLUMNS} FROM pulls WHERE repo_id = ? ORDER BY number ASC"
    ))
    .bind(repo_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn upsert_pull(pool: &Pool, row: &PullRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO pulls (id, repo_id, number, title, state, author, head_sha, base_branch, draft, updated_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         title = excluded.title, state = excluded.state, author = excluded.author, \
         head_sha = excluded.head_sha, base_branch = excluded.base_branch, \
         draft = excluded.draft, updated_at = excluded.updated_at",
    )
    .bind(&row.id)
    .bind(&row.repo_id)
    .bind(row.number)
    .bind(&row.title)
    .bind(&row.state)
    .bind(&row.author)
    .bind(&row.head_sha)
    .bind(&row.base_branch)
    .bind(row.draft)
    .bind(row.updated_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Upsert pulls in fixed-size chunks, one transaction per chunk. Bounds the
/// size of any single transaction; partial completion on crash is safe
/// because every row id is deterministic.
#[instrument(skip_all)]
pub async fn upsert_pulls_chunked(pool: &Pool, rows: &[PullRow], chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    for chunk in rows.chunks(chunk_size) {
        let mut tx = pool.begin().await?;
        for row in chunk {
            sqlx::query(
                "INSERT INTO pulls (id, repo_id, number, title, state, author, head_sha, base_branch, draft, updated_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 title = excluded.title, state = excluded.state, author = excluded.author, \
                 head_sha = excluded.head_sha, base_branch = excluded.base_branch, \
                 draft = excluded.draft, updated_at = excluded.updated_at",
            )
            .bind(&row.id)
            .bind(&row.repo_id)
            .bind(row.number)
            .bind(&row.title)
            .bind(&row.state)
            .bind(&row.author)
            .bind(&row.head_sha)
            .bind(&row.base_branch)
            .bind(row.draft)
            .bind(row.updated_at)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

const ISSUE_COLUMNS: &str = "id, repo_id, number, title, state, author, comments, updated_at";

pub async fn list_issues_for_repo(pool: &Pool, repo_id: &str) -> Result<Vec<IssueRow>> {
    let rows = sqlx::query_as::<_, IssueRow>(&format!(
        "SELECT {ISSUE_COLUMNS} FROM issues WHERE repo_id = ? ORDER BY number ASC"
    ))
    .bind(repo_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn upsert_issue(pool: &Pool, row: &IssueRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO issues (id, repo_id, number, title, state, author, comments, updated_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         title = excluded.title, state = excluded.state, author = excluded.author, \
         comments = excluded.comments, updated_at = excluded.updated_at",
    )
    .bind(&row.id)
    .bind(&row.repo_id)
    .bind(row.number)
    .bind(&row.title)
    .bind(&row.state)
    .bind(&row.author)
    .bind(row.comments)
    .bind(row.updated_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

const COMMIT_COLUMNS: &str = "id, repo_id, branch, sha, message, author, committed_at";

pub async fn list_commits(pool: &Pool, repo_id: &str, branch: &str) -> Result<Vec<CommitRow>> {
    let rows = sqlx::query_as::<_, CommitRow>(&format!(
        "SELECT {COMMIT_COLUMNS} FROM commits WHERE repo_id = ? AND branch = ?"
    ))
    .bind(repo_id)
    .bind(branch)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn upsert_commits_chunked(
    pool: &Pool,
    rows: &[CommitRow],
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    for chunk in rows.chunks(chunk_size) {
        let mut tx = pool.begin().await?;
        for row in chunk {
            sqlx::query(
                "INSERT INTO commits (id, repo_id, branch, sha, message, author, committed_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 message = excluded.message, author = excluded.author, \
                 committed_at = excluded.committed_at",
            )
            .bind(&row.id)
            .bind(&row.repo_id)
            .bind(&row.branch)
            .bind(&row.sha)
            .bind(&row.message)
            .bind(&row.author)
            .bind(row.committed_at)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_commits(pool: &Pool, ids: &[String], chunk_size: usize) -> Result<u64> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let mut deleted = 0;
    for chunk in ids.chunks(chunk_size) {
        let mut tx = pool.begin().await?;
        for id in chunk {
            let result = sqlx::query("DELETE FROM commits WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
    }
    Ok(deleted)
}

const TREE_COLUMNS: &str = "id, repo_id, branch, path, sha, kind, size";

pub async fn list_tree_entries(
    pool: &Pool,
    repo_id: &str,
    branch: &str,
) -> Result<Vec<TreeEntryRow>> {
    let rows = sqlx::query_as::<_, TreeEntryRow>(&format!(
        "SELECT {TREE_COLUMNS} FROM tree_entries WHERE repo_id = ? AND branch = ?"
    ))
    .bind(repo_id)
    .bind(branch)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn upsert_tree_entries_chunked(
    pool: &Pool,
    rows: &[TreeEntryRow],
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let now = Utc::now();
    for chunk in rows.chunks(chunk_size) {
        let mut tx = pool.begin().await?;
        for row in chunk {
            sqlx::query(
                "INSERT INTO tree_entries (id, repo_id, branch, path, sha, kind, size, updated_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 sha = excluded.sha, kind = excluded.kind, size = excluded.size, \
                 updated_at = excluded.updated_at",
            )
            .bind(&row.id)
            .bind(&row.repo_id)
            .bind(&row.branch)
            .bind(&row.path)
            .bind(&row.sha)
            .bind(&row.kind)
            .bind(row.size)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_tree_entries(pool: &Pool, ids: &[String], chunk_size: usize) -> Result<u64> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let mut deleted = 0;
    for chunk in ids.chunks(chunk_size) {
        let mut tx = pool.begin().await?;
        for id in chunk {
            let result = sqlx::query("DELETE FROM tree_entries WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
    }
    Ok(deleted)
}

#[instrument(skip_all)]
pub async fn upsert_check_run(pool: &Pool, row: &CheckRunRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO check_runs (id, repo_id, github_id, name, head_sha, status, conclusion, completed_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         name = excluded.name, head_sha = excluded.head_sha, status = excluded.status, \
         conclusion = excluded.conclusion, completed_at = excluded.completed_at",
    )
    .bind(&row.id)
    .bind(&row.repo_id)
    .bind(row.github_id)
    .bind(&row.name)
    .bind(&row.head_sha)
    .bind(&row.status)
    .bind(&row.conclusion)
    .bind(row.completed_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
