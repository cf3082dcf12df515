//! Maps webhook event names to handlers and applies their field changes.
//!
//! Payloads arrive as opaque JSON and are read defensively: a missing
//! optional field is never an error. Unknown event names are logged and
//! treated as success so an unrecognized event cannot wedge the queue.

use crate::db::{self, CheckRunRow, CommitRow, IssueRow, Pool, PullRow, RepoRow};
use crate::ids;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument};

/// Chunk size for commit batches arriving over push events.
const PUSH_CHUNK_SIZE: usize = 100;

/// Webhook event families we handle. `Extended` covers the long tail of
/// lower-traffic events with a single activity-bump handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ping,
    Push,
    PullRequest,
    Issues,
    IssueComment,
    CheckRun,
    Repository,
    Extended,
}

/// Lower-traffic events that only bump repository activity locally.
const EXTENDED_EVENTS: &[&str] = &[
    "branch_protection_rule",
    "check_suite",
    "commit_comment",
    "create",
    "delete",
    "deployment",
    "deployment_status",
    "discussion",
    "discussion_comment",
    "fork",
    "gollum",
    "label",
    "member",
    "milestone",
    "package",
    "page_build",
    "public",
    "pull_request_review",
    "pull_request_review_comment",
    "pull_request_review_thread",
    "release",
    "star",
    "status",
    "team_add",
    "watch",
    "workflow_dispatch",
    "workflow_job",
    "workflow_run",
];

impl EventKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ping" => Some(EventKind::Ping),
            "push" => Some(EventKind::Push),
            "pull_request" => Some(EventKind::PullRequest),
            "issues" => Some(EventKind::Issues),
            "issue_comment" => Some(EventKind::IssueComment),
            "check_run" => Some(EventKind::CheckRun),
            "repository" => Some(EventKind::Repository),
            _ if EXTENDED_EVENTS.contains(&name) => Some(EventKind::Extended),
            _ => None,
        }
    }
}

/// Route one parsed webhook payload to its handler.
#[instrument(skip(pool, payload))]
pub async fn dispatch(pool: &Pool, event: &str, payload: &Value) -> Result<()> {
    let Some(kind) = EventKind::parse(event) else {
        info!(event, "unknown webhook event; ignoring");
        return Ok(());
    };
    match kind {
        EventKind::Ping => {
            debug!("ping received");
            Ok(())
        }
        EventKind::Push => handle_push(pool, payload).await,
        EventKind::PullRequest => handle_pull_request(pool, payload).await,
        EventKind::Issues | EventKind::IssueComment => handle_issue(pool, payload).await,
        EventKind::CheckRun => handle_check_run(pool, payload).await,
        EventKind::Repository => handle_repository(pool, payload).await,
        EventKind::Extended => handle_extended(pool, payload).await,
    }
}

// ---------------------------------------------------------------------------
// Defensive payload field extraction
// ---------------------------------------------------------------------------

fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    field(value, path).and_then(Value::as_str)
}

fn i64_field(value: &Value, path: &[&str]) -> Option<i64> {
    field(value, path).and_then(Value::as_i64)
}

fn bool_field(value: &Value, path: &[&str]) -> Option<bool> {
    field(value, path).and_then(Value::as_bool)
}

fn time_field(value: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    str_field(value, path)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Find or auto-create the repository row a payload refers to, provided the
/// repo owner or the event sender is a known local user. Returns the local
/// repo id, or None when the event belongs to nobody we track.
async fn resolve_repo(pool: &Pool, payload: &Value) -> Result<Option<String>> {
    let Some(owner) = str_field(payload, &["repository", "owner", "login"]) else {
        debug!("payload has no repository owner; ignoring");
        return Ok(None);
    };
    let Some(name) = str_field(payload, &["repository", "name"]) else {
        return Ok(None);
    };

    let mut user = db::find_user_by_login(pool, owner).await?;
    if user.is_none() {
        if let Some(sender) = str_field(payload, &["sender", "login"]) {
            user = db::find_user_by_login(pool, sender).await?;
        }
    }
    let Some(user) = user else {
        debug!(owner, name, "no local user for webhook; ignoring");
        return Ok(None);
    };

    let row = RepoRow {
        id: ids::repo_id(owner, name).to_string(),
        user_id: user.id,
        github_id: i64_field(payload, &["repository", "id"]),
        owner: owner.to_string(),
        name: name.to_string(),
        full_name: str_field(payload, &["repository", "full_name"])
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{owner}/{name}")),
        private: bool_field(payload, &["repository", "private"]).unwrap_or(false),
        default_branch: str_field(payload, &["repository", "default_branch"]).map(str::to_owned),
        pushed_at: time_field(payload, &["repository", "pushed_at"]),
        updated_at: time_field(payload, &["repository", "updated_at"]),
    };
    let id = db::upsert_repo(pool, &row).await?;
    Ok(Some(id))
}

async fn handle_push(pool: &Pool, payload: &Value) -> Result<()> {
    let Some(repo_id) = resolve_repo(pool, payload).await? else {
        return Ok(());
    };

    // Only branch pushes carry commit history we mirror; tag pushes just
    // count as activity.
    let branch = str_field(payload, &["ref"]).and_then(|r| r.strip_prefix("refs/heads/"));
    if let Some(branch) = branch {
        let commits: Vec<CommitRow> = payload
            .get("commits")
            .and_then(Value::as_array)
            .map(|commits| {
                commits
                    .iter()
                    .filter_map(|c| {
                        let sha = c.get("id").and_then(Value::as_str)?;
                        Some(CommitRow {
                            id: ids::commit_id(&repo_id, branch, sha).to_string(),
                            repo_id: repo_id.clone(),
                            branch: branch.to_string(),
                            sha: sha.to_string(),
                            message: str_field(c, &["message"]).map(str::to_owned),
                            author: str_field(c, &["author", "name"]).map(str::to_owned),
                            committed_at: time_field(c, &["timestamp"]),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !commits.is_empty() {
            db::upsert_commits_chunked(pool, &commits, PUSH_CHUNK_SIZE).await?;
        }
    }

    db::touch_repo_activity(pool, &repo_id, Some(Utc::now()), None).await?;
    Ok(())
}

async fn handle_pull_request(pool: &Pool, payload: &Value) -> Result<()> {
    let Some(repo_id) = resolve_repo(pool, payload).await? else {
        return Ok(());
    };
    let Some(number) = i64_field(payload, &["pull_request", "number"]) else {
        debug!("pull_request payload without number; ignoring");
        return Ok(());
    };

    let row = PullRow {
        id: ids::pull_id(&repo_id, number).to_string(),
        repo_id: repo_id.clone(),
        number,
        title: str_field(payload, &["pull_request", "title"]).map(str::to_owned),
        state: str_field(payload, &["pull_request", "state"]).map(str::to_owned),
        author: str_field(payload, &["pull_request", "user", "login"]).map(str::to_owned),
        head_sha: str_field(payload, &["pull_request", "head", "sha"]).map(str::to_owned),
        base_branch: str_field(payload, &["pull_request", "base", "ref"]).map(str::to_owned),
        draft: bool_field(payload, &["pull_request", "draft"]).unwrap_or(false),
        updated_at: time_field(payload, &["pull_request", "updated_at"]),
    };
    db::upsert_pull(pool, &row).await?;
    db::touch_repo_activity(pool, &repo_id, None, Some(Utc::now())).await?;
    Ok(())
}

async fn handle_issue(pool: &Pool, payload: &Value) -> Result<()> {
    let Some(repo_id) = resolve_repo(pool, payload).await? else {
        return Ok(());
    };
    let Some(number) = i64_field(payload, &["issue", "number"]) else {
        debug!("issue payload without number; ignoring");
        return Ok(());
    };

    let row = IssueRow {
        id: ids::issue_id(&repo_id, number).to_string(),
        repo_id: repo_id.clone(),
        number,
        title: str_field(payload, &["issue", "title"]).map(str::to_owned),
        state: str_field(payload, &["issue", "state"]).map(str::to_owned),
        author: str_field(payload, &["issue", "user", "login"]).map(str::to_owned),
        comments: i64_field(payload, &["issue", "comments"]).unwrap_or(0),
        updated_at: time_field(payload, &["issue", "updated_at"]),
    };
    db::upsert_issue(pool, &row).await?;
    Ok(())
}

async fn handle_check_run(pool: &Pool, payload: &Value) -> Result<()> {
    let Some(repo_id) = resolve_repo(pool, payload).await? else {
        return Ok(());
    };
    let Some(github_id) = i64_field(payload, &["check_run", "id"]) else {
        debug!("check_run payload without id; ignoring");
        return Ok(());
    };

    let row = CheckRunRow {
        id: ids::check_run_id(&repo_id, github_id).to_string(),
        repo_id,
        github_id: Some(github_id),
        name: str_field(payload, &["check_run", "name"]).map(str::to_owned),
        head_sha: str_field(payload, &["check_run", "head_sha"]).map(str::to_owned),
        status: str_field(payload, &["check_run", "status"]).map(str::to_owned),
        conclusion: str_field(payload, &["check_run", "conclusion"]).map(str::to_owned),
        completed_at: time_field(payload, &["check_run", "completed_at"]),
    };
    db::upsert_check_run(pool, &row).await?;
    Ok(())
}

async fn handle_repository(pool: &Pool, payload: &Value) -> Result<()> {
    if str_field(payload, &["action"]) == Some("deleted") {
        if let Some(github_id) = i64_field(payload, &["repository", "id"]) {
            if let Some(repo) = db::find_repo_by_github_id(pool, github_id).await? {
                db::delete_repo(pool, &repo.id).await?;
                return Ok(());
            }
        }
        return Ok(());
    }
    // created / renamed / edited / publicized / privatized all reduce to an
    // upsert of the current repository object.
    resolve_repo(pool, payload).await?;
    Ok(())
}

async fn handle_extended(pool: &Pool, payload: &Value) -> Result<()> {
    if let Some(repo_id) = resolve_repo(pool, payload).await? {
        db::touch_repo_activity(pool, &repo_id, None, Some(Utc::now())).await?;
    }
    Ok(())
}
