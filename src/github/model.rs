//! Typed slices of the GitHub REST responses the sync engine consumes.
//!
//! Only the fields the engine reads are modeled; everything else in a
//! response is ignored by serde.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOrg {
    pub login: String,
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRepo {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub owner: RemoteOwner,
    #[serde(default)]
    pub private: bool,
    pub default_branch: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRef {
    pub sha: Option<String>,
    #[serde(rename = "ref")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePull {
    pub number: i64,
    pub title: Option<String>,
    pub state: Option<String>,
    pub user: Option<RemoteOwner>,
    pub head: Option<PullRef>,
    pub base: Option<PullRef>,
    #[serde(default)]
    pub draft: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitAuthor {
    pub name: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    pub message: Option<String>,
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCommit {
    pub sha: String,
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTreeEntry {
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTree {
    #[serde(default)]
    pub truncated: bool,
    pub tree: Vec<RemoteTreeEntry>,
}
