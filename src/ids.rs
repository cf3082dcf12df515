//! Deterministic identifiers for externally-keyed rows.
//!
//! Two concurrent sync runs that see the same external object must converge
//! on the same local row. We derive row ids as UUIDv5 (SHA-1 name-based) over
//! the colon-joined composite key, so the same (kind, key parts) always maps
//! to the same id without any coordination.

use once_cell::sync::Lazy;
use uuid::Uuid;

/// Namespace under which all deterministic ids live. Fixed forever; changing
/// it would orphan every previously synced row.
static NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("6b7d9f52-3a41-4c8e-9b0a-d5e1c2f4a817").expect("valid namespace uuid")
});

/// Derive a stable id from an entity kind and its natural key parts.
///
/// Pure: independent of wall clock and call order. Distinct kinds, parts, or
/// part orderings yield distinct ids with overwhelming probability.
pub fn deterministic_id(kind: &str, parts: &[&str]) -> Uuid {
    let mut name = String::with_capacity(kind.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>());
    name.push_str(kind);
    for part in parts {
        name.push(':');
        name.push_str(part);
    }
    Uuid::new_v5(&NAMESPACE, name.as_bytes())
}

pub fn commit_id(repo_id: &str, branch: &str, sha: &str) -> Uuid {
    deterministic_id("commit", &[repo_id, branch, sha])
}

pub fn tree_entry_id(repo_id: &str, branch: &str, path: &str) -> Uuid {
    deterministic_id("tree_entry", &[repo_id, branch, path])
}

pub fn pull_id(repo_id: &str, number: i64) -> Uuid {
    deterministic_id("pull", &[repo_id, &number.to_string()])
}

pub fn issue_id(repo_id: &str, number: i64) -> Uuid {
    deterministic_id("issue", &[repo_id, &number.to_string()])
}

pub fn repo_id(owner: &str, name: &str) -> Uuid {
    deterministic_id("repo", &[owner, name])
}

pub fn check_run_id(repo_id: &str, github_id: i64) -> Uuid {
    deterministic_id("check_run", &[repo_id, &github_id.to_string()])
}
