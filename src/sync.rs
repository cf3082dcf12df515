//! Pull-based synchronization against the GitHub API.
//!
//! The engine mirrors a user's account into the local database: orgs and
//! repos first, then webhook registration, then per-repo pull requests,
//! commit history, and file trees. Every write goes through the
//! deterministic-id upserts so repeated syncs converge instead of
//! duplicating rows.

use crate::concurrency::map_with_concurrency;
use crate::config::Sync;
use crate::db::{self, Pool, PullRow, RepoRow, TreeEntryRow, UserRow};
use crate::github::model::{RemotePull, RemoteRepo};
use crate::github::{GithubError, GithubService};
use crate::ids;
use crate::model::{SyncProgress, SyncStatus};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sync state resource types. The composite key is (resource_type, user_id,
/// resource_id); resource_id is the repo id for per-repo rows.
const RES_ACCOUNT: &str = "initial_sync";
const RES_TOKEN: &str = "token";
const RES_PULLS: &str = "pulls";
const RES_COMMITS: &str = "commits";
const RES_TREE: &str = "tree";

pub struct SyncEngine {
    pool: Pool,
    github: Arc<dyn GithubService>,
    cfg: Sync,
    webhook_url: Option<String>,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        github: Arc<dyn GithubService>,
        cfg: Sync,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            pool,
            github,
            cfg,
            webhook_url,
        }
    }

    /// Mirror the whole account: orgs, repos, webhooks, then pulls for the
    /// repos that need it. Progress snapshots land in sync_state after each
    /// step so an interrupted sync is observable. `force` bypasses the
    /// account-level and per-resource freshness windows but not an
    /// invalidated token.
    #[instrument(skip_all, fields(user = %user.login))]
    pub async fn full_account_sync(&self, user: &UserRow, force: bool) -> Result<SyncProgress> {
        if self.token_invalid(user).await? {
            anyhow::bail!("github token for {} is marked invalid", user.login);
        }
        if !force {
            if let Some(state) =
                db::get_sync_state(&self.pool, RES_ACCOUNT, &user.id, "account").await?
            {
                if self.is_fresh(&state) {
                    debug!("account sync still fresh; skipping");
                    return Ok(SyncProgress::at_step("fresh"));
                }
            }
        }

        let mut progress = SyncProgress::at_step("orgs");
        self.save_progress(user, &progress).await?;
        let orgs = match self.github.list_orgs().await {
            Ok(orgs) => orgs,
            Err(err) => return Err(self.fail(user, RES_ACCOUNT, "account", err).await),
        };
        progress.orgs = orgs.len() as u64;

        progress.step = "repos".into();
        self.save_progress(user, &progress).await?;
        let remotes = match self.github.list_repos().await {
            Ok(repos) => repos,
            Err(err) => return Err(self.fail(user, RES_ACCOUNT, "account", err).await),
        };
        let mut repos = Vec::with_capacity(remotes.len());
        for remote in &remotes {
            let row = repo_row(&user.id, remote);
            let id = db::upsert_repo(&self.pool, &row).await?;
            repos.push(RepoRow { id, ..row });
        }
        progress.repos = repos.len() as u64;

        progress.step = "hooks".into();
        self.save_progress(user, &progress).await?;
        progress.hooks = self.register_webhooks(user, &repos).await?;

        progress.step = "pulls".into();
        self.save_progress(user, &progress).await?;
        let targets = self.select_repos_for_pull_sync(user, &repos).await?;
        let engine = &*self;
        let counts = map_with_concurrency(targets, self.cfg.pr_concurrency, |repo| async move {
            engine.sync_pulls(user, &repo, force).await
        })
        .await?;
        progress.pulls = counts.iter().sum();

        let rate = self.github.rate_limit_snapshot();
        db::mark_sync_completed(&self.pool, RES_ACCOUNT, &user.id, "account", Utc::now(), rate)
            .await?;
        db::set_sync_status(&self.pool, RES_TOKEN, &user.id, "github", SyncStatus::Completed, None)
            .await?;
        info!(
            orgs = progress.orgs,
            repos = progress.repos,
            hooks = progress.hooks,
            pulls = progress.pulls,
            "account sync complete"
        );
        Ok(progress)
    }

    /// Refresh a single repo: metadata, open pulls, default-branch commits
    /// and tree. Each resource honors its own freshness window unless
    /// `force`.
    #[instrument(skip_all, fields(repo = %repo_local_id))]
    pub async fn sync_repo(&self, user: &UserRow, repo_local_id: &str, force: bool) -> Result<()> {
        let Some(repo) = db::find_repo(&self.pool, repo_local_id).await? else {
            anyhow::bail!("repo {repo_local_id} not found");
        };
        let remote = match self.github.get_repo(&repo.owner, &repo.name).await {
            Ok(remote) => remote,
            Err(err) => return Err(self.fail(user, RES_PULLS, &repo.id, err).await),
        };
        let row = repo_row(&user.id, &remote);
        let id = db::upsert_repo(&self.pool, &row).await?;
        let repo = RepoRow { id, ..row };

        self.sync_pulls(user, &repo, force).await?;
        self.sync_commits(user, &repo, force).await?;
        self.sync_tree(user, &repo, force).await?;
        Ok(())
    }

    /// Replace a repo's open-pull set with the remote one. Unchanged rows are
    /// skipped; locally-open pulls that disappeared remotely flip to closed.
    /// Returns the number of open pulls on the remote side. When the repo's
    /// pull state is still within the freshness window the local rows are
    /// trusted and no fetch happens, unless `force`.
    #[instrument(skip_all, fields(repo = %repo.full_name))]
    pub async fn sync_pulls(&self, user: &UserRow, repo: &RepoRow, force: bool) -> Result<u64> {
        if !force && self.resource_fresh(RES_PULLS, &user.id, &repo.id).await? {
            debug!("pull state still fresh; serving from local rows");
            let open = db::list_pulls_for_repo(&self.pool, &repo.id)
                .await?
                .iter()
                .filter(|p| p.state.as_deref() == Some("open"))
                .count();
            return Ok(open as u64);
        }
        let remotes = match self.github.list_open_pulls(&repo.owner, &repo.name).await {
            Ok(pulls) => pulls,
            Err(err) => return Err(self.fail(user, RES_PULLS, &repo.id, err).await),
        };

        let existing: HashMap<i64, PullRow> = db::list_pulls_for_repo(&self.pool, &repo.id)
            .await?
            .into_iter()
            .map(|p| (p.number, p))
            .collect();

        let mut changed = Vec::new();
        let mut open_numbers = HashSet::new();
        for remote in &remotes {
            open_numbers.insert(remote.number);
            let row = pull_row(&repo.id, remote);
            if existing.get(&remote.number).is_none_or(|old| pull_changed(old, &row)) {
                changed.push(row);
            }
        }
        // Locally open but gone from the remote open set: closed or merged.
        for old in existing.values() {
            if old.state.as_deref() == Some("open") && !open_numbers.contains(&old.number) {
                let mut row = old.clone();
                row.state = Some("closed".into());
                changed.push(row);
            }
        }

        let total = remotes.len() as u64;
        let skipped = existing.len().saturating_sub(changed.len());
        if !changed.is_empty() {
            db::upsert_pulls_chunked(&self.pool, &changed, self.cfg.tx_chunk_size).await?;
        }
        debug!(total, updated = changed.len(), skipped, "pulls synced");
        db::mark_sync_completed(
            &self.pool,
            RES_PULLS,
            &user.id,
            &repo.id,
            Utc::now(),
            self.github.rate_limit_snapshot(),
        )
        .await?;
        Ok(total)
    }

    /// Mirror the default-branch commit listing. Local rows absent from the
    /// remote listing are removed so force-pushes converge.
    #[instrument(skip_all, fields(repo = %repo.full_name))]
    pub async fn sync_commits(&self, user: &UserRow, repo: &RepoRow, force: bool) -> Result<()> {
        if !force && self.resource_fresh(RES_COMMITS, &user.id, &repo.id).await? {
            debug!("commit state still fresh; skipping");
            return Ok(());
        }
        let Some(branch) = repo.default_branch.as_deref() else {
            debug!("repo has no default branch; skipping commits");
            return Ok(());
        };
        let remotes = match self.github.list_commits(&repo.owner, &repo.name, branch).await {
            Ok(commits) => commits,
            Err(err) => return Err(self.fail(user, RES_COMMITS, &repo.id, err).await),
        };

        let existing = db::list_commits(&self.pool, &repo.id, branch).await?;
        let remote_ids: HashSet<String> = remotes
            .iter()
            .map(|c| ids::commit_id(&repo.id, branch, &c.sha).to_string())
            .collect();
        let stale: Vec<String> = existing
            .iter()
            .filter(|c| !remote_ids.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();

        let rows: Vec<_> = remotes
            .iter()
            .map(|c| db::CommitRow {
                id: ids::commit_id(&repo.id, branch, &c.sha).to_string(),
                repo_id: repo.id.clone(),
                branch: branch.to_string(),
                sha: c.sha.clone(),
                message: c.commit.message.clone(),
                author: c.commit.author.as_ref().and_then(|a| a.name.clone()),
                committed_at: c.commit.author.as_ref().and_then(|a| a.date),
            })
            .collect();
        db::upsert_commits_chunked(&self.pool, &rows, self.cfg.tx_chunk_size).await?;
        if !stale.is_empty() {
            let deleted = db::delete_commits(&self.pool, &stale, self.cfg.tx_chunk_size).await?;
            debug!(deleted, "removed commits gone from remote");
        }
        db::mark_sync_completed(
            &self.pool,
            RES_COMMITS,
            &user.id,
            &repo.id,
            Utc::now(),
            self.github.rate_limit_snapshot(),
        )
        .await?;
        Ok(())
    }

    /// Mirror the default-branch file tree. Entries are diffed by blob sha so
    /// an unchanged tree costs no writes; deleted paths are removed.
    #[instrument(skip_all, fields(repo = %repo.full_name))]
    pub async fn sync_tree(&self, user: &UserRow, repo: &RepoRow, force: bool) -> Result<()> {
        if !force && self.resource_fresh(RES_TREE, &user.id, &repo.id).await? {
            debug!("tree state still fresh; skipping");
            return Ok(());
        }
        let Some(branch) = repo.default_branch.as_deref() else {
            debug!("repo has no default branch; skipping tree");
            return Ok(());
        };
        let remotes = match self.github.get_tree(&repo.owner, &repo.name, branch).await {
            Ok(entries) => entries,
            Err(err) => return Err(self.fail(user, RES_TREE, &repo.id, err).await),
        };

        let existing: HashMap<String, TreeEntryRow> =
            db::list_tree_entries(&self.pool, &repo.id, branch)
                .await?
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();

        let mut upserts = Vec::new();
        let mut seen = HashSet::new();
        for remote in &remotes {
            let id = ids::tree_entry_id(&repo.id, branch, &remote.path).to_string();
            seen.insert(id.clone());
            let unchanged = existing
                .get(&id)
                .is_some_and(|old| old.sha == remote.sha && old.kind == remote.kind);
            if unchanged {
                continue;
            }
            upserts.push(TreeEntryRow {
                id,
                repo_id: repo.id.clone(),
                branch: branch.to_string(),
                path: remote.path.clone(),
                sha: remote.sha.clone(),
                kind: remote.kind.clone(),
                size: remote.size,
            });
        }
        let stale: Vec<String> = existing
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();

        if !upserts.is_empty() {
            db::upsert_tree_entries_chunked(&self.pool, &upserts, self.cfg.tx_chunk_size).await?;
        }
        if !stale.is_empty() {
            let deleted =
                db::delete_tree_entries(&self.pool, &stale, self.cfg.tx_chunk_size).await?;
            debug!(deleted, "removed tree entries gone from remote");
        }
        db::mark_sync_completed(
            &self.pool,
            RES_TREE,
            &user.id,
            &repo.id,
            Utc::now(),
            self.github.rate_limit_snapshot(),
        )
        .await?;
        Ok(())
    }

    /// Register the callback webhook on every repo, a bounded number at a
    /// time. Individual failures are logged and skipped; an auth failure
    /// aborts since every remaining call would fail the same way.
    async fn register_webhooks(&self, user: &UserRow, repos: &[RepoRow]) -> Result<u64> {
        let Some(url) = self.webhook_url.as_deref() else {
            debug!("no webhook callback url configured; skipping registration");
            return Ok(0);
        };
        let engine = &*self;
        let results = map_with_concurrency(
            repos.to_vec(),
            self.cfg.webhook_concurrency,
            |repo| async move {
                match engine.github.register_webhook(&repo.owner, &repo.name, url).await {
                    Ok(()) => Ok(1u64),
                    Err(err) if err.is_auth_failure() => {
                        Err(engine.fail(user, RES_ACCOUNT, "account", err).await)
                    }
                    Err(err) => {
                        warn!(repo = %repo.full_name, error = %err, "webhook registration failed");
                        Ok(0)
                    }
                }
            },
        )
        .await?;
        Ok(results.iter().sum())
    }

    /// Pick the repos whose pulls need a refresh. Missing state or missing
    /// activity timestamps count as needing sync (fail open); a repo with no
    /// activity since its last pull sync is excluded.
    async fn select_repos_for_pull_sync(
        &self,
        user: &UserRow,
        repos: &[RepoRow],
    ) -> Result<Vec<RepoRow>> {
        let mut out = Vec::new();
        for repo in repos {
            let state = db::get_sync_state(&self.pool, RES_PULLS, &user.id, &repo.id).await?;
            if needs_pull_sync(state.as_ref(), repo) {
                out.push(repo.clone());
            } else {
                debug!(repo = %repo.full_name, "no activity since last pull sync; skipping");
            }
        }
        Ok(out)
    }

    async fn resource_fresh(
        &self,
        resource_type: &str,
        user_id: &str,
        resource_id: &str,
    ) -> Result<bool> {
        let state = db::get_sync_state(&self.pool, resource_type, user_id, resource_id).await?;
        Ok(state.as_ref().is_some_and(|s| self.is_fresh(s)))
    }

    fn is_fresh(&self, state: &db::SyncStateRow) -> bool {
        if state.status != SyncStatus::Completed.as_str() {
            return false;
        }
        let window = ChronoDuration::milliseconds(self.cfg.freshness_window_ms as i64);
        state
            .last_synced_at
            .is_some_and(|at| Utc::now() - at < window)
    }

    async fn token_invalid(&self, user: &UserRow) -> Result<bool> {
        let state = db::get_sync_state(&self.pool, RES_TOKEN, &user.id, "github").await?;
        Ok(state.is_some_and(|s| s.status == SyncStatus::AuthInvalid.as_str()))
    }

    async fn save_progress(&self, user: &UserRow, progress: &SyncProgress) -> Result<()> {
        let blob = serde_json::to_string(progress)?;
        db::write_sync_progress(&self.pool, RES_ACCOUNT, &user.id, "account", &blob).await
    }

    /// Record a fetch failure in sync_state, then hand back the error for
    /// propagation. Auth failures additionally poison the token row so later
    /// syncs short-circuit instead of burning API calls.
    async fn fail(
        &self,
        user: &UserRow,
        resource_type: &str,
        resource_id: &str,
        err: GithubError,
    ) -> anyhow::Error {
        let message = err.to_string();
        let status = if err.is_auth_failure() {
            SyncStatus::AuthInvalid
        } else {
            SyncStatus::Error
        };
        if err.is_auth_failure() {
            if let Err(db_err) = db::set_sync_status(
                &self.pool,
                RES_TOKEN,
                &user.id,
                "github",
                SyncStatus::AuthInvalid,
                Some(&message),
            )
            .await
            {
                warn!(error = %db_err, "failed to mark token invalid");
            }
        }
        if let Err(db_err) = db::set_sync_status(
            &self.pool,
            resource_type,
            &user.id,
            resource_id,
            status,
            Some(&message),
        )
        .await
        {
            warn!(error = %db_err, "failed to record sync error");
        }
        err.into()
    }
}

/// A repo needs a pull refresh unless its last pull sync completed after the
/// repo's most recent recorded activity.
fn needs_pull_sync(state: Option<&db::SyncStateRow>, repo: &RepoRow) -> bool {
    let Some(state) = state else {
        return true;
    };
    if state.status != SyncStatus::Completed.as_str() {
        return true;
    }
    let Some(last_synced) = state.last_synced_at else {
        return true;
    };
    match repo.pushed_at.max(repo.updated_at) {
        Some(activity) => activity > last_synced,
        None => true,
    }
}

fn repo_row(user_id: &str, remote: &RemoteRepo) -> RepoRow {
    RepoRow {
        id: ids::repo_id(&remote.owner.login, &remote.name).to_string(),
        user_id: user_id.to_string(),
        github_id: Some(remote.id),
        owner: remote.owner.login.clone(),
        name: remote.name.clone(),
        full_name: remote.full_name.clone(),
        private: remote.private,
        default_branch: remote.default_branch.clone(),
        pushed_at: remote.pushed_at,
        updated_at: remote.updated_at,
    }
}

fn pull_row(repo_id: &str, remote: &RemotePull) -> PullRow {
    PullRow {
        id: ids::pull_id(repo_id, remote.number).to_string(),
        repo_id: repo_id.to_string(),
        number: remote.number,
        title: remote.title.clone(),
        state: remote.state.clone(),
        author: remote.user.as_ref().map(|u| u.login.clone()),
        head_sha: remote.head.as_ref().and_then(|h| h.sha.clone()),
        base_branch: remote.base.as_ref().and_then(|b| b.branch.clone()),
        draft: remote.draft,
        updated_at: remote.updated_at,
    }
}

fn pull_changed(old: &PullRow, new: &PullRow) -> bool {
    old.title != new.title
        || old.state != new.state
        || old.author != new.author
        || old.head_sha != new.head_sha
        || old.base_branch != new.base_branch
        || old.draft != new.draft
        || old.updated_at != new.updated_at
}
