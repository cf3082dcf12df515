use async_trait::async_trait;
use gh_syncd::config::Sync;
use gh_syncd::db;
use gh_syncd::github::model::{
    PullRef, RemoteCommit, RemoteOrg, RemoteOwner, RemotePull, RemoteRepo, RemoteTreeEntry,
};
use gh_syncd::github::{GithubError, GithubService};
use gh_syncd::ids;
use gh_syncd::model::RateLimitInfo;
use gh_syncd::sync::SyncEngine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn sync_cfg() -> Sync {
    Sync {
        freshness_window_ms: 0,
        rate_limit_max_retries: 3,
        rate_limit_base_delay_ms: 1,
        tx_chunk_size: 100,
        webhook_concurrency: 2,
        pr_concurrency: 2,
    }
}

fn remote_repo(id: i64, name: &str) -> RemoteRepo {
    RemoteRepo {
        id,
        name: name.to_string(),
        full_name: format!("octocat/{name}"),
        owner: RemoteOwner {
            login: "octocat".into(),
        },
        private: false,
        default_branch: Some("main".into()),
        pushed_at: None,
        updated_at: None,
    }
}

fn remote_pull(number: i64, title: &str, head: &str) -> RemotePull {
    RemotePull {
        number,
        title: Some(title.to_string()),
        state: Some("open".into()),
        user: Some(RemoteOwner {
            login: "contributor".into(),
        }),
        head: Some(PullRef {
            sha: Some(head.to_string()),
            branch: Some("feature".into()),
        }),
        base: Some(PullRef {
            sha: None,
            branch: Some("main".into()),
        }),
        draft: false,
        updated_at: None,
    }
}

fn remote_commit(sha: &str, message: &str) -> RemoteCommit {
    serde_json::from_value(serde_json::json!({
        "sha": sha,
        "commit": {
            "message": message,
            "author": { "name": "Octo", "date": "2024-05-01T10:00:00Z" }
        }
    }))
    .unwrap()
}

fn tree_entry(path: &str, sha: &str) -> RemoteTreeEntry {
    serde_json::from_value(serde_json::json!({
        "path": path,
        "sha": sha,
        "type": "blob",
        "size": 10
    }))
    .unwrap()
}

/// Scripted GitHub backend that records the calls it receives.
#[derive(Default)]
struct RecordingGithub {
    repos: Mutex<Vec<RemoteRepo>>,
    pulls: Mutex<HashMap<String, Vec<RemotePull>>>,
    commits: Mutex<HashMap<String, Vec<RemoteCommit>>>,
    trees: Mutex<HashMap<String, Vec<RemoteTreeEntry>>>,
    hook_error: Mutex<Option<fn() -> GithubError>>,
    repos_error: Mutex<Option<fn() -> GithubError>>,
    list_repo_calls: AtomicU32,
    pull_calls: AtomicU32,
    commit_calls: AtomicU32,
    hook_calls: Mutex<Vec<String>>,
    rate: Mutex<Option<RateLimitInfo>>,
}

impl RecordingGithub {
    fn with_repos(repos: Vec<RemoteRepo>) -> Self {
        let github = Self::default();
        *github.repos.lock().unwrap() = repos;
        *github.rate.lock().unwrap() = Some(RateLimitInfo {
            remaining: 4900,
            limit: 5000,
            reset: 1_700_000_000,
            used: 100,
        });
        github
    }

    fn set_pulls(&self, repo: &str, pulls: Vec<RemotePull>) {
        self.pulls.lock().unwrap().insert(repo.to_string(), pulls);
    }

    fn set_commits(&self, repo: &str, commits: Vec<RemoteCommit>) {
        self.commits.lock().unwrap().insert(repo.to_string(), commits);
    }

    fn set_tree(&self, repo: &str, entries: Vec<RemoteTreeEntry>) {
        self.trees.lock().unwrap().insert(repo.to_string(), entries);
    }
}

#[async_trait]
impl GithubService for RecordingGithub {
    async fn list_orgs(&self) -> Result<Vec<RemoteOrg>, GithubError> {
        Ok(vec![RemoteOrg {
            login: "octo-org".into(),
            id: 1,
        }])
    }

    async fn list_repos(&self) -> Result<Vec<RemoteRepo>, GithubError> {
        self.list_repo_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = *self.repos_error.lock().unwrap() {
            return Err(make());
        }
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn get_repo(&self, _owner: &str, name: &str) -> Result<RemoteRepo, GithubError> {
        self.repos
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or(GithubError::Status {
                status: 404,
                body: "not found".into(),
            })
    }

    async fn list_open_pulls(
        &self,
        _owner: &str,
        name: &str,
    ) -> Result<Vec<RemotePull>, GithubError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pulls.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn list_commits(
        &self,
        _owner: &str,
        name: &str,
        _branch: &str,
    ) -> Result<Vec<RemoteCommit>, GithubError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.commits.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn get_tree(
        &self,
        _owner: &str,
        name: &str,
        _branch: &str,
    ) -> Result<Vec<RemoteTreeEntry>, GithubError> {
        Ok(self.trees.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn register_webhook(
        &self,
        _owner: &str,
        name: &str,
        _callback_url: &str,
    ) -> Result<(), GithubError> {
        if let Some(make) = *self.hook_error.lock().unwrap() {
            return Err(make());
        }
        self.hook_calls.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn rate_limit_snapshot(&self) -> Option<RateLimitInfo> {
        *self.rate.lock().unwrap()
    }
}

fn engine(pool: &sqlx::SqlitePool, github: Arc<RecordingGithub>, cfg: Sync) -> SyncEngine {
    SyncEngine::new(
        pool.clone(),
        github,
        cfg,
        Some("https://example.com/webhook".into()),
    )
}

#[tokio::test]
async fn full_sync_mirrors_account_and_records_state() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();

    let github = Arc::new(RecordingGithub::with_repos(vec![
        remote_repo(1, "alpha"),
        remote_repo(2, "beta"),
    ]));
    github.set_pulls("alpha", vec![remote_pull(1, "One", "aaa"), remote_pull(2, "Two", "bbb")]);

    let progress = engine(&pool, Arc::clone(&github), sync_cfg())
        .full_account_sync(&user, false)
        .await
        .unwrap();
    assert_eq!(progress.step, "pulls");
    assert_eq!(progress.repos, 2);
    assert_eq!(progress.hooks, 2);
    assert_eq!(progress.pulls, 2);

    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(repos.len(), 2);
    let alpha = repos.iter().find(|r| r.name == "alpha").unwrap();
    let pulls = db::list_pulls_for_repo(&pool, &alpha.id).await.unwrap();
    assert_eq!(pulls.len(), 2);

    // Webhooks were registered once per repo.
    let mut hooks = github.hook_calls.lock().unwrap().clone();
    hooks.sort();
    assert_eq!(hooks, vec!["alpha", "beta"]);

    // Account state carries the completion and the rate-limit snapshot.
    let state = db::get_sync_state(&pool, "initial_sync", &user.id, "account")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, "completed");
    assert!(state.last_synced_at.is_some());
    assert_eq!(state.rate_limit_remaining, Some(4900));
    assert_eq!(state.rate_limit_limit, Some(5000));
}

#[tokio::test]
async fn fresh_account_state_short_circuits_the_sync() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));

    let cfg = Sync {
        freshness_window_ms: 3_600_000,
        ..sync_cfg()
    };
    let engine = engine(&pool, Arc::clone(&github), cfg);
    engine.full_account_sync(&user, false).await.unwrap();
    assert_eq!(github.list_repo_calls.load(Ordering::SeqCst), 1);

    let progress = engine.full_account_sync(&user, false).await.unwrap();
    assert_eq!(progress.step, "fresh");
    assert_eq!(github.list_repo_calls.load(Ordering::SeqCst), 1);

    // Force bypasses the freshness window.
    engine.full_account_sync(&user, true).await.unwrap();
    assert_eq!(github.list_repo_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn repeated_syncs_converge_and_close_vanished_pulls() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    github.set_pulls("alpha", vec![remote_pull(1, "One", "aaa"), remote_pull(2, "Two", "bbb")]);

    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    engine.full_account_sync(&user, false).await.unwrap();

    // Pull 2 merged away; pull 1 got a new head.
    github.set_pulls("alpha", vec![remote_pull(1, "One", "ccc")]);
    engine.full_account_sync(&user, false).await.unwrap();

    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    let pulls = db::list_pulls_for_repo(&pool, &repos[0].id).await.unwrap();
    assert_eq!(pulls.len(), 2);
    let one = pulls.iter().find(|p| p.number == 1).unwrap();
    assert_eq!(one.head_sha.as_deref(), Some("ccc"));
    assert_eq!(one.state.as_deref(), Some("open"));
    let two = pulls.iter().find(|p| p.number == 2).unwrap();
    assert_eq!(two.state.as_deref(), Some("closed"));
}

#[tokio::test]
async fn repo_sync_mirrors_commits_and_tree_with_stale_cleanup() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    github.set_commits("alpha", vec![remote_commit("aaa", "first"), remote_commit("bbb", "second")]);
    github.set_tree("alpha", vec![tree_entry("src/lib.rs", "s1"), tree_entry("README.md", "s2")]);

    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    let repo_id = ids::repo_id("octocat", "alpha").to_string();
    db::upsert_repo(
        &pool,
        &db::RepoRow {
            id: repo_id.clone(),
            user_id: user.id.clone(),
            github_id: Some(1),
            owner: "octocat".into(),
            name: "alpha".into(),
            full_name: "octocat/alpha".into(),
            private: false,
            default_branch: Some("main".into()),
            pushed_at: None,
            updated_at: None,
        },
    )
    .await
    .unwrap();

    engine.sync_repo(&user, &repo_id, false).await.unwrap();
    assert_eq!(db::list_commits(&pool, &repo_id, "main").await.unwrap().len(), 2);
    assert_eq!(db::list_tree_entries(&pool, &repo_id, "main").await.unwrap().len(), 2);

    // A force-push rewrote history and one file was deleted.
    github.set_commits("alpha", vec![remote_commit("ccc", "rewritten")]);
    github.set_tree("alpha", vec![tree_entry("src/lib.rs", "s3")]);
    engine.sync_repo(&user, &repo_id, false).await.unwrap();

    let commits = db::list_commits(&pool, &repo_id, "main").await.unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].sha, "ccc");
    let entries = db::list_tree_entries(&pool, &repo_id, "main").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "src/lib.rs");
    assert_eq!(entries[0].sha, "s3");

    let state = db::get_sync_state(&pool, "commits", &user.id, &repo_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, "completed");
}

#[tokio::test]
async fn fresh_pull_state_is_served_from_local_rows() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    github.set_pulls("alpha", vec![remote_pull(1, "One", "aaa")]);

    let cfg = Sync {
        freshness_window_ms: 3_600_000,
        ..sync_cfg()
    };
    let engine = engine(&pool, Arc::clone(&github), cfg);
    engine.full_account_sync(&user, false).await.unwrap();
    assert_eq!(github.pull_calls.load(Ordering::SeqCst), 1);

    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    let repo = repos.into_iter().find(|r| r.name == "alpha").unwrap();

    // A pull sync moments after completion answers from the database.
    let open = engine.sync_pulls(&user, &repo, false).await.unwrap();
    assert_eq!(open, 1);
    assert_eq!(github.pull_calls.load(Ordering::SeqCst), 1);

    // Force goes back to the API.
    engine.sync_pulls(&user, &repo, true).await.unwrap();
    assert_eq!(github.pull_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fresh_repo_resources_skip_the_refetch() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    github.set_commits("alpha", vec![remote_commit("aaa", "first")]);
    github.set_tree("alpha", vec![tree_entry("src/lib.rs", "s1")]);

    let cfg = Sync {
        freshness_window_ms: 3_600_000,
        ..sync_cfg()
    };
    let engine = engine(&pool, Arc::clone(&github), cfg);
    let repo_id = ids::repo_id("octocat", "alpha").to_string();
    db::upsert_repo(
        &pool,
        &db::RepoRow {
            id: repo_id.clone(),
            user_id: user.id.clone(),
            github_id: Some(1),
            owner: "octocat".into(),
            name: "alpha".into(),
            full_name: "octocat/alpha".into(),
            private: false,
            default_branch: Some("main".into()),
            pushed_at: None,
            updated_at: None,
        },
    )
    .await
    .unwrap();

    engine.sync_repo(&user, &repo_id, false).await.unwrap();
    assert_eq!(github.commit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(github.pull_calls.load(Ordering::SeqCst), 1);

    // Still inside the window: commits, tree, and pulls all stay local.
    engine.sync_repo(&user, &repo_id, false).await.unwrap();
    assert_eq!(github.commit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(github.pull_calls.load(Ordering::SeqCst), 1);

    engine.sync_repo(&user, &repo_id, true).await.unwrap();
    assert_eq!(github.commit_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn auth_failure_poisons_the_token_and_blocks_later_syncs() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    *github.repos_error.lock().unwrap() =
        Some(|| GithubError::AuthFailed("bad credentials".into()));

    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    let err = engine.full_account_sync(&user, false).await.unwrap_err();
    assert!(err.to_string().contains("authentication failed"));

    let token_state = db::get_sync_state(&pool, "token", &user.id, "github")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(token_state.status, "auth_invalid");

    // Later syncs short-circuit before touching the API again.
    let calls_before = github.list_repo_calls.load(Ordering::SeqCst);
    let err = engine.full_account_sync(&user, false).await.unwrap_err();
    assert!(err.to_string().contains("marked invalid"));
    assert_eq!(github.list_repo_calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn transient_errors_are_recorded_in_sync_state() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    *github.repos_error.lock().unwrap() = Some(|| GithubError::Status {
        status: 502,
        body: "bad gateway".into(),
    });

    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    engine.full_account_sync(&user, false).await.unwrap_err();

    let state = db::get_sync_state(&pool, "initial_sync", &user.id, "account")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, "error");
    assert!(state.error_message.unwrap().contains("502"));

    // The failure clears on the next successful run.
    *github.repos_error.lock().unwrap() = None;
    engine.full_account_sync(&user, false).await.unwrap();
    let state = db::get_sync_state(&pool, "initial_sync", &user.id, "account")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, "completed");
    assert!(state.error_message.is_none());
}

#[tokio::test]
async fn hook_registration_failures_do_not_abort_the_sync() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    *github.hook_error.lock().unwrap() = Some(|| GithubError::Status {
        status: 404,
        body: "no admin access".into(),
    });

    let progress = engine(&pool, Arc::clone(&github), sync_cfg())
        .full_account_sync(&user, false)
        .await
        .unwrap();
    assert_eq!(progress.repos, 1);
    assert_eq!(progress.hooks, 0);

    let state = db::get_sync_state(&pool, "initial_sync", &user.id, "account")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, "completed");
}

#[tokio::test]
async fn repo_rename_keeps_the_same_local_row() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "old-name")]));

    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    engine.full_account_sync(&user, false).await.unwrap();
    let before = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(before.len(), 1);

    *github.repos.lock().unwrap() = vec![remote_repo(1, "new-name")];
    engine.full_account_sync(&user, false).await.unwrap();

    let after = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].name, "new-name");
}

#[tokio::test]
async fn sync_jobs_run_and_delete_on_success() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![remote_repo(1, "alpha")]));
    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    let queue_cfg = gh_syncd::config::Queue {
        base_delay_ms: 0,
        ..gh_syncd::config::Queue::default()
    };

    db::enqueue_sync_job(&pool, &user.id, gh_syncd::model::SyncJobKind::FullSync, None, 3)
        .await
        .unwrap();
    assert!(gh_syncd::jobs::process_next_job(&pool, &engine, &queue_cfg).await.unwrap());

    // Job is gone, work happened.
    assert!(!gh_syncd::jobs::process_next_job(&pool, &engine, &queue_cfg).await.unwrap());
    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(repos.len(), 1);
}

#[tokio::test]
async fn failing_sync_jobs_back_off_then_dead_letter() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", Some("tok")).await.unwrap();
    let github = Arc::new(RecordingGithub::with_repos(vec![]));
    let engine = engine(&pool, Arc::clone(&github), sync_cfg());
    let queue_cfg = gh_syncd::config::Queue {
        base_delay_ms: 0,
        ..gh_syncd::config::Queue::default()
    };

    // References a repo that does not exist locally.
    let job_id = db::enqueue_sync_job(
        &pool,
        &user.id,
        gh_syncd::model::SyncJobKind::PrSync,
        Some("missing-repo"),
        2,
    )
    .await
    .unwrap();

    assert!(gh_syncd::jobs::process_next_job(&pool, &engine, &queue_cfg).await.unwrap());
    let (status, attempts): (String, i64) =
        sqlx::query_as("SELECT status, attempts FROM sync_jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(attempts, 1);

    assert!(gh_syncd::jobs::process_next_job(&pool, &engine, &queue_cfg).await.unwrap());
    let status: String = sqlx::query_scalar("SELECT status FROM sync_jobs WHERE id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "dead_letter");

    // Dead-lettered jobs are never picked up again.
    assert!(!gh_syncd::jobs::process_next_job(&pool, &engine, &queue_cfg).await.unwrap());
}
