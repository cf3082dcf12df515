use async_trait::async_trait;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::RateLimitInfo;
use crate::github::model::{RemoteCommit, RemoteOrg, RemotePull, RemoteRepo, RemoteTree, RemoteTreeEntry};

pub mod model;

const GITHUB_API_BASE: &str = "https://api.github.com/";
const PAGE_SIZE: usize = 100;

/// Errors surfaced by the GitHub client. Rate limiting and auth failure are
/// distinguished because callers treat them differently: the former is
/// retried inside the client, the latter poisons the token's sync state.
#[derive(Debug, Error)]
pub enum GithubError {
    #[error("github rate limited ({status}): {body}")]
    RateLimited {
        status: u16,
        retry_after_secs: Option<u64>,
        reset: Option<i64>,
        body: String,
    },
    #[error("github authentication failed: {0}")]
    AuthFailed(String),
    #[error("github error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("github request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid github url: {0}")]
    Config(String),
}

impl GithubError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GithubError::RateLimited { .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, GithubError::AuthFailed(_))
    }

    /// Base delay before the next retry of a rate-limited call: honor
    /// Retry-After when present, else wait until the reset time (capped at
    /// 60s), else fall back to the configured base delay.
    fn suggested_delay(&self, base: Duration) -> Duration {
        match self {
            GithubError::RateLimited {
                retry_after_secs,
                reset,
                ..
            } => {
                if let Some(secs) = retry_after_secs {
                    return Duration::from_secs(*secs);
                }
                if let Some(reset) = reset {
                    let until = reset - chrono::Utc::now().timestamp();
                    if until > 0 {
                        return Duration::from_secs(until.min(60) as u64);
                    }
                }
                base
            }
            _ => base,
        }
    }
}

/// Retry `op` while it fails with a rate-limit error, up to `max_retries`
/// attempts in total. `max_retries` bounds every call of `op` including the
/// first, so 3 means one initial attempt and at most two retries. Wait
/// before attempt `n` is `delay * 2^n` plus up to 1s of jitter.
/// Non-rate-limit errors, and the final attempt's error, propagate
/// unmodified.
pub async fn with_rate_limit_retry<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, GithubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GithubError>>,
{
    let max_attempts = max_retries.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_rate_limited() || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = err.suggested_delay(base_delay);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                let wait = delay.saturating_mul(1 << attempt.min(16)) + jitter;
                warn!(attempt, wait_ms = wait.as_millis() as u64, "rate limited; backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Read the rate-limit snapshot GitHub attaches to every response.
fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = header_i64(headers, "x-ratelimit-remaining")?;
    let limit = header_i64(headers, "x-ratelimit-limit")?;
    Some(RateLimitInfo {
        remaining,
        limit,
        reset: header_i64(headers, "x-ratelimit-reset").unwrap_or(0),
        used: header_i64(headers, "x-ratelimit-used").unwrap_or(0),
    })
}

/// GitHub REST operations the sync engine depends on. Implemented by the
/// real client and by recording mocks in tests.
#[async_trait]
pub trait GithubService: Send + Sync {
    async fn list_orgs(&self) -> Result<Vec<RemoteOrg>, GithubError>;
    async fn list_repos(&self) -> Result<Vec<RemoteRepo>, GithubError>;
    async fn get_repo(&self, owner: &str, name: &str) -> Result<RemoteRepo, GithubError>;
    async fn list_open_pulls(&self, owner: &str, name: &str)
        -> Result<Vec<RemotePull>, GithubError>;
    async fn list_commits(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<RemoteCommit>, GithubError>;
    async fn get_tree(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<RemoteTreeEntry>, GithubError>;
    async fn register_webhook(
        &self,
        owner: &str,
        name: &str,
        callback_url: &str,
    ) -> Result<(), GithubError>;

    /// Most recent rate-limit snapshot seen by this client instance.
    fn rate_limit_snapshot(&self) -> Option<RateLimitInfo>;
}

#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    base_url: Url,
    token: String,
    max_retries: u32,
    base_delay: Duration,
    rate_limit: Arc<Mutex<Option<RateLimitInfo>>>,
}

impl fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn new(token: String, max_retries: u32, base_delay: Duration) -> Self {
        let base_url = Url::parse(GITHUB_API_BASE).expect("valid default GitHub URL");
        Self::with_base_url(token, max_retries, base_delay, base_url)
    }

    pub fn with_base_url(
        token: String,
        max_retries: u32,
        base_delay: Duration,
        base_url: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("gh-syncd/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            max_retries,
            base_delay,
            rate_limit: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_api_base(
        token: String,
        api_base: &str,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<Self, GithubError> {
        let base_url = Url::parse(api_base).map_err(|e| GithubError::Config(e.to_string()))?;
        Ok(Self::with_base_url(token, max_retries, base_delay, base_url))
    }

    fn endpoint(&self, path: &str) -> Result<Url, GithubError> {
        self.base_url
            .join(path)
            .map_err(|e| GithubError::Config(e.to_string()))
    }

    /// Record the rate-limit headers and map error statuses. 403 with an
    /// exhausted remaining count is rate limiting in disguise.
    async fn classify(&self, res: Response) -> Result<Response, GithubError> {
        let snapshot = parse_rate_limit(res.headers());
        if let Some(rl) = snapshot {
            if let Ok(mut guard) = self.rate_limit.lock() {
                *guard = Some(rl);
            }
        }

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let retry_after_secs = header_i64(res.headers(), "retry-after").map(|v| v.max(0) as u64);
        let reset = snapshot.map(|rl| rl.reset).filter(|r| *r > 0);
        let body = res.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            return Err(GithubError::AuthFailed(body));
        }
        let exhausted = snapshot.is_some_and(|rl| rl.remaining == 0);
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && exhausted)
        {
            return Err(GithubError::RateLimited {
                status: status.as_u16(),
                retry_after_secs,
                reset,
                body,
            });
        }
        Err(GithubError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GithubError> {
        with_rate_limit_retry(self.max_retries, self.base_delay, || async {
            let url = self.endpoint(path)?;
            debug!(%url, "github GET");
            let res = self
                .http
                .get(url)
                .query(query)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Accept", "application/vnd.github+json")
                .send()
                .await?;
            let res = self.classify(res).await?;
            Ok(res.json::<T>().await?)
        })
        .await
    }

    /// Follow list pagination until a short page; every page refreshes the
    /// cached rate-limit snapshot.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<T>, GithubError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query: Vec<(&str, String)> = extra.to_vec();
            query.push(("per_page", PAGE_SIZE.to_string()));
            query.push(("page", page.to_string()));
            let batch: Vec<T> = self.get_json(path, &query).await?;
            let len = batch.len();
            out.extend(batch);
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl GithubService for GithubClient {
    async fn list_orgs(&self) -> Result<Vec<RemoteOrg>, GithubError> {
        self.get_paged("user/orgs", &[]).await
    }

    async fn list_repos(&self) -> Result<Vec<RemoteRepo>, GithubError> {
        self.get_paged("user/repos", &[("sort", "pushed".to_string())])
            .await
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<RemoteRepo, GithubError> {
        self.get_json(&format!("repos/{owner}/{name}"), &[]).await
    }

    async fn list_open_pulls(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<RemotePull>, GithubError> {
        self.get_paged(
            &format!("repos/{owner}/{name}/pulls"),
            &[("state", "open".to_string())],
        )
        .await
    }

    async fn list_commits(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<RemoteCommit>, GithubError> {
        self.get_paged(
            &format!("repos/{owner}/{name}/commits"),
            &[("sha", branch.to_string())],
        )
        .await
    }

    async fn get_tree(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<RemoteTreeEntry>, GithubError> {
        let tree: RemoteTree = self
            .get_json(
                &format!("repos/{owner}/{name}/git/trees/{branch}"),
                &[("recursive", "1".to_string())],
            )
            .await?;
        if tree.truncated {
            warn!(owner, name, branch, "tree listing truncated by GitHub");
        }
        Ok(tree.tree)
    }

    async fn register_webhook(
        &self,
        owner: &str,
        name: &str,
        callback_url: &str,
    ) -> Result<(), GithubError> {
        let body = json!({
            "name": "web",
            "active": true,
            "events": ["*"],
            "config": { "url": callback_url, "content_type": "json" },
        });
        let result = with_rate_limit_retry(self.max_retries, self.base_delay, || async {
            let url = self.endpoint(&format!("repos/{owner}/{name}/hooks"))?;
            let res = self
                .http
                .post(url)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Accept", "application/vnd.github+json")
                .json(&body)
                .send()
                .await?;
            self.classify(res).await?;
            Ok(())
        })
        .await;

        match result {
            // GitHub answers 422 when an identical hook already exists;
            // registration is idempotent so that counts as success.
            Err(GithubError::Status { status: 422, .. }) => Ok(()),
            other => other,
        }
    }

    fn rate_limit_snapshot(&self) -> Option<RateLimitInfo> {
        self.rate_limit.lock().ok().and_then(|guard| *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> GithubError {
        GithubError::RateLimited {
            status: 429,
            retry_after_secs: None,
            reset: None,
            body: "slow down".into(),
        }
    }

    #[tokio::test]
    async fn non_rate_limit_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result = with_rate_limit_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(GithubError::Status {
                    status: 500,
                    body: "boom".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GithubError::Status { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_rate_limit_retry(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(rate_limited())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_rate_limit_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(rate_limited()) }
        })
        .await;
        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn suggested_delay_prefers_retry_after() {
        let err = GithubError::RateLimited {
            status: 429,
            retry_after_secs: Some(7),
            reset: Some(chrono::Utc::now().timestamp() + 500),
            body: String::new(),
        };
        assert_eq!(err.suggested_delay(Duration::from_secs(1)), Duration::from_secs(7));
    }

    #[test]
    fn suggested_delay_caps_reset_wait() {
        let err = GithubError::RateLimited {
            status: 403,
            retry_after_secs: None,
            reset: Some(chrono::Utc::now().timestamp() + 500),
            body: String::new(),
        };
        assert_eq!(err.suggested_delay(Duration::from_secs(1)), Duration::from_secs(60));
    }

    #[test]
    fn suggested_delay_falls_back_to_base() {
        let err = GithubError::RateLimited {
            status: 429,
            retry_after_secs: None,
            reset: None,
            body: String::new(),
        };
        assert_eq!(err.suggested_delay(Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(
            GithubError::AuthFailed(String::new()).suggested_delay(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn parses_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "42".parse().unwrap());
        headers.insert("x-ratelimit-limit", "5000".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1700000000".parse().unwrap());
        headers.insert("x-ratelimit-used", "4958".parse().unwrap());
        let rl = parse_rate_limit(&headers).unwrap();
        assert_eq!(rl.remaining, 42);
        assert_eq!(rl.limit, 5000);
        assert_eq!(rl.reset, 1_700_000_000);
        assert_eq!(rl.used, 4958);
    }

    #[test]
    fn missing_headers_yield_no_snapshot() {
        assert!(parse_rate_limit(&HeaderMap::new()).is_none());
    }
}
