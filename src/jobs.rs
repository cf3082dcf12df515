//! Background sync jobs: durable requests for engine work, drained one at a
//! time with the same retry and dead-letter discipline as the webhook queue.

use crate::config::Queue;
use crate::db::{self, Pool};
use crate::model::SyncJobKind;
use crate::processor::calculate_backoff;
use crate::sync::SyncEngine;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, instrument, warn};

/// Claim and run the oldest due sync job. Returns false when nothing was due.
///
/// Success deletes the job; failure reschedules it with backoff until its
/// attempt budget runs out, then dead-letters it.
#[instrument(skip_all)]
pub async fn process_next_job(pool: &Pool, engine: &SyncEngine, cfg: &Queue) -> Result<bool> {
    let Some(job) = db::next_due_sync_job(pool).await? else {
        return Ok(false);
    };
    let Some(kind) = SyncJobKind::parse(&job.kind) else {
        warn!(job = %job.id, kind = %job.kind, "unknown sync job kind; dead-lettering");
        db::dead_letter_sync_job(pool, &job.id, "unknown job kind").await?;
        return Ok(true);
    };

    let result = run_job(pool, engine, kind, &job.user_id, job.resource_id.as_deref()).await;
    match result {
        Ok(()) => {
            info!(job = %job.id, kind = %job.kind, "sync job complete");
            db::delete_sync_job(pool, &job.id).await?;
        }
        Err(err) => {
            let message = format!("{err:#}");
            let attempts = job.attempts + 1;
            if attempts >= job.max_attempts {
                warn!(job = %job.id, attempts, error = %message, "sync job dead-lettered");
                db::dead_letter_sync_job(pool, &job.id, &message).await?;
            } else {
                let delay = calculate_backoff(attempts as u32, cfg.base_delay_ms);
                let next = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
                debug!(job = %job.id, attempts, error = %message, "sync job failed; rescheduling");
                db::backoff_sync_job(pool, &job.id, next, &message).await?;
            }
        }
    }
    Ok(true)
}

async fn run_job(
    pool: &Pool,
    engine: &SyncEngine,
    kind: SyncJobKind,
    user_id: &str,
    resource_id: Option<&str>,
) -> Result<()> {
    let Some(user) = db::find_user_by_id(pool, user_id).await? else {
        anyhow::bail!("user {user_id} not found");
    };
    match kind {
        SyncJobKind::FullSync => {
            engine.full_account_sync(&user, false).await?;
            Ok(())
        }
        SyncJobKind::RepoSync => {
            let Some(repo_id) = resource_id else {
                anyhow::bail!("repo sync job without a repo id");
            };
            engine.sync_repo(&user, repo_id, false).await
        }
        SyncJobKind::PrSync => {
            let Some(repo_id) = resource_id else {
                anyhow::bail!("pull sync job without a repo id");
            };
            let Some(repo) = db::find_repo(pool, repo_id).await? else {
                anyhow::bail!("repo {repo_id} not found");
            };
            engine.sync_pulls(&user, &repo, false).await?;
            Ok(())
        }
    }
}
