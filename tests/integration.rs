use chrono::{Duration as ChronoDuration, Utc};
use gh_syncd::config::Queue;
use gh_syncd::db;
use gh_syncd::processor::process_pending_queue;
use serde_json::json;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn queue_cfg() -> Queue {
    Queue {
        max_attempts: 3,
        base_delay_ms: 0,
        batch_size: 5,
        max_loops: 20,
        max_run_ms: 15_000,
        overfetch_multiplier: 3,
        stale_timeout_ms: 600_000,
    }
}

fn pull_request_payload(number: i64, title: &str) -> String {
    json!({
        "action": "opened",
        "repository": {
            "id": 501,
            "name": "hello-world",
            "full_name": "octocat/hello-world",
            "owner": { "login": "octocat" },
            "private": false,
            "default_branch": "main"
        },
        "sender": { "login": "octocat" },
        "pull_request": {
            "number": number,
            "title": title,
            "state": "open",
            "user": { "login": "contributor" },
            "head": { "sha": "abc123" },
            "base": { "ref": "main" },
            "draft": false,
            "updated_at": "2024-05-01T10:00:00Z"
        }
    })
    .to_string()
}

#[tokio::test]
async fn webhook_flows_from_intake_to_domain_rows() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", None).await.unwrap();

    let outcome = db::enqueue_webhook(
        &pool,
        "delivery-1",
        "pull_request",
        Some("opened"),
        &pull_request_payload(42, "Add feature"),
        3,
    )
    .await
    .unwrap();
    assert!(outcome.queued);
    assert!(!outcome.duplicate);

    let stats = process_pending_queue(&pool, &queue_cfg()).await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);

    // The event materialized a repo and a pull for the known local user.
    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].full_name, "octocat/hello-world");
    let pulls = db::list_pulls_for_repo(&pool, &repos[0].id).await.unwrap();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].number, 42);

    // Terminal outcome is written exactly once.
    let (status, event): (String, String) = sqlx::query_as(
        "SELECT status, event FROM webhook_deliveries WHERE delivery_id = 'delivery-1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "processed");
    assert_eq!(event, "pull_request");
}

#[tokio::test]
async fn duplicate_deliveries_are_rejected_at_every_stage() {
    let pool = setup_pool().await;
    db::get_or_create_user(&pool, "octocat", None).await.unwrap();
    let payload = pull_request_payload(1, "One");

    let first = db::enqueue_webhook(&pool, "dup-1", "pull_request", Some("opened"), &payload, 3)
        .await
        .unwrap();
    assert!(first.queued);

    // Same delivery id while still queued.
    let second = db::enqueue_webhook(&pool, "dup-1", "pull_request", Some("opened"), &payload, 3)
        .await
        .unwrap();
    assert!(second.duplicate);
    assert!(!second.queued);

    process_pending_queue(&pool, &queue_cfg()).await.unwrap();

    // Same delivery id after it reached a terminal state.
    let third = db::enqueue_webhook(&pool, "dup-1", "pull_request", Some("opened"), &payload, 3)
        .await
        .unwrap();
    assert!(third.duplicate);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn redelivery_converges_instead_of_duplicating_rows() {
    let pool = setup_pool().await;
    let user = db::get_or_create_user(&pool, "octocat", None).await.unwrap();

    // GitHub redelivers under a fresh delivery id; deterministic ids make
    // the second processing an upsert of the same rows.
    for delivery in ["redo-a", "redo-b"] {
        db::enqueue_webhook(
            &pool,
            delivery,
            "pull_request",
            Some("opened"),
            &pull_request_payload(7, "Same pull"),
            3,
        )
        .await
        .unwrap();
    }
    let stats = process_pending_queue(&pool, &queue_cfg()).await.unwrap();
    assert_eq!(stats.processed, 2);

    let repos = db::list_repos_for_user(&pool, &user.id).await.unwrap();
    assert_eq!(repos.len(), 1);
    let pulls = db::list_pulls_for_repo(&pool, &repos[0].id).await.unwrap();
    assert_eq!(pulls.len(), 1);
}

#[tokio::test]
async fn poison_item_is_retried_then_dead_lettered() {
    let pool = setup_pool().await;
    let outcome = db::enqueue_webhook(&pool, "poison-1", "push", None, "{broken", 3)
        .await
        .unwrap();
    let item_id = outcome.queue_item_id.unwrap();

    // base_delay_ms of zero makes every retry due immediately, so one pass
    // walks the item through all three attempts.
    process_pending_queue(&pool, &queue_cfg()).await.unwrap();

    let item = db::get_queue_item(&pool, &item_id).await.unwrap().unwrap();
    assert_eq!(item.status, "dead_letter");
    assert_eq!(item.attempts, 3);
    assert!(item.last_error.is_some());

    let status: String =
        sqlx::query_scalar("SELECT status FROM webhook_deliveries WHERE delivery_id = 'poison-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
}

#[tokio::test]
async fn future_retries_wait_for_their_backoff() {
    let pool = setup_pool().await;
    let outcome = db::enqueue_webhook(&pool, "backoff-1", "push", None, "{broken", 5)
        .await
        .unwrap();
    let item_id = outcome.queue_item_id.unwrap();

    let cfg = Queue {
        base_delay_ms: 60_000,
        max_attempts: 5,
        ..queue_cfg()
    };
    let stats = process_pending_queue(&pool, &cfg).await.unwrap();
    assert_eq!(stats.failed, 1);

    let item = db::get_queue_item(&pool, &item_id).await.unwrap().unwrap();
    assert_eq!(item.status, "failed");
    assert_eq!(item.attempts, 1);
    let next = item.next_retry_at.unwrap();
    assert!(next > Utc::now());

    // A second pass sees the item but leaves it parked.
    let stats = process_pending_queue(&pool, &cfg).await.unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 1);
    let item = db::get_queue_item(&pool, &item_id).await.unwrap().unwrap();
    assert_eq!(item.attempts, 1);
}

#[tokio::test]
async fn stale_processing_claims_are_requeued_and_finished() {
    let pool = setup_pool().await;
    db::get_or_create_user(&pool, "octocat", None).await.unwrap();
    let outcome = db::enqueue_webhook(
        &pool,
        "stale-1",
        "pull_request",
        Some("opened"),
        &pull_request_payload(9, "Stuck"),
        3,
    )
    .await
    .unwrap();
    let item_id = outcome.queue_item_id.unwrap();

    // Simulate a crash mid-processing: claimed long ago, never finished.
    db::mark_item_processing(&pool, &item_id).await.unwrap();
    let long_ago = Utc::now() - ChronoDuration::hours(2);
    sqlx::query("UPDATE webhook_queue SET updated_at = ? WHERE id = ?")
        .bind(long_ago)
        .bind(&item_id)
        .execute(&pool)
        .await
        .unwrap();

    let stats = process_pending_queue(&pool, &queue_cfg()).await.unwrap();
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.processed, 1);

    let item = db::get_queue_item(&pool, &item_id).await.unwrap().unwrap();
    assert_eq!(item.status, "processed");
}

#[tokio::test]
async fn recent_processing_claims_are_left_alone() {
    let pool = setup_pool().await;
    let outcome = db::enqueue_webhook(&pool, "live-1", "ping", None, "{}", 3)
        .await
        .unwrap();
    let item_id = outcome.queue_item_id.unwrap();
    db::mark_item_processing(&pool, &item_id).await.unwrap();

    let stats = process_pending_queue(&pool, &queue_cfg()).await.unwrap();
    assert_eq!(stats.recovered, 0);
    assert_eq!(stats.processed, 0);

    let item = db::get_queue_item(&pool, &item_id).await.unwrap().unwrap();
    assert_eq!(item.status, "processing");
}

#[tokio::test]
async fn batch_processing_respects_creation_order() {
    let pool = setup_pool().await;
    db::get_or_create_user(&pool, "octocat", None).await.unwrap();
    for n in 0..8 {
        db::enqueue_webhook(
            &pool,
            &format!("order-{n}"),
            "pull_request",
            Some("opened"),
            &pull_request_payload(n, &format!("Pull {n}")),
            3,
        )
        .await
        .unwrap();
    }

    let cfg = Queue {
        batch_size: 3,
        ..queue_cfg()
    };
    let stats = process_pending_queue(&pool, &cfg).await.unwrap();
    assert_eq!(stats.processed, 8);

    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_queue WHERE status IN ('pending', 'failed')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining, 0);
}
