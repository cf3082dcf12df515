//! HTTP intake for webhook deliveries.
//!
//! The receive path does the minimum synchronous work: validate headers,
//! persist the delivery into the queue, trigger a processing pass, and
//! answer 202. Actual event handling happens in the processor.

use crate::config::Queue;
use crate::db::{self, Pool};
use crate::processor::{self, ProcessorGate};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub gate: Arc<ProcessorGate>,
    pub queue_cfg: Queue,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Accept a webhook delivery. Replies 202 for both fresh and duplicate
/// deliveries; the body says which. 400 means the sender omitted the
/// identifying headers and a retry would not help.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let Some(event) = header_str(&headers, "x-github-event") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing x-github-event header" })),
        );
    };
    let Some(delivery_id) = header_str(&headers, "x-github-delivery") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing x-github-delivery header" })),
        );
    };
    let action = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("action").and_then(Value::as_str).map(str::to_owned));

    let outcome = match db::enqueue_webhook(
        &state.pool,
        delivery_id,
        event,
        action.as_deref(),
        &body,
        state.queue_cfg.max_attempts,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to enqueue webhook");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "enqueue failed" })),
            );
        }
    };

    if outcome.duplicate {
        debug!(delivery_id, event, "duplicate delivery ignored");
    } else {
        info!(delivery_id, event, "delivery queued");
        trigger_processing(&state);
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "queued": outcome.queued, "duplicate": outcome.duplicate })),
    )
}

/// Kick a queue pass without blocking the response. The gate coalesces
/// concurrent kicks into at most one active pass plus one rerun.
pub fn trigger_processing(state: &AppState) {
    let pool = state.pool.clone();
    let gate = Arc::clone(&state.gate);
    let cfg = state.queue_cfg.clone();
    tokio::spawn(async move {
        if let Err(err) = processor::run_gated(&gate, &pool, &cfg).await {
            error!(error = %format!("{err:#}"), "queue pass failed");
        }
    });
}
