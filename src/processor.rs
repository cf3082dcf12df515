//! Drains the webhook queue: claims due items, dispatches them, and applies
//! retry backoff, dead-lettering, and stale-claim recovery.

use crate::config::Queue;
use crate::db::{self, Pool};
use crate::dispatch;
use crate::model::{QueueStatus, RunStats};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Exponential backoff with jitter for a failed queue item.
///
/// `base * 2^attempt` plus a random 0..base spread so redelivered bursts do
/// not retry in lockstep. The shift is capped to keep the arithmetic sane
/// for pathological attempt counts.
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..base_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

/// Run one bounded processing pass over the queue.
///
/// Recovers stale `processing` claims first, then loops over batches of due
/// items until the queue is drained or the loop/time budget runs out. Every
/// item ends the pass in a terminal or retryable state; an item failure
/// never aborts the pass.
#[instrument(skip_all)]
pub async fn process_pending_queue(pool: &Pool, cfg: &Queue) -> Result<RunStats> {
    let started = Instant::now();
    let budget = Duration::from_millis(cfg.max_run_ms);
    let mut stats = RunStats::default();

    let cutoff = Utc::now() - ChronoDuration::milliseconds(cfg.stale_timeout_ms as i64);
    let recovered = db::recover_stale_processing(pool, cutoff).await?;
    if recovered > 0 {
        warn!(recovered, "requeued stale processing claims");
        stats.recovered = recovered;
    }

    for _ in 0..cfg.max_loops {
        if started.elapsed() >= budget {
            debug!("run budget exhausted; leaving remainder for next pass");
            break;
        }

        // Overfetch so items parked on a future next_retry_at do not starve
        // the batch of due work.
        let fetch_limit = cfg.batch_size.saturating_mul(cfg.overfetch_multiplier) as i64;
        let candidates = db::fetch_queue_candidates(pool, fetch_limit).await?;
        if candidates.is_empty() {
            break;
        }

        let now = Utc::now();
        let mut due: Vec<_> = candidates
            .into_iter()
            .filter(|item| match item.next_retry_at {
                Some(at) => {
                    if at <= now {
                        true
                    } else {
                        stats.skipped += 1;
                        false
                    }
                }
                None => true,
            })
            .collect();
        if due.is_empty() {
            break;
        }
        due.truncate(cfg.batch_size);

        for item in due {
            let attempts = db::mark_item_processing(pool, &item.id).await?;
            match run_item(pool, &item.event, &item.payload).await {
                Ok(()) => {
                    db::mark_item_processed(pool, &item.id).await?;
                    db::record_delivery(
                        pool,
                        &item.delivery_id,
                        &item.event,
                        item.action.as_deref(),
                        QueueStatus::Processed,
                        None,
                    )
                    .await?;
                    stats.processed += 1;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    if attempts >= item.max_attempts {
                        warn!(
                            delivery_id = %item.delivery_id,
                            attempts,
                            error = %message,
                            "retries exhausted; dead-lettering"
                        );
                        db::mark_item_dead_letter(pool, &item.id, &message).await?;
                        db::record_delivery(
                            pool,
                            &item.delivery_id,
                            &item.event,
                            item.action.as_deref(),
                            QueueStatus::Failed,
                            Some(&message),
                        )
                        .await?;
                    } else {
                        let delay = calculate_backoff(attempts as u32, cfg.base_delay_ms);
                        let next = Utc::now()
                            + ChronoDuration::milliseconds(delay.as_millis() as i64);
                        debug!(
                            delivery_id = %item.delivery_id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "item failed; scheduling retry"
                        );
                        db::mark_item_failed(pool, &item.id, next, &message).await?;
                    }
                    stats.failed += 1;
                }
            }
        }
    }

    if stats.processed + stats.failed > 0 {
        info!(
            processed = stats.processed,
            failed = stats.failed,
            skipped = stats.skipped,
            "queue pass complete"
        );
    }
    Ok(stats)
}

async fn run_item(pool: &Pool, event_type: &str, payload: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    dispatch::dispatch(pool, event_type, &value).await
}

/// Single-flight gate for queue passes.
///
/// At most one pass runs at a time; triggers that arrive while a pass is
/// active coalesce into exactly one follow-up pass, so no enqueue is ever
/// left waiting for the next poll tick.
#[derive(Default)]
pub struct ProcessorGate {
    running: AtomicBool,
    rerun: AtomicBool,
}

impl ProcessorGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass. Returns true when the caller should run it; false
    /// means an active pass will pick the request up as a rerun.
    pub fn try_begin(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            self.rerun.store(true, Ordering::Release);
            // The active pass may have finished between the exchange and the
            // store. Re-check so the request is not dropped.
            if self.rerun.load(Ordering::Acquire)
                && self
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.rerun.store(false, Ordering::Release);
                return true;
            }
            false
        }
    }

    /// Finish a pass. Returns true when a coalesced rerun is pending and the
    /// caller should go around again.
    pub fn finish(&self) -> bool {
        if self.rerun.swap(false, Ordering::AcqRel) {
            true
        } else {
            self.running.store(false, Ordering::Release);
            false
        }
    }
}

/// Run queue passes until no rerun request is pending.
pub async fn run_gated(gate: &ProcessorGate, pool: &Pool, cfg: &Queue) -> Result<RunStats> {
    let mut total = RunStats::default();
    if !gate.try_begin() {
        return Ok(total);
    }
    loop {
        match process_pending_queue(pool, cfg).await {
            Ok(stats) => total.merge(stats),
            Err(err) => {
                // Release the gate before propagating so a failed pass
                // cannot wedge the processor.
                while gate.finish() {}
                return Err(err);
            }
        }
        if !gate.finish() {
            break;
        }
    }
    Ok(total)
}
