//! Bounded-concurrency mapping over a list of async operations.
//!
//! A fixed number of logical workers pull indexes from one shared cursor, so
//! a slow item never blocks assignment of later items to idle workers.
//! Results are returned in input order regardless of completion order.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Apply `f` to every item with at most `width` calls in flight.
///
/// `width == 0` is an error. Empty input returns `[]` without running any
/// worker. The first error aborts the whole map.
pub async fn map_with_concurrency<T, R, F, Fut>(items: Vec<T>, width: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    if width == 0 {
        return Err(anyhow!("concurrency width must be > 0"));
    }
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let cursor = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<T>>> = items.into_iter().map(|i| Mutex::new(Some(i))).collect();

    let workers = (0..width.min(total)).map(|_| {
        let cursor = &cursor;
        let slots = &slots;
        let f = &f;
        async move {
            let mut collected: Vec<(usize, R)> = Vec::new();
            loop {
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                if idx >= total {
                    break;
                }
                let item = slots[idx]
                    .lock()
                    .map_err(|_| anyhow!("worker slot lock poisoned"))?
                    .take()
                    .ok_or_else(|| anyhow!("worker slot {idx} taken twice"))?;
                let out = f(item).await?;
                collected.push((idx, out));
            }
            Ok::<_, anyhow::Error>(collected)
        }
    });

    let partials = futures::future::try_join_all(workers).await?;

    let mut results: Vec<Option<R>> = Vec::with_capacity(total);
    results.resize_with(total, || None);
    for (idx, value) in partials.into_iter().flatten() {
        results[idx] = Some(value);
    }
    results
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| slot.ok_or_else(|| anyhow!("missing result for item {idx}")))
        .collect()
}
