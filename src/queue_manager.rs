//! The queue manager: claims pending items for one queue type and drives
//! them through the processor registry within a wall-clock budget.
//!
//! Scheduling is cooperative and batch-oriented. There is no long-running
//! worker; each run is triggered externally, claims items one at a time
//! (exclusively, via the store's conditional update), and voluntarily stops
//! claiming when the budget expires. The budget check between items is the
//! only cancellation point: an item's processing is never preempted
//! mid-flight.

use std::time::Instant;

use chrono::{Duration, Utc};

use crate::config::Config;
use crate::db::SyncDb;
use crate::envelope::CanonicalEvent;
use crate::error::{ProcessingError, StoreError};
use crate::hooks::{run_side_effects, Notifier};
use crate::processors::ProcessorRegistry;
use crate::types::{rfc3339, MetricSample, QueueItem, QueueType, RunSummary};

/// Bounds for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub batch_size: u32,
    pub max_runtime_secs: u64,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            max_runtime_secs: config.max_runtime_secs,
        }
    }
}

/// Retry backoff for the given attempt number (1-based): exponential from
/// 30 seconds, capped at one hour. The scheduler cadence is the effective
/// floor on actual retry latency; `next_retry_at` only gates claims.
pub fn backoff(attempt: u32) -> Duration {
    const BASE_SECS: i64 = 30;
    const CAP_SECS: i64 = 3600;
    let exponent = attempt.saturating_sub(1).min(30);
    let secs = BASE_SECS.saturating_mul(1i64 << exponent);
    Duration::seconds(secs.min(CAP_SECS))
}

/// Run one bounded batch for one queue type.
///
/// Items are claimed one at a time so a budget stop never strands claimed
/// rows in `processing`. A handler error is converted into that item's
/// outcome and never aborts the run; only store-level failures do.
pub fn run_batch(
    db: &SyncDb,
    registry: &ProcessorRegistry,
    notifier: &dyn Notifier,
    queue_type: QueueType,
    opts: &RunOptions,
) -> Result<RunSummary, StoreError> {
    let started = Instant::now();
    let mut items_processed = 0u32;
    let mut items_failed = 0u32;
    let mut stopped_early = false;

    log::info!(
        "Queue: starting {} run (batch {}, budget {}s)",
        queue_type.as_str(),
        opts.batch_size,
        opts.max_runtime_secs
    );

    for _ in 0..opts.batch_size {
        if started.elapsed().as_secs() >= opts.max_runtime_secs {
            stopped_early = db.claimable_depth(queue_type, &rfc3339(Utc::now()))? > 0;
            break;
        }

        let now = rfc3339(Utc::now());
        let mut claimed = db.claim_batch(queue_type, 1, &now)?;
        let Some(item) = claimed.pop() else {
            break;
        };

        match process_item(db, registry, notifier, &item, &now)? {
            true => items_processed += 1,
            false => items_failed += 1,
        }
    }

    // Batch size reached with claimable work left also counts as early
    if !stopped_early && items_processed + items_failed >= opts.batch_size {
        stopped_early = db.claimable_depth(queue_type, &rfc3339(Utc::now()))? > 0;
    }

    let summary = RunSummary {
        success: true,
        queue_type,
        runtime_seconds: started.elapsed().as_secs_f64(),
        items_processed,
        items_failed,
        stopped_early,
    };
    log::info!(
        "Queue: {} run done, {} processed, {} failed in {:.2}s{}",
        queue_type.as_str(),
        summary.items_processed,
        summary.items_failed,
        summary.runtime_seconds,
        if summary.stopped_early { " (stopped early)" } else { "" }
    );
    Ok(summary)
}

/// Process one claimed item end to end. Returns true on success.
fn process_item(
    db: &SyncDb,
    registry: &ProcessorRegistry,
    notifier: &dyn Notifier,
    item: &QueueItem,
    claimed_at: &str,
) -> Result<bool, StoreError> {
    let result = CanonicalEvent::from_queue_item(item)
        .and_then(|event| registry.dispatch(db, &event));

    let completed_at = rfc3339(Utc::now());
    let success = result.is_ok();
    let error_kind = result.as_ref().err().map(|e| e.kind().to_string());

    match result {
        Ok(effects) => {
            db.mark_completed(&item.id, &completed_at)?;
            // Post-commit, error-isolated; a failed send never fails the item
            run_side_effects(&effects, notifier);
        }
        Err(error) => record_failure(db, item, &error, &completed_at)?,
    }

    db.insert_metric_sample(&MetricSample {
        event_id: item.event_id.clone(),
        tenant_id: item.tenant_id.clone(),
        queue_type: item.queue_type,
        received_at: item.received_at.clone(),
        claimed_at: Some(claimed_at.to_string()),
        completed_at,
        success,
        error_kind,
    })?;

    Ok(success)
}

/// Apply the retry policy to one failed item.
///
/// Validation and unsupported errors are terminal immediately: the same
/// bytes produce the same failure on every retry. Retryable errors re-queue
/// with backoff until the attempt ceiling, then fail terminally.
pub fn record_failure(
    db: &SyncDb,
    item: &QueueItem,
    error: &ProcessingError,
    now: &str,
) -> Result<(), StoreError> {
    let message = error.to_string();
    let next_attempt = item.attempts + 1;

    if !error.is_retryable() {
        log::warn!("Queue: item {} failed terminally: {}", item.event_id, message);
        db.mark_failed(&item.id, now, &message)?;
        return Ok(());
    }

    if next_attempt >= item.max_attempts {
        log::warn!(
            "Queue: item {} exhausted {} attempts: {}",
            item.event_id,
            item.max_attempts,
            message
        );
        db.mark_failed(&item.id, now, &message)?;
        return Ok(());
    }

    let next_retry_at = rfc3339(Utc::now() + backoff(next_attempt));
    log::info!(
        "Queue: item {} attempt {}/{} failed, retrying after {}: {}",
        item.event_id,
        next_attempt,
        item.max_attempts,
        next_retry_at,
        message
    );
    db.requeue_for_retry(&item.id, &next_retry_at, &message)
}
