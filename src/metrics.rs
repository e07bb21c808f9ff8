//! Read-side health rollups over metric samples and queue counts.
//!
//! This surface feeds an external dashboard. It performs no writes and must
//! tolerate partial data: a queue with no samples yet reports zeros, and
//! samples with unparseable timestamps are skipped rather than failing the
//! snapshot.

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::db::{SampleRow, SyncDb};
use crate::error::StoreError;
use crate::types::{rfc3339, QueueType};

/// Rollup window for throughput, error rate, and wait percentiles, minutes.
const WINDOW_MINUTES: i64 = 60;

/// Health rollup for one queue type.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub queue_type: QueueType,
    pub pending: u32,
    pub processing: u32,
    pub failed: u32,
    /// Completed samples inside the rollup window.
    pub throughput_last_hour: u32,
    /// Failed fraction of windowed samples, 0.0 when there are none.
    pub error_rate: f64,
    pub avg_wait_secs: f64,
    pub p95_wait_secs: f64,
    pub sla_target_secs: u64,
    /// Fraction of windowed samples whose received→completed wait met the
    /// target. 1.0 when there are no samples (nothing has missed it).
    pub sla_compliance: f64,
    /// Age of the oldest pending item, None when the queue is drained.
    pub oldest_pending_age_secs: Option<i64>,
}

/// One dashboard snapshot across all queue types.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaSnapshot {
    pub generated_at: String,
    pub queues: Vec<QueueHealth>,
}

/// Build a snapshot as of `now`.
pub fn sla_snapshot(
    db: &SyncDb,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<SlaSnapshot, StoreError> {
    let since = rfc3339(now - Duration::minutes(WINDOW_MINUTES));
    let mut queues = Vec::with_capacity(QueueType::ALL.len());

    for queue_type in QueueType::ALL {
        let counts = db.queue_counts(queue_type)?;
        let samples = db.samples_since(queue_type, &since)?;
        let target_secs = config.sla_target_secs(queue_type);

        let waits = wait_seconds(&samples);
        let failures = samples.iter().filter(|s| !s.success).count();

        let error_rate = if samples.is_empty() {
            0.0
        } else {
            failures as f64 / samples.len() as f64
        };
        let avg_wait = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<f64>() / waits.len() as f64
        };

        let mut sorted = waits.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p95_wait = percentile(&sorted, 95.0).unwrap_or(0.0);

        let sla_compliance = if waits.is_empty() {
            1.0
        } else {
            let met = waits.iter().filter(|&&w| w <= target_secs as f64).count();
            met as f64 / waits.len() as f64
        };

        let oldest_pending_age_secs = db
            .oldest_pending_received_at(queue_type)?
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| (now - ts.with_timezone(&Utc)).num_seconds().max(0));

        queues.push(QueueHealth {
            queue_type,
            pending: counts.pending,
            processing: counts.processing,
            failed: counts.failed,
            throughput_last_hour: samples.len() as u32,
            error_rate,
            avg_wait_secs: avg_wait,
            p95_wait_secs: p95_wait,
            sla_target_secs: target_secs,
            sla_compliance,
            oldest_pending_age_secs,
        });
    }

    Ok(SlaSnapshot {
        generated_at: rfc3339(now),
        queues,
    })
}

/// Received→completed waits in seconds, skipping unparseable rows.
fn wait_seconds(samples: &[SampleRow]) -> Vec<f64> {
    samples
        .iter()
        .filter_map(|sample| {
            let received = DateTime::parse_from_rfc3339(&sample.received_at).ok()?;
            let completed = DateTime::parse_from_rfc3339(&sample.completed_at).ok()?;
            let wait = (completed - received).num_milliseconds() as f64 / 1000.0;
            (wait >= 0.0).then_some(wait)
        })
        .collect()
}

/// Nearest-rank percentile over pre-sorted values.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricSample;

    fn sample(event_id: &str, received: &str, completed: &str, success: bool) -> MetricSample {
        MetricSample {
            event_id: event_id.into(),
            tenant_id: "loc-1".into(),
            queue_type: QueueType::Messages,
            received_at: received.into(),
            claimed_at: None,
            completed_at: completed.into(),
            success,
            error_kind: if success { None } else { Some("transient".into()) },
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 95.0), Some(95.0));
        assert_eq!(percentile(&values, 50.0), Some(50.0));
        assert_eq!(percentile(&[42.0], 95.0), Some(42.0));
        assert_eq!(percentile(&[], 95.0), None);
    }

    #[test]
    fn test_empty_queue_reports_clean_health() {
        let db = SyncDb::open_in_memory().expect("db");
        let config = Config::default();

        let snapshot = sla_snapshot(&db, &config, Utc::now()).expect("snapshot");
        assert_eq!(snapshot.queues.len(), QueueType::ALL.len());
        for queue in &snapshot.queues {
            assert_eq!(queue.pending, 0);
            assert_eq!(queue.error_rate, 0.0);
            assert_eq!(queue.sla_compliance, 1.0);
            assert!(queue.oldest_pending_age_secs.is_none());
        }
    }

    #[test]
    fn test_compliance_against_target() {
        let db = SyncDb::open_in_memory().expect("db");
        let config = Config::default();
        let now = DateTime::parse_from_rfc3339("2026-01-01T01:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);

        // Messages target is 60s: one 30s wait (met), one 300s wait (missed),
        // the missed one also failed
        db.insert_metric_sample(&sample(
            "ev-fast",
            "2026-01-01T00:50:00+00:00",
            "2026-01-01T00:50:30+00:00",
            true,
        ))
        .unwrap();
        db.insert_metric_sample(&sample(
            "ev-slow",
            "2026-01-01T00:40:00+00:00",
            "2026-01-01T00:45:00+00:00",
            false,
        ))
        .unwrap();

        let snapshot = sla_snapshot(&db, &config, now).expect("snapshot");
        let messages = snapshot
            .queues
            .iter()
            .find(|q| q.queue_type == QueueType::Messages)
            .expect("messages queue");

        assert_eq!(messages.throughput_last_hour, 2);
        assert_eq!(messages.error_rate, 0.5);
        assert_eq!(messages.sla_compliance, 0.5);
        assert_eq!(messages.avg_wait_secs, 165.0);
        assert_eq!(messages.p95_wait_secs, 300.0);
    }

    #[test]
    fn test_old_samples_fall_out_of_window() {
        let db = SyncDb::open_in_memory().expect("db");
        let config = Config::default();
        let now = DateTime::parse_from_rfc3339("2026-01-01T12:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);

        db.insert_metric_sample(&sample(
            "ev-ancient",
            "2026-01-01T08:00:00+00:00",
            "2026-01-01T08:00:10+00:00",
            true,
        ))
        .unwrap();

        let snapshot = sla_snapshot(&db, &config, now).expect("snapshot");
        let messages = snapshot
            .queues
            .iter()
            .find(|q| q.queue_type == QueueType::Messages)
            .expect("messages queue");
        assert_eq!(messages.throughput_last_hour, 0);
    }
}
