//! Core types shared across the pipeline.
//!
//! Statuses and queue types are closed enums with explicit string encodings
//! at the SQL boundary — free-form status strings were the main source of
//! drift in earlier iterations of this system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse routing category for an inbound event.
///
/// Queue types isolate throughput and latency: critical lifecycle events
/// never wait behind a backlog of bulk contact updates. Each type is claimed
/// and processed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Critical,
    Financial,
    General,
    Messages,
    Appointments,
    Contacts,
    Projects,
    Install,
}

impl QueueType {
    /// All queue types, in dashboard display order.
    pub const ALL: [QueueType; 8] = [
        QueueType::Critical,
        QueueType::Install,
        QueueType::Financial,
        QueueType::Messages,
        QueueType::Appointments,
        QueueType::Contacts,
        QueueType::Projects,
        QueueType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Critical => "critical",
            QueueType::Financial => "financial",
            QueueType::General => "general",
            QueueType::Messages => "messages",
            QueueType::Appointments => "appointments",
            QueueType::Contacts => "contacts",
            QueueType::Projects => "projects",
            QueueType::Install => "install",
        }
    }

    pub fn parse(s: &str) -> Option<QueueType> {
        match s {
            "critical" => Some(QueueType::Critical),
            "financial" => Some(QueueType::Financial),
            "general" => Some(QueueType::General),
            "messages" => Some(QueueType::Messages),
            "appointments" => Some(QueueType::Appointments),
            "contacts" => Some(QueueType::Contacts),
            "projects" => Some(QueueType::Projects),
            "install" => Some(QueueType::Install),
            _ => None,
        }
    }
}

/// Queue item lifecycle state.
///
/// pending → processing → completed | failed, with failed-then-retried items
/// transitioning back to pending. The pending→processing transition is the
/// exclusive claim and happens only via a status-guarded conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<QueueStatus> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// Raw inbound event envelope as posted to the ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub event_id: String,
    #[serde(default, alias = "locationId")]
    pub tenant_id: String,
    #[serde(default, alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A row from the `webhook_queue` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub queue_type: QueueType,
    pub event_type: String,
    pub payload: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub received_at: String,
    pub processing_started_at: Option<String>,
    pub completed_at: Option<String>,
    pub failed_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
}

/// Summary returned by one queue manager run, serialized back to the
/// scheduler that triggered it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub success: bool,
    pub queue_type: QueueType,
    pub runtime_seconds: f64,
    pub items_processed: u32,
    pub items_failed: u32,
    /// True when the wall-clock budget expired with claimable items left.
    pub stopped_early: bool,
}

/// One append-only metric sample per processed item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub event_id: String,
    pub tenant_id: String,
    pub queue_type: QueueType,
    pub received_at: String,
    pub claimed_at: Option<String>,
    pub completed_at: String,
    pub success: bool,
    pub error_kind: Option<String>,
}

/// Format a timestamp the way every TEXT column in the schema stores it.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_type_round_trip() {
        for qt in QueueType::ALL {
            assert_eq!(QueueType::parse(qt.as_str()), Some(qt));
        }
        assert_eq!(QueueType::parse("bogus"), None);
    }

    #[test]
    fn test_queue_status_round_trip() {
        for s in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueStatus::parse(""), None);
    }

    #[test]
    fn test_envelope_accepts_platform_aliases() {
        // The platform's native envelope uses `type` and `locationId`.
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{"eventId":"ev-1","locationId":"loc-1","type":"ContactCreate","payload":{}}"#,
        )
        .expect("parse");
        assert_eq!(envelope.tenant_id, "loc-1");
        assert_eq!(envelope.event_type, "ContactCreate");
    }
}
