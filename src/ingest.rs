//! Ingestion: classify an inbound envelope and enqueue it durably.
//!
//! Fire-and-forget contract: callers learn only "accepted" (with a duplicate
//! flag) or "rejected". Processing outcomes are visible exclusively through
//! the metrics surface.

use crate::db::{NewQueueItem, SyncDb};
use crate::error::ProcessingError;
use crate::types::{rfc3339, QueueType, WebhookEnvelope};

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// The event id was seen before; the original queue item stands.
    Duplicate,
}

/// Static event-type → queue-type mapping.
///
/// Unknown event types classify as `General` so nothing is ever dropped at
/// the door; the general processor's catch-all decides their fate.
pub fn classify(event_type: &str) -> QueueType {
    match event_type {
        "AppInstall" => QueueType::Install,

        "AppUninstall" | "PlanChange" | "UserCreate" => QueueType::Critical,

        "InvoiceCreate" | "InvoiceUpdate" | "InvoiceDelete" | "InvoicePaid"
        | "InvoicePartiallyPaid" | "InvoiceVoid" | "OrderCreate" | "OrderStatusUpdate"
        | "ProductCreate" | "ProductUpdate" | "ProductDelete" | "PriceCreate" | "PriceUpdate"
        | "PriceDelete" => QueueType::Financial,

        "InboundMessage" | "OutboundMessage" => QueueType::Messages,

        "AppointmentCreate" | "AppointmentUpdate" | "AppointmentDelete" => {
            QueueType::Appointments
        }

        "ContactCreate" | "ContactUpdate" | "ContactDelete" | "ContactTagUpdate" => {
            QueueType::Contacts
        }

        "OpportunityCreate" | "OpportunityUpdate" | "OpportunityDelete"
        | "OpportunityStatusUpdate" | "OpportunityStageUpdate"
        | "OpportunityMonetaryValueUpdate" | "OpportunityAssignedToUpdate" => QueueType::Projects,

        _ => QueueType::General,
    }
}

/// Validate and enqueue one envelope.
///
/// The insert is conditional on the event id being unseen; a duplicate
/// delivery is acknowledged without a second queue item. Malformed envelopes
/// (missing `eventId` or `tenantId`) are rejected as validation errors.
pub fn ingest_envelope(
    db: &SyncDb,
    envelope: &WebhookEnvelope,
    max_attempts: u32,
) -> Result<(IngestOutcome, QueueType), ProcessingError> {
    if envelope.event_id.is_empty() {
        return Err(ProcessingError::Validation("missing eventId".into()));
    }
    if envelope.tenant_id.is_empty() {
        return Err(ProcessingError::Validation("missing tenantId".into()));
    }
    if envelope.event_type.is_empty() {
        return Err(ProcessingError::Validation("missing eventType".into()));
    }

    let queue_type = classify(&envelope.event_type);
    let payload = serde_json::to_string(&envelope.payload)
        .map_err(|e| ProcessingError::Validation(format!("unserializable payload: {}", e)))?;

    let item = NewQueueItem {
        id: uuid::Uuid::new_v4().to_string(),
        event_id: envelope.event_id.clone(),
        tenant_id: envelope.tenant_id.clone(),
        queue_type,
        event_type: envelope.event_type.clone(),
        payload,
        max_attempts,
        received_at: rfc3339(chrono::Utc::now()),
    };

    let inserted = db.enqueue_if_absent(&item)?;
    if inserted {
        log::debug!(
            "Ingest: queued {} ({}) for tenant {} on {}",
            envelope.event_id,
            envelope.event_type,
            envelope.tenant_id,
            queue_type.as_str()
        );
        Ok((IngestOutcome::Accepted, queue_type))
    } else {
        log::debug!("Ingest: duplicate delivery of {}", envelope.event_id);
        Ok((IngestOutcome::Duplicate, queue_type))
    }
}
