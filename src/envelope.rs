//! Canonical event shape handed to processors.
//!
//! The platform delivers two payload shapes for the same logical event: a
//! flat object, and a nested native envelope where the domain fields live
//! under `webhookPayload`. Normalization happens exactly once, here, when a
//! claimed queue row is turned into a [`CanonicalEvent`]. Processors never
//! see the raw wire shape.

use serde_json::Value;

use crate::error::ProcessingError;
use crate::types::{QueueItem, QueueType};

/// A claimed queue item with its payload parsed and normalized.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    /// Queue row id, stamped into provenance columns as `webhook_id`.
    pub webhook_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub queue_type: QueueType,
    pub attempts: u32,
    /// Normalized domain payload. Always a JSON object.
    pub data: Value,
}

impl CanonicalEvent {
    /// Parse and normalize a claimed queue row.
    ///
    /// A payload that is not valid JSON is a validation error: the bytes will
    /// never parse differently on retry.
    pub fn from_queue_item(item: &QueueItem) -> Result<Self, ProcessingError> {
        let raw: Value = serde_json::from_str(&item.payload)
            .map_err(|e| ProcessingError::Validation(format!("payload is not valid JSON: {}", e)))?;

        Ok(CanonicalEvent {
            webhook_id: item.id.clone(),
            event_id: item.event_id.clone(),
            tenant_id: item.tenant_id.clone(),
            event_type: item.event_type.clone(),
            queue_type: item.queue_type,
            attempts: item.attempts,
            data: normalize_payload(raw),
        })
    }

    /// Top-level string field, if present and non-empty.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Top-level string field, or a validation error naming the missing key.
    pub fn require_str(&self, key: &str) -> Result<&str, ProcessingError> {
        self.str_field(key)
            .ok_or_else(|| ProcessingError::Validation(format!("missing required field: {}", key)))
    }

    /// Numeric field. Tolerates numbers delivered as strings ("149.00").
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// String field at a nested path, e.g. `&["contact", "email"]`.
    pub fn nested_str(&self, path: &[&str]) -> Option<&str> {
        let mut cursor = &self.data;
        for key in path {
            cursor = cursor.get(key)?;
        }
        cursor.as_str().filter(|s| !s.is_empty())
    }
}

/// Unwrap the native nested envelope if present.
///
/// When the payload object carries a `webhookPayload` key whose value is an
/// object, that inner object is the domain payload. Anything that is not an
/// object normalizes to an empty object so field helpers stay total.
fn normalize_payload(raw: Value) -> Value {
    let unwrapped = match raw {
        Value::Object(mut map) => match map.remove("webhookPayload") {
            Some(inner @ Value::Object(_)) => inner,
            Some(_) | None => Value::Object(map),
        },
        other => other,
    };
    if unwrapped.is_object() {
        unwrapped
    } else {
        Value::Object(serde_json::Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueueStatus, QueueType};

    fn item_with_payload(payload: &str) -> QueueItem {
        QueueItem {
            id: "wh-1".into(),
            event_id: "ev-1".into(),
            tenant_id: "loc-1".into(),
            queue_type: QueueType::Financial,
            event_type: "InvoicePaid".into(),
            payload: payload.into(),
            status: QueueStatus::Processing,
            attempts: 0,
            max_attempts: 5,
            received_at: "2026-01-01T00:00:00+00:00".into(),
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            next_retry_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_flat_payload_passes_through() {
        let event =
            CanonicalEvent::from_queue_item(&item_with_payload(r#"{"_id":"inv-1","total":100}"#))
                .expect("parse");
        assert_eq!(event.str_field("_id"), Some("inv-1"));
        assert_eq!(event.f64_field("total"), Some(100.0));
    }

    #[test]
    fn test_native_envelope_is_unwrapped() {
        let event = CanonicalEvent::from_queue_item(&item_with_payload(
            r#"{"locationId":"loc-outer","webhookPayload":{"_id":"inv-2","status":"paid"}}"#,
        ))
        .expect("parse");
        assert_eq!(event.str_field("_id"), Some("inv-2"));
        assert_eq!(event.str_field("status"), Some("paid"));
        // Outer routing fields do not leak into the domain payload
        assert_eq!(event.str_field("locationId"), None);
        // Tenant identity comes from the queue row, not the payload
        assert_eq!(event.tenant_id, "loc-1");
    }

    #[test]
    fn test_numeric_strings_are_tolerated() {
        let event =
            CanonicalEvent::from_queue_item(&item_with_payload(r#"{"amount":"149.00"}"#))
                .expect("parse");
        assert_eq!(event.f64_field("amount"), Some(149.0));
    }

    #[test]
    fn test_invalid_json_is_a_validation_error() {
        let err = CanonicalEvent::from_queue_item(&item_with_payload("not json")).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_require_str_names_missing_field() {
        let event = CanonicalEvent::from_queue_item(&item_with_payload("{}")).expect("parse");
        let err = event.require_str("contactId").unwrap_err();
        assert!(err.to_string().contains("contactId"));
        assert!(!err.is_retryable());
    }
}
