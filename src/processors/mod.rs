//! Event-type → handler registry for the processing pipeline.
//!
//! One flat map composed from three domain sub-registries (critical,
//! financial, general), built once at startup. Dispatch is an O(1) lookup,
//! with two fallbacks owned by the general domain: a prefix route for
//! `Opportunity*` events and a catch-all that persists whatever is left.
//!
//! Queue types decide batch isolation only; any queue type's items dispatch
//! through this same registry.

mod critical;
mod financial;
mod general;

use std::collections::HashMap;

use crate::db::{Stamp, SyncDb};
use crate::envelope::CanonicalEvent;
use crate::error::ProcessingError;
use crate::hooks::SideEffect;
use crate::types::rfc3339;

/// One event handler. Effects come back to the caller so they run only after
/// the item's outcome is committed.
pub type Handler = fn(&SyncDb, &CanonicalEvent) -> Result<Vec<SideEffect>, ProcessingError>;

pub struct ProcessorRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        critical::register(&mut handlers);
        financial::register(&mut handlers);
        general::register(&mut handlers);
        Self { handlers }
    }

    /// Route one normalized event to its handler.
    pub fn dispatch(
        &self,
        db: &SyncDb,
        event: &CanonicalEvent,
    ) -> Result<Vec<SideEffect>, ProcessingError> {
        if let Some(handler) = self.handlers.get(event.event_type.as_str()) {
            return handler(db, event);
        }
        if event.event_type.starts_with("Opportunity") {
            return general::handle_opportunity(db, event);
        }
        general::handle_unrecognized(db, event)
    }

    #[cfg(test)]
    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Provenance stamp for writes caused by this event.
pub(crate) fn stamp(event: &CanonicalEvent, by: &'static str) -> Stamp {
    Stamp {
        at: rfc3339(chrono::Utc::now()),
        by,
        webhook_id: event.webhook_id.clone(),
    }
}

/// First present string field among the given keys. Payload shapes differ
/// between event versions; id fields in particular move around.
pub(crate) fn first_str<'a>(event: &'a CanonicalEvent, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| event.str_field(key))
}

/// Like [`first_str`] but required.
pub(crate) fn require_first_str<'a>(
    event: &'a CanonicalEvent,
    keys: &[&str],
) -> Result<&'a str, ProcessingError> {
    first_str(event, keys).ok_or_else(|| {
        ProcessingError::Validation(format!("missing required field: one of {:?}", keys))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_classified_event_types() {
        let registry = ProcessorRegistry::new();
        for event_type in [
            "AppInstall",
            "AppUninstall",
            "PlanChange",
            "UserCreate",
            "InvoiceCreate",
            "InvoicePaid",
            "InvoicePartiallyPaid",
            "OrderCreate",
            "ProductUpdate",
            "PriceDelete",
            "ContactCreate",
            "ContactDelete",
            "TaskCreate",
            "NoteCreate",
            "InboundMessage",
            "AppointmentCreate",
            "CampaignStatusUpdate",
            "UserUpdate",
            "LocationUpdate",
            "AssociationCreate",
            "ObjectRecordCreate",
        ] {
            assert!(
                registry.has_handler(event_type),
                "no handler registered for {}",
                event_type
            );
        }
    }
}
