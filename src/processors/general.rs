//! General-domain handlers: contacts, opportunities/projects, tasks, notes,
//! messages, appointments, campaigns, users, locations, custom objects,
//! associations, and the catch-all for everything unrecognized.

use std::collections::HashMap;

use crate::db::{
    AppointmentRow, AppUserRow, AssociationRow, CampaignRow, ContactRow, CustomObjectRow,
    MessageRow, NoteRow, ProjectRow, SyncDb, TaskRow, TimelineEntry,
};
use crate::envelope::CanonicalEvent;
use crate::error::ProcessingError;
use crate::hooks::SideEffect;
use crate::types::rfc3339;

use super::{first_str, require_first_str, stamp, Handler};

/// Terminal and initial states of the opportunity state machine.
const PROJECT_STATUSES: [&str; 5] = ["open", "won", "lost", "abandoned", "deleted"];

pub(super) fn register(handlers: &mut HashMap<&'static str, Handler>) {
    handlers.insert("ContactCreate", handle_contact_upsert);
    handlers.insert("ContactUpdate", handle_contact_upsert);
    handlers.insert("ContactTagUpdate", handle_contact_upsert);
    handlers.insert("ContactDelete", handle_contact_delete);

    handlers.insert("TaskCreate", handle_task_upsert);
    handlers.insert("TaskComplete", handle_task_complete);
    handlers.insert("TaskDelete", handle_task_delete);

    handlers.insert("NoteCreate", handle_note_upsert);
    handlers.insert("NoteUpdate", handle_note_upsert);
    handlers.insert("NoteDelete", handle_note_delete);

    handlers.insert("InboundMessage", handle_message);
    handlers.insert("OutboundMessage", handle_message);

    handlers.insert("AppointmentCreate", handle_appointment_upsert);
    handlers.insert("AppointmentUpdate", handle_appointment_upsert);
    handlers.insert("AppointmentDelete", handle_appointment_delete);

    handlers.insert("CampaignStatusUpdate", handle_campaign);
    handlers.insert("UserUpdate", handle_user_update);
    handlers.insert("LocationUpdate", handle_location_update);

    handlers.insert("AssociationCreate", handle_association_upsert);
    handlers.insert("AssociationUpdate", handle_association_upsert);
    handlers.insert("AssociationDelete", handle_association_delete);

    handlers.insert("ObjectRecordCreate", handle_custom_object_upsert);
    handlers.insert("ObjectRecordUpdate", handle_custom_object_upsert);
    handlers.insert("ObjectRecordDelete", handle_custom_object_delete);
}

// =============================================================================
// Opportunities (prefix-routed)
// =============================================================================

/// Prefix route for `Opportunity*` events not caught by an exact handler.
pub(super) fn handle_opportunity(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    match event.event_type.as_str() {
        "OpportunityCreate" | "OpportunityUpdate" | "OpportunityMonetaryValueUpdate"
        | "OpportunityAssignedToUpdate" => handle_project_upsert(db, event),
        "OpportunityStatusUpdate" => handle_project_status(db, event),
        "OpportunityStageUpdate" => handle_project_stage(db, event),
        "OpportunityDelete" => handle_project_delete(db, event),
        _ => handle_unrecognized(db, event),
    }
}

fn project_id(event: &CanonicalEvent) -> Result<String, ProcessingError> {
    Ok(require_first_str(event, &["_id", "opportunityId", "id"])?.to_string())
}

fn project_row(event: &CanonicalEvent) -> Result<ProjectRow, ProcessingError> {
    let status = first_str(event, &["status"]).unwrap_or("open");
    if !PROJECT_STATUSES.contains(&status) {
        return Err(ProcessingError::Validation(format!(
            "unknown opportunity status: {}",
            status
        )));
    }

    Ok(ProjectRow {
        external_id: project_id(event)?,
        tenant_id: event.tenant_id.clone(),
        contact_id: first_str(event, &["contactId"]).map(str::to_string),
        name: first_str(event, &["name", "title"]).map(str::to_string),
        status: status.to_string(),
        pipeline_stage: first_str(event, &["pipelineStageId", "stageId"]).map(str::to_string),
        monetary_value: event.f64_field("monetaryValue").unwrap_or(0.0),
    })
}

fn handle_project_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_project(&project_row(event)?, &stamp(event, "general.opportunity"))?;
    Ok(Vec::new())
}

/// Status transition with an append-only timeline entry recording cause,
/// previous value, and new value. A same-status update appends nothing.
fn handle_project_status(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = project_id(event)?;
    let new_status = event.require_str("status")?;
    if !PROJECT_STATUSES.contains(&new_status) {
        return Err(ProcessingError::Validation(format!(
            "unknown opportunity status: {}",
            new_status
        )));
    }

    let previous = db.project_status(&id, &event.tenant_id)?;
    if previous.is_none() {
        // Out-of-order delivery: the status event beat the create. Project
        // the row first so the transition has something to land on.
        handle_project_upsert(db, event)?;
    }
    let previous = previous.unwrap_or_else(|| "open".to_string());

    if previous == new_status {
        return Ok(Vec::new());
    }

    let entry = TimelineEntry {
        project_id: id.clone(),
        tenant_id: event.tenant_id.clone(),
        event_id: event.event_id.clone(),
        entry_type: "status_change".to_string(),
        cause: Some(event.event_type.clone()),
        previous_value: Some(previous),
        new_value: Some(new_status.to_string()),
    };
    db.apply_project_transition(
        &id,
        &event.tenant_id,
        new_status,
        &entry,
        &stamp(event, "general.opportunity"),
    )?;
    Ok(Vec::new())
}

fn handle_project_stage(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let stage = event.require_str("pipelineStageId")?;
    let row = project_row(event)?;

    // Stage moves are part of the project's history too; the upsert and the
    // entry commit together
    db.upsert_project_with_timeline(
        &row,
        &TimelineEntry {
            project_id: row.external_id.clone(),
            tenant_id: event.tenant_id.clone(),
            event_id: event.event_id.clone(),
            entry_type: "stage_change".to_string(),
            cause: Some(event.event_type.clone()),
            previous_value: None,
            new_value: Some(stage.to_string()),
        },
        &stamp(event, "general.opportunity"),
    )?;
    Ok(Vec::new())
}

/// Deletion is a status transition, not a row removal: the timeline must
/// survive the aggregate it describes.
fn handle_project_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = project_id(event)?;
    let previous = db.project_status(&id, &event.tenant_id)?;

    let Some(previous) = previous else {
        // Nothing to delete; converged already
        return Ok(Vec::new());
    };
    if previous == "deleted" {
        return Ok(Vec::new());
    }

    let entry = TimelineEntry {
        project_id: id.clone(),
        tenant_id: event.tenant_id.clone(),
        event_id: event.event_id.clone(),
        entry_type: "status_change".to_string(),
        cause: Some(event.event_type.clone()),
        previous_value: Some(previous),
        new_value: Some("deleted".to_string()),
    };
    db.apply_project_transition(
        &id,
        &event.tenant_id,
        "deleted",
        &entry,
        &stamp(event, "general.opportunity"),
    )?;
    Ok(Vec::new())
}

// =============================================================================
// Contacts
// =============================================================================

fn handle_contact_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let tags = event
        .data
        .get("tags")
        .and_then(|value| value.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|tag| tag.as_str())
                .collect::<Vec<_>>()
                .join(",")
        });

    db.upsert_contact(
        &ContactRow {
            external_id: require_first_str(event, &["_id", "contactId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            first_name: first_str(event, &["firstName"]).map(str::to_string),
            last_name: first_str(event, &["lastName"]).map(str::to_string),
            email: first_str(event, &["email"]).map(str::to_string),
            phone: first_str(event, &["phone"]).map(str::to_string),
            tags,
        },
        &stamp(event, "general.contact"),
    )?;
    Ok(Vec::new())
}

fn handle_contact_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "contactId", "id"])?;
    db.mark_contact_deleted(id, &event.tenant_id, &stamp(event, "general.contact"))?;
    Ok(Vec::new())
}

// =============================================================================
// Tasks and notes
// =============================================================================

fn task_row(event: &CanonicalEvent, completed: bool) -> Result<TaskRow, ProcessingError> {
    Ok(TaskRow {
        external_id: require_first_str(event, &["_id", "taskId", "id"])?.to_string(),
        tenant_id: event.tenant_id.clone(),
        contact_id: first_str(event, &["contactId"]).map(str::to_string),
        title: first_str(event, &["title"]).map(str::to_string),
        body: first_str(event, &["body", "description"]).map(str::to_string),
        due_date: first_str(event, &["dueDate"]).map(str::to_string),
        completed,
    })
}

fn handle_task_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let completed = event.bool_field("completed").unwrap_or(false);
    db.upsert_task(&task_row(event, completed)?, &stamp(event, "general.task"))?;
    Ok(Vec::new())
}

fn handle_task_complete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_task(&task_row(event, true)?, &stamp(event, "general.task"))?;
    Ok(Vec::new())
}

fn handle_task_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "taskId", "id"])?;
    db.mark_task_deleted(id, &event.tenant_id, &stamp(event, "general.task"))?;
    Ok(Vec::new())
}

fn handle_note_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_note(
        &NoteRow {
            external_id: require_first_str(event, &["_id", "noteId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            contact_id: first_str(event, &["contactId"]).map(str::to_string),
            body: first_str(event, &["body"]).map(str::to_string),
        },
        &stamp(event, "general.note"),
    )?;
    Ok(Vec::new())
}

fn handle_note_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "noteId", "id"])?;
    db.mark_note_deleted(id, &event.tenant_id, &stamp(event, "general.note"))?;
    Ok(Vec::new())
}

// =============================================================================
// Messages and appointments
// =============================================================================

fn handle_message(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let direction = if event.event_type == "InboundMessage" {
        "inbound"
    } else {
        "outbound"
    };
    db.upsert_message(
        &MessageRow {
            external_id: require_first_str(event, &["_id", "messageId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            contact_id: first_str(event, &["contactId"]).map(str::to_string),
            conversation_id: first_str(event, &["conversationId"]).map(str::to_string),
            direction: Some(direction.to_string()),
            body: first_str(event, &["body", "message"]).map(str::to_string),
        },
        &stamp(event, "general.message"),
    )?;
    Ok(Vec::new())
}

fn handle_appointment_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_appointment(
        &AppointmentRow {
            external_id: require_first_str(event, &["_id", "appointmentId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            contact_id: first_str(event, &["contactId"]).map(str::to_string),
            calendar_id: first_str(event, &["calendarId"]).map(str::to_string),
            title: first_str(event, &["title"]).map(str::to_string),
            start_time: first_str(event, &["startTime"]).map(str::to_string),
            end_time: first_str(event, &["endTime"]).map(str::to_string),
            status: first_str(event, &["status", "appointmentStatus"]).map(str::to_string),
        },
        &stamp(event, "general.appointment"),
    )?;
    Ok(Vec::new())
}

fn handle_appointment_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "appointmentId", "id"])?;
    db.mark_appointment_deleted(id, &event.tenant_id, &stamp(event, "general.appointment"))?;
    Ok(Vec::new())
}

// =============================================================================
// Campaigns, users, locations
// =============================================================================

fn handle_campaign(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_campaign(
        &CampaignRow {
            external_id: require_first_str(event, &["_id", "campaignId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            name: first_str(event, &["name"]).map(str::to_string),
            status: first_str(event, &["status"]).map(str::to_string),
        },
        &stamp(event, "general.campaign"),
    )?;
    Ok(Vec::new())
}

fn handle_user_update(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_app_user(
        &AppUserRow {
            external_id: require_first_str(event, &["_id", "userId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            name: first_str(event, &["name", "firstName"]).map(str::to_string),
            email: first_str(event, &["email"]).map(str::to_string),
            role: first_str(event, &["role"]).map(str::to_string),
        },
        &stamp(event, "general.user"),
    )?;
    Ok(Vec::new())
}

fn handle_location_update(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.update_tenant_details(
        &event.tenant_id,
        first_str(event, &["name"]),
        first_str(event, &["address"]),
        &stamp(event, "general.location"),
    )?;
    Ok(Vec::new())
}

// =============================================================================
// Custom objects and associations
// =============================================================================

fn handle_custom_object_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let data = serde_json::to_string(&event.data)
        .map_err(|e| ProcessingError::Validation(format!("unserializable payload: {}", e)))?;
    db.upsert_custom_object(
        &CustomObjectRow {
            external_id: require_first_str(event, &["_id", "recordId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            object_type: first_str(event, &["objectKey", "objectType"]).map(str::to_string),
            data,
        },
        &stamp(event, "general.custom_object"),
    )?;
    Ok(Vec::new())
}

fn handle_custom_object_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "recordId", "id"])?;
    db.mark_custom_object_deleted(id, &event.tenant_id, &stamp(event, "general.custom_object"))?;
    Ok(Vec::new())
}

fn handle_association_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.upsert_association(
        &AssociationRow {
            external_id: require_first_str(event, &["_id", "associationId", "id"])?.to_string(),
            tenant_id: event.tenant_id.clone(),
            first_object: first_str(event, &["firstObjectKey", "firstObjectId"]).map(str::to_string),
            second_object: first_str(event, &["secondObjectKey", "secondObjectId"])
                .map(str::to_string),
            relation: first_str(event, &["key", "relation"]).map(str::to_string),
        },
        &stamp(event, "general.association"),
    )?;
    Ok(Vec::new())
}

fn handle_association_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "associationId", "id"])?;
    db.mark_association_deleted(id, &event.tenant_id, &stamp(event, "general.association"))?;
    Ok(Vec::new())
}

// =============================================================================
// Catch-all
// =============================================================================

/// Persist a genuinely unrecognized event for later inspection, then fail
/// the item as unsupported so it never retries.
pub(super) fn handle_unrecognized(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let payload = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
    db.insert_unhandled_event(
        &event.event_id,
        &event.tenant_id,
        event.queue_type,
        &event.event_type,
        &payload,
        &rfc3339(chrono::Utc::now()),
    )?;

    log::warn!(
        "General: no handler for event type {} (event {})",
        event.event_type,
        event.event_id
    );
    Err(ProcessingError::Unsupported(event.event_type.clone()))
}
