//! Financial handlers: invoices, orders, products, prices.
//!
//! Paid and partially-paid invoice events also propagate to the linked
//! project's financial summary and timeline, inside the same transaction as
//! the invoice upsert.

use std::collections::HashMap;

use crate::db::{InvoiceRow, OrderRow, PriceRow, ProductRow, ProjectAggregate, SyncDb, TimelineEntry};
use crate::envelope::CanonicalEvent;
use crate::error::ProcessingError;
use crate::hooks::SideEffect;
use crate::types::rfc3339;

use super::{first_str, require_first_str, stamp, Handler};

pub(super) fn register(handlers: &mut HashMap<&'static str, Handler>) {
    handlers.insert("InvoiceCreate", handle_invoice_create);
    handlers.insert("InvoiceUpdate", handle_invoice_update);
    handlers.insert("InvoiceDelete", handle_invoice_delete);
    handlers.insert("InvoicePaid", handle_invoice_paid);
    handlers.insert("InvoicePartiallyPaid", handle_invoice_partially_paid);
    handlers.insert("InvoiceVoid", handle_invoice_void);
    handlers.insert("OrderCreate", handle_order);
    handlers.insert("OrderStatusUpdate", handle_order);
    handlers.insert("ProductCreate", handle_product_upsert);
    handlers.insert("ProductUpdate", handle_product_upsert);
    handlers.insert("ProductDelete", handle_product_delete);
    handlers.insert("PriceCreate", handle_price_upsert);
    handlers.insert("PriceUpdate", handle_price_upsert);
    handlers.insert("PriceDelete", handle_price_delete);
}

fn invoice_id(event: &CanonicalEvent) -> Result<String, ProcessingError> {
    Ok(require_first_str(event, &["_id", "invoiceId", "id"])?.to_string())
}

/// Common invoice fields from either payload shape.
fn invoice_row(event: &CanonicalEvent, status: &str) -> Result<InvoiceRow, ProcessingError> {
    let total = event
        .f64_field("total")
        .or_else(|| event.f64_field("amountTotal"))
        .unwrap_or(0.0);
    let amount_paid = event
        .f64_field("amountPaid")
        .or_else(|| event.f64_field("paidAmount"))
        .unwrap_or(0.0);
    let amount_due = event
        .f64_field("amountDue")
        .or_else(|| event.f64_field("dueAmount"))
        .unwrap_or(total - amount_paid);

    Ok(InvoiceRow {
        external_id: invoice_id(event)?,
        tenant_id: event.tenant_id.clone(),
        contact_id: first_str(event, &["contactId"]).map(str::to_string),
        project_id: first_str(event, &["opportunityId", "projectId"]).map(str::to_string),
        invoice_number: first_str(event, &["invoiceNumber", "number"]).map(str::to_string),
        status: status.to_string(),
        currency: first_str(event, &["currency"]).map(str::to_string),
        amount_total: total,
        amount_due,
        amount_paid,
        issued_at: first_str(event, &["issueDate", "issuedAt"]).map(str::to_string),
        paid_at: None,
    })
}

fn timeline_entry(
    event: &CanonicalEvent,
    project_id: &str,
    entry_type: &str,
    invoice_number: Option<&str>,
    new_value: Option<String>,
) -> TimelineEntry {
    TimelineEntry {
        project_id: project_id.to_string(),
        tenant_id: event.tenant_id.clone(),
        event_id: event.event_id.clone(),
        entry_type: entry_type.to_string(),
        cause: invoice_number.map(str::to_string),
        previous_value: None,
        new_value,
    }
}

fn handle_invoice_create(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = invoice_row(event, first_str(event, &["status"]).unwrap_or("draft"))?;

    let timeline = row.project_id.as_deref().map(|project_id| {
        (
            timeline_entry(
                event,
                project_id,
                "invoice_issued",
                row.invoice_number.as_deref().or(Some(row.external_id.as_str())),
                Some(format!("{}", row.amount_total)),
            ),
            ProjectAggregate::Invoiced(row.amount_total),
        )
    });

    match timeline {
        Some((entry, aggregate)) => {
            db.apply_invoice_event(&row, Some((&entry, aggregate)), &stamp(event, "financial.invoice"))?;
        }
        None => db.upsert_invoice(&row, &stamp(event, "financial.invoice"))?,
    }
    Ok(Vec::new())
}

fn handle_invoice_update(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = invoice_row(event, first_str(event, &["status"]).unwrap_or("sent"))?;
    db.upsert_invoice(&row, &stamp(event, "financial.invoice"))?;
    Ok(Vec::new())
}

/// Full payment: invoice becomes `paid` with nothing due, and the linked
/// project gains an `invoice_paid` timeline entry plus the `amount_paid`
/// bump. Replaying the same event id changes nothing.
fn handle_invoice_paid(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let mut row = invoice_row(event, "paid")?;
    if row.amount_paid == 0.0 {
        row.amount_paid = row.amount_total;
    }
    row.amount_due = 0.0;
    row.paid_at = Some(rfc3339(chrono::Utc::now()));

    let timeline = row.project_id.as_deref().map(|project_id| {
        (
            timeline_entry(
                event,
                project_id,
                "invoice_paid",
                row.invoice_number.as_deref().or(Some(row.external_id.as_str())),
                Some(format!("{}", row.amount_paid)),
            ),
            ProjectAggregate::Paid(row.amount_paid),
        )
    });

    match timeline {
        Some((entry, aggregate)) => {
            db.apply_invoice_event(&row, Some((&entry, aggregate)), &stamp(event, "financial.invoice_paid"))?;
        }
        None => db.upsert_invoice(&row, &stamp(event, "financial.invoice_paid"))?,
    }
    Ok(Vec::new())
}

fn handle_invoice_partially_paid(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = invoice_row(event, "partially_paid")?;
    // Amount of this payment, distinct from the cumulative amount_paid
    let payment = event
        .f64_field("paymentAmount")
        .or_else(|| event.f64_field("amount"))
        .unwrap_or(row.amount_paid);

    let timeline = row.project_id.as_deref().map(|project_id| {
        (
            timeline_entry(
                event,
                project_id,
                "invoice_partial_payment",
                row.invoice_number.as_deref().or(Some(row.external_id.as_str())),
                Some(format!("{}", payment)),
            ),
            ProjectAggregate::Paid(payment),
        )
    });

    match timeline {
        Some((entry, aggregate)) => {
            db.apply_invoice_event(&row, Some((&entry, aggregate)), &stamp(event, "financial.invoice_paid"))?;
        }
        None => db.upsert_invoice(&row, &stamp(event, "financial.invoice_paid"))?,
    }
    Ok(Vec::new())
}

fn handle_invoice_void(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let mut row = invoice_row(event, "void")?;
    row.amount_due = 0.0;
    db.upsert_invoice(&row, &stamp(event, "financial.invoice"))?;
    Ok(Vec::new())
}

fn handle_invoice_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = invoice_id(event)?;
    db.mark_invoice_deleted(&id, &event.tenant_id, &stamp(event, "financial.invoice"))?;
    Ok(Vec::new())
}

fn handle_order(db: &SyncDb, event: &CanonicalEvent) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = OrderRow {
        external_id: require_first_str(event, &["_id", "orderId", "id"])?.to_string(),
        tenant_id: event.tenant_id.clone(),
        contact_id: first_str(event, &["contactId"]).map(str::to_string),
        status: first_str(event, &["status"]).map(str::to_string),
        amount: event.f64_field("amount").or_else(|| event.f64_field("total")).unwrap_or(0.0),
        currency: first_str(event, &["currency"]).map(str::to_string),
    };
    db.upsert_order(&row, &stamp(event, "financial.order"))?;
    Ok(Vec::new())
}

fn handle_product_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = ProductRow {
        external_id: require_first_str(event, &["_id", "productId", "id"])?.to_string(),
        tenant_id: event.tenant_id.clone(),
        name: first_str(event, &["name"]).map(str::to_string),
        description: first_str(event, &["description"]).map(str::to_string),
    };
    db.upsert_product(&row, &stamp(event, "financial.product"))?;
    Ok(Vec::new())
}

fn handle_product_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "productId", "id"])?;
    db.mark_product_deleted(id, &event.tenant_id, &stamp(event, "financial.product"))?;
    Ok(Vec::new())
}

fn handle_price_upsert(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let row = PriceRow {
        external_id: require_first_str(event, &["_id", "priceId", "id"])?.to_string(),
        tenant_id: event.tenant_id.clone(),
        product_id: first_str(event, &["productId"]).map(str::to_string),
        amount: event.f64_field("amount").unwrap_or(0.0),
        currency: first_str(event, &["currency"]).map(str::to_string),
    };
    db.upsert_price(&row, &stamp(event, "financial.price"))?;
    Ok(Vec::new())
}

fn handle_price_delete(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let id = require_first_str(event, &["_id", "priceId", "id"])?;
    db.mark_price_deleted(id, &event.tenant_id, &stamp(event, "financial.price"))?;
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProjectRow;
    use crate::types::{QueueItem, QueueStatus, QueueType};

    fn event(event_id: &str, event_type: &str, payload: serde_json::Value) -> CanonicalEvent {
        CanonicalEvent::from_queue_item(&QueueItem {
            id: format!("wh-{}", event_id),
            event_id: event_id.into(),
            tenant_id: "loc-1".into(),
            queue_type: QueueType::Financial,
            event_type: event_type.into(),
            payload: payload.to_string(),
            status: QueueStatus::Processing,
            attempts: 0,
            max_attempts: 5,
            received_at: "2026-01-01T00:00:00+00:00".into(),
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            next_retry_at: None,
            last_error: None,
        })
        .expect("canonical event")
    }

    fn db_with_project() -> SyncDb {
        let db = SyncDb::open_in_memory().expect("db");
        db.upsert_project(
            &ProjectRow {
                external_id: "proj-1".into(),
                tenant_id: "loc-1".into(),
                status: "open".into(),
                monetary_value: 500.0,
                ..Default::default()
            },
            &crate::db::Stamp {
                at: "2026-01-01T00:00:00+00:00".into(),
                by: "test",
                webhook_id: "seed".into(),
            },
        )
        .unwrap();
        db
    }

    #[test]
    fn test_invoice_lifecycle_with_replay() {
        let db = db_with_project();

        // Create INV-1 for 500 against proj-1
        handle_invoice_create(
            &db,
            &event(
                "ev-create",
                "InvoiceCreate",
                serde_json::json!({
                    "_id": "INV-1", "opportunityId": "proj-1",
                    "invoiceNumber": "1001", "total": 500
                }),
            ),
        )
        .unwrap();

        let due: f64 = db
            .conn_ref()
            .query_row("SELECT amount_due FROM invoices WHERE external_id = 'INV-1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(due, 500.0);

        // Pay it
        let paid_event = event(
            "ev-paid",
            "InvoicePaid",
            serde_json::json!({"_id": "INV-1", "opportunityId": "proj-1", "total": 500}),
        );
        handle_invoice_paid(&db, &paid_event).unwrap();

        let (status, due, paid): (String, f64, f64) = db
            .conn_ref()
            .query_row(
                "SELECT status, amount_due, amount_paid FROM invoices WHERE external_id = 'INV-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "paid");
        assert_eq!(due, 0.0);
        assert_eq!(paid, 500.0);

        let timeline = db.project_timeline("proj-1", "loc-1").unwrap();
        assert_eq!(timeline.len(), 2, "invoice_issued + invoice_paid");

        // Replay the identical paid event: no duplicate entry, no double bump
        handle_invoice_paid(&db, &paid_event).unwrap();
        assert_eq!(db.project_timeline("proj-1", "loc-1").unwrap().len(), 2);

        let project_paid: f64 = db
            .conn_ref()
            .query_row("SELECT amount_paid FROM projects WHERE external_id = 'proj-1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(project_paid, 500.0);
    }

    #[test]
    fn test_partial_payment_bumps_by_payment_amount() {
        let db = db_with_project();

        handle_invoice_partially_paid(
            &db,
            &event(
                "ev-partial",
                "InvoicePartiallyPaid",
                serde_json::json!({
                    "_id": "INV-2", "opportunityId": "proj-1",
                    "total": 500, "amountPaid": 200, "paymentAmount": 200
                }),
            ),
        )
        .unwrap();

        let project_paid: f64 = db
            .conn_ref()
            .query_row("SELECT amount_paid FROM projects WHERE external_id = 'proj-1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(project_paid, 200.0);
    }

    #[test]
    fn test_out_of_order_payment_reaches_later_project() {
        // Payment arrives before the project's own create event
        let db = SyncDb::open_in_memory().expect("db");

        let paid_event = event(
            "ev-early-paid",
            "InvoicePaid",
            serde_json::json!({"_id": "INV-9", "opportunityId": "proj-9", "total": 500}),
        );
        handle_invoice_paid(&db, &paid_event).unwrap();

        let project_paid: f64 = db
            .conn_ref()
            .query_row("SELECT amount_paid FROM projects WHERE external_id = 'proj-9'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(project_paid, 500.0, "payment must land even without a project row");
        assert_eq!(db.project_timeline("proj-9", "loc-1").unwrap().len(), 1);

        // The create catches up later and must not clobber the aggregate
        db.upsert_project(
            &ProjectRow {
                external_id: "proj-9".into(),
                tenant_id: "loc-1".into(),
                name: Some("Late project".into()),
                status: "won".into(),
                monetary_value: 500.0,
                ..Default::default()
            },
            &crate::db::Stamp {
                at: "2026-01-01T00:05:00+00:00".into(),
                by: "test",
                webhook_id: "wh-late".into(),
            },
        )
        .unwrap();

        let (name, paid): (Option<String>, f64) = db
            .conn_ref()
            .query_row(
                "SELECT name, amount_paid FROM projects WHERE external_id = 'proj-9'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(name.as_deref(), Some("Late project"));
        assert_eq!(paid, 500.0);

        // Replay of the payment stays a no-op
        handle_invoice_paid(&db, &paid_event).unwrap();
        let paid_after: f64 = db
            .conn_ref()
            .query_row("SELECT amount_paid FROM projects WHERE external_id = 'proj-9'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(paid_after, 500.0);
        assert_eq!(db.project_timeline("proj-9", "loc-1").unwrap().len(), 1);
    }

    #[test]
    fn test_invoice_without_project_skips_timeline() {
        let db = db_with_project();

        handle_invoice_paid(
            &db,
            &event("ev-solo", "InvoicePaid", serde_json::json!({"_id": "INV-3", "total": 50})),
        )
        .unwrap();

        assert!(db.project_timeline("proj-1", "loc-1").unwrap().is_empty());
        assert_eq!(db.invoice_status("INV-3", "loc-1").unwrap().as_deref(), Some("paid"));
    }

    #[test]
    fn test_invoice_missing_id_is_validation() {
        let db = db_with_project();
        let err = handle_invoice_create(
            &db,
            &event("ev-bad", "InvoiceCreate", serde_json::json!({"total": 10})),
        )
        .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_nested_native_payload_shape() {
        let db = db_with_project();

        // Native envelope: domain fields under webhookPayload
        handle_invoice_create(
            &db,
            &event(
                "ev-nested",
                "InvoiceCreate",
                serde_json::json!({
                    "locationId": "loc-1",
                    "webhookPayload": {"_id": "INV-4", "total": 75}
                }),
            ),
        )
        .unwrap();

        assert_eq!(db.invoice_status("INV-4", "loc-1").unwrap().as_deref(), Some("draft"));
    }
}
