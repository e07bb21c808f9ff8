//! SQLite-backed durable state: the webhook queue, projected entity tables,
//! and metric samples.
//!
//! The database lives at `~/.hooksync/hooksync.db`. Every write that matters
//! for replay safety is idempotent at this layer: queue inserts dedup on
//! `event_id`, entity upserts converge on `(external_id, tenant_id)`, and
//! timeline appends dedup on `event_id` so aggregate bumps can never double
//! apply.
//!
//! `SyncDb` is intentionally NOT `Clone` or `Sync`. Each operation that needs
//! a connection opens its own; concurrent access is serialized by SQLite's
//! WAL locking rather than an in-process lock.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::migrations;
use crate::types::{MetricSample, QueueItem, QueueStatus, QueueType};

/// A new queue row, as produced by ingestion.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub queue_type: QueueType,
    pub event_type: String,
    pub payload: String,
    pub max_attempts: u32,
    pub received_at: String,
}

/// Per-status row counts for one queue type.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Slice of a metric sample needed for latency rollups.
#[derive(Debug, Clone)]
pub struct SampleRow {
    pub received_at: String,
    pub completed_at: String,
    pub success: bool,
}

/// Provenance stamp written alongside every entity projection.
#[derive(Debug, Clone)]
pub struct Stamp {
    /// RFC 3339 write time, stored as `last_webhook_update`.
    pub at: String,
    /// Processor name, e.g. `"financial.invoice_paid"`.
    pub by: &'static str,
    /// Queue row id of the webhook that caused the write.
    pub webhook_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContactRow {
    pub external_id: String,
    pub tenant_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub project_id: Option<String>,
    pub invoice_number: Option<String>,
    pub status: String,
    pub currency: Option<String>,
    pub amount_total: f64,
    pub amount_due: f64,
    pub amount_paid: f64,
    pub issued_at: Option<String>,
    pub paid_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub status: Option<String>,
    pub amount: f64,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductRow {
    pub external_id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PriceRow {
    pub external_id: String,
    pub tenant_id: String,
    pub product_id: Option<String>,
    pub amount: f64,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub name: Option<String>,
    pub status: String,
    pub pipeline_stage: Option<String>,
    pub monetary_value: f64,
}

/// Project aggregate effect implied by an invoice event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectAggregate {
    None,
    /// Bump `amount_invoiced` by the given amount.
    Invoiced(f64),
    /// Bump `amount_paid` by the given amount.
    Paid(f64),
}

/// One append-only timeline entry. `event_id` is the replay guard.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub project_id: String,
    pub tenant_id: String,
    pub event_id: String,
    pub entry_type: String,
    pub cause: Option<String>,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub due_date: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NoteRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
    pub direction: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppointmentRow {
    pub external_id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub calendar_id: Option<String>,
    pub title: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CampaignRow {
    pub external_id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomObjectRow {
    pub external_id: String,
    pub tenant_id: String,
    pub object_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssociationRow {
    pub external_id: String,
    pub tenant_id: String,
    pub first_object: Option<String>,
    pub second_object: Option<String>,
    pub relation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppUserRow {
    pub external_id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TenantInstall {
    pub tenant_id: String,
    pub company_id: Option<String>,
    pub install_kind: String,
    pub plan: Option<String>,
}

/// SQLite connection wrapper for the queue and projected entities.
pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Open (or create) the database at the given path and run migrations.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent readers; busy_timeout covers claim contention
        // between the ingest path and a running batch.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        migrations::run_migrations(&conn).map_err(StoreError::Migration)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database with migrations applied. Test-only shape,
    /// but kept in the public API so integration tests can use it.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn).map_err(StoreError::Migration)?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.hooksync/hooksync.db`.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".hooksync").join("hooksync.db"))
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Insert a queue row unless its `event_id` was already seen.
    ///
    /// Returns true if the row was inserted, false if it was a duplicate
    /// delivery. Duplicates are silently dropped, never re-enqueued.
    pub fn enqueue_if_absent(&self, item: &NewQueueItem) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "INSERT INTO webhook_queue (
                id, event_id, tenant_id, queue_type, event_type, payload,
                status, attempts, max_attempts, received_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                item.id,
                item.event_id,
                item.tenant_id,
                item.queue_type.as_str(),
                item.event_type,
                item.payload,
                item.max_attempts,
                item.received_at,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Claim up to `limit` pending items of one queue type for exclusive
    /// processing.
    ///
    /// Candidates are scanned oldest-first, then claimed one by one with a
    /// status-guarded conditional update. A row whose status changed between
    /// scan and claim loses the guard (changes() == 0) and is skipped, so two
    /// concurrent runs can never both claim the same item.
    pub fn claim_batch(
        &self,
        queue_type: QueueType,
        limit: u32,
        now: &str,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let candidate_ids: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM webhook_queue
                 WHERE queue_type = ?1
                   AND status = 'pending'
                   AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                 ORDER BY received_at
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![queue_type.as_str(), now, limit], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let changed = self.conn.execute(
                "UPDATE webhook_queue
                 SET status = 'processing', processing_started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now],
            )?;
            if changed == 1 {
                if let Some(item) = self.get_item(&id)? {
                    claimed.push(item);
                }
            }
        }
        Ok(claimed)
    }

    /// Fetch a queue row by id.
    pub fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, tenant_id, queue_type, event_type, payload,
                    status, attempts, max_attempts, received_at,
                    processing_started_at, completed_at, failed_at,
                    next_retry_at, last_error
             FROM webhook_queue WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, u32>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, Option<String>>(14)?,
            ))
        })?;

        let Some(raw) = rows.next() else {
            return Ok(None);
        };
        let raw = raw?;

        let queue_type = QueueType::parse(&raw.3)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown queue type: {}", raw.3)))?;
        let status = QueueStatus::parse(&raw.6)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown queue status: {}", raw.6)))?;

        Ok(Some(QueueItem {
            id: raw.0,
            event_id: raw.1,
            tenant_id: raw.2,
            queue_type,
            event_type: raw.4,
            payload: raw.5,
            status,
            attempts: raw.7,
            max_attempts: raw.8,
            received_at: raw.9,
            processing_started_at: raw.10,
            completed_at: raw.11,
            failed_at: raw.12,
            next_retry_at: raw.13,
            last_error: raw.14,
        }))
    }

    /// Mark a processed item completed.
    pub fn mark_completed(&self, id: &str, now: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE webhook_queue
             SET status = 'completed', completed_at = ?2, last_error = NULL
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Record a retryable failure: bump attempts, return to pending with a
    /// backoff deadline.
    pub fn requeue_for_retry(
        &self,
        id: &str,
        next_retry_at: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE webhook_queue
             SET status = 'pending',
                 attempts = attempts + 1,
                 next_retry_at = ?2,
                 last_error = ?3,
                 processing_started_at = NULL
             WHERE id = ?1",
            params![id, next_retry_at, error],
        )?;
        Ok(())
    }

    /// Record a terminal failure: bump attempts, mark failed.
    pub fn mark_failed(&self, id: &str, now: &str, error: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE webhook_queue
             SET status = 'failed',
                 attempts = attempts + 1,
                 failed_at = ?2,
                 last_error = ?3
             WHERE id = ?1",
            params![id, now, error],
        )?;
        Ok(())
    }

    /// Operator reset: return failed items to pending with a fresh attempt
    /// budget. Returns the number of items requeued.
    pub fn requeue_failed(&self, queue_type: Option<QueueType>) -> Result<usize, StoreError> {
        let changed = match queue_type {
            Some(qt) => self.conn.execute(
                "UPDATE webhook_queue
                 SET status = 'pending', attempts = 0, next_retry_at = NULL,
                     failed_at = NULL, processing_started_at = NULL
                 WHERE status = 'failed' AND queue_type = ?1",
                params![qt.as_str()],
            )?,
            None => self.conn.execute(
                "UPDATE webhook_queue
                 SET status = 'pending', attempts = 0, next_retry_at = NULL,
                     failed_at = NULL, processing_started_at = NULL
                 WHERE status = 'failed'",
                [],
            )?,
        };
        Ok(changed)
    }

    /// Per-status counts for one queue type.
    pub fn queue_counts(&self, queue_type: QueueType) -> Result<QueueCounts, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM webhook_queue
             WHERE queue_type = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![queue_type.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Claimable depth for one queue type: pending items whose retry deadline
    /// has passed (or was never set).
    pub fn claimable_depth(&self, queue_type: QueueType, now: &str) -> Result<u32, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM webhook_queue
             WHERE queue_type = ?1 AND status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= ?2)",
            params![queue_type.as_str(), now],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// `received_at` of the oldest pending item, if any.
    pub fn oldest_pending_received_at(
        &self,
        queue_type: QueueType,
    ) -> Result<Option<String>, StoreError> {
        let result = self.conn.query_row(
            "SELECT MIN(received_at) FROM webhook_queue
             WHERE queue_type = ?1 AND status = 'pending'",
            params![queue_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(result)
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Append one metric sample. Samples are never updated or deleted.
    pub fn insert_metric_sample(&self, sample: &MetricSample) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO metric_samples (
                id, event_id, tenant_id, queue_type, received_at, claimed_at,
                completed_at, success, error_kind
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                sample.event_id,
                sample.tenant_id,
                sample.queue_type.as_str(),
                sample.received_at,
                sample.claimed_at,
                sample.completed_at,
                sample.success as i32,
                sample.error_kind,
            ],
        )?;
        Ok(())
    }

    /// Samples for one queue type completed at or after `since`.
    pub fn samples_since(
        &self,
        queue_type: QueueType,
        since: &str,
    ) -> Result<Vec<SampleRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT received_at, completed_at, success FROM metric_samples
             WHERE queue_type = ?1 AND completed_at >= ?2
             ORDER BY completed_at",
        )?;
        let rows = stmt.query_map(params![queue_type.as_str(), since], |row| {
            Ok(SampleRow {
                received_at: row.get(0)?,
                completed_at: row.get(1)?,
                success: row.get::<_, i32>(2)? != 0,
            })
        })?;

        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    /// Persist an event nobody has a handler for. Deduped on `event_id` so a
    /// retried or replayed delivery records it once.
    pub fn insert_unhandled_event(
        &self,
        event_id: &str,
        tenant_id: &str,
        queue_type: QueueType,
        event_type: &str,
        payload: &str,
        received_at: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO unhandled_events (
                id, event_id, tenant_id, queue_type, event_type, payload, received_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                uuid::Uuid::new_v4().to_string(),
                event_id,
                tenant_id,
                queue_type.as_str(),
                event_type,
                payload,
                received_at,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Entity projections
    // =========================================================================

    /// Insert or update a contact. Creation fields stick on first write,
    /// mutable fields always take the latest webhook's values.
    pub fn upsert_contact(&self, row: &ContactRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO contacts (
                external_id, tenant_id, first_name, last_name, email, phone,
                tags, created_at, deleted, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?8, ?9, ?10)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                phone = excluded.phone,
                tags = excluded.tags,
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.first_name,
                row.last_name,
                row.email,
                row.phone,
                row.tags,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a contact. Missing rows are a no-op: a delete webhook for
    /// an entity we never saw converges to the same end state.
    pub fn mark_contact_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE contacts SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_invoice(&self, row: &InvoiceRow, stamp: &Stamp) -> Result<(), StoreError> {
        upsert_invoice_stmt(&self.conn, row, stamp)?;
        Ok(())
    }

    /// Apply one invoice event atomically: the invoice upsert, an optional
    /// timeline entry on the linked project, and the project aggregate bump
    /// the entry implies.
    ///
    /// All three writes share one transaction, so an observer can never see
    /// the invoice paid without the project timeline reflecting it. The
    /// timeline's `event_id` guard also gates the aggregate bump: a replayed
    /// event upserts the (identical) invoice and touches nothing else.
    ///
    /// Returns true if the timeline entry was appended (always true when no
    /// entry was requested).
    pub fn apply_invoice_event(
        &self,
        row: &InvoiceRow,
        timeline: Option<(&TimelineEntry, ProjectAggregate)>,
        stamp: &Stamp,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        upsert_invoice_stmt(&tx, row, stamp)?;

        let mut appended = true;
        if let Some((entry, aggregate)) = timeline {
            appended = append_timeline_stmt(&tx, entry, stamp)? == 1;
            if appended {
                let (column, amount) = match aggregate {
                    ProjectAggregate::None => (None, 0.0),
                    ProjectAggregate::Invoiced(amount) => (Some("amount_invoiced"), amount),
                    ProjectAggregate::Paid(amount) => (Some("amount_paid"), amount),
                };
                if let Some(column) = column {
                    // Out-of-order delivery: the payment can beat the
                    // project's own create event. Project a placeholder row
                    // so the bump always lands; the create catches up later
                    // through the normal upsert without touching aggregates.
                    tx.execute(
                        "INSERT OR IGNORE INTO projects (
                            external_id, tenant_id, status, created_at,
                            last_webhook_update, processed_by, webhook_id
                         ) VALUES (?1, ?2, 'open', ?3, ?3, ?4, ?5)",
                        params![
                            entry.project_id,
                            entry.tenant_id,
                            stamp.at,
                            stamp.by,
                            stamp.webhook_id
                        ],
                    )?;
                    // Column name comes from the closed enum above, never input.
                    let sql = format!(
                        "UPDATE projects
                         SET {column} = {column} + ?3, last_webhook_update = ?4,
                             processed_by = ?5, webhook_id = ?6
                         WHERE external_id = ?1 AND tenant_id = ?2"
                    );
                    tx.execute(
                        &sql,
                        params![
                            entry.project_id,
                            entry.tenant_id,
                            amount,
                            stamp.at,
                            stamp.by,
                            stamp.webhook_id
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(appended)
    }

    pub fn mark_invoice_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE invoices SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    /// Invoice status, if the invoice exists.
    pub fn invoice_status(
        &self,
        external_id: &str,
        tenant_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM invoices WHERE external_id = ?1 AND tenant_id = ?2")?;
        let mut rows = stmt.query_map(params![external_id, tenant_id], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn upsert_order(&self, row: &OrderRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO orders (
                external_id, tenant_id, contact_id, status, amount, currency,
                created_at, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, contact_id),
                status = COALESCE(excluded.status, status),
                amount = excluded.amount,
                currency = COALESCE(excluded.currency, currency),
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.contact_id,
                row.status,
                row.amount,
                row.currency,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_product(&self, row: &ProductRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO products (
                external_id, tenant_id, name, description, created_at, deleted,
                last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, ?6, ?7)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                description = COALESCE(excluded.description, description),
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.name,
                row.description,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_product_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE products SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_price(&self, row: &PriceRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO prices (
                external_id, tenant_id, product_id, amount, currency, created_at,
                deleted, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?6, ?7, ?8)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                product_id = COALESCE(excluded.product_id, product_id),
                amount = excluded.amount,
                currency = COALESCE(excluded.currency, currency),
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.product_id,
                row.amount,
                row.currency,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_price_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE prices SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_project(&self, row: &ProjectRow, stamp: &Stamp) -> Result<(), StoreError> {
        upsert_project_stmt(&self.conn, row, stamp)?;
        Ok(())
    }

    /// Upsert a project and append a timeline entry in one transaction, so a
    /// recorded change can never exist without its history entry. Returns
    /// true if the entry was appended (false on a replayed `event_id`).
    pub fn upsert_project_with_timeline(
        &self,
        row: &ProjectRow,
        entry: &TimelineEntry,
        stamp: &Stamp,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        upsert_project_stmt(&tx, row, stamp)?;
        let appended = append_timeline_stmt(&tx, entry, stamp)?;
        tx.commit()?;
        Ok(appended == 1)
    }

    /// Current project status, if the project exists.
    pub fn project_status(
        &self,
        external_id: &str,
        tenant_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM projects WHERE external_id = ?1 AND tenant_id = ?2")?;
        let mut rows = stmt.query_map(params![external_id, tenant_id], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Set a project's status and append the transition to its timeline, in
    /// one transaction. The timeline's `event_id` guard makes a replayed
    /// transition a no-op for both writes.
    ///
    /// Returns true if the transition was applied.
    pub fn apply_project_transition(
        &self,
        external_id: &str,
        tenant_id: &str,
        new_status: &str,
        entry: &TimelineEntry,
        stamp: &Stamp,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let appended = append_timeline_stmt(&tx, entry, stamp)?;

        if appended == 1 {
            tx.execute(
                "UPDATE projects SET status = ?3, last_webhook_update = ?4,
                    processed_by = ?5, webhook_id = ?6
                 WHERE external_id = ?1 AND tenant_id = ?2",
                params![external_id, tenant_id, new_status, stamp.at, stamp.by, stamp.webhook_id],
            )?;
        }

        tx.commit()?;
        Ok(appended == 1)
    }

    /// Timeline entries for a project, oldest first.
    pub fn project_timeline(
        &self,
        project_id: &str,
        tenant_id: &str,
    ) -> Result<Vec<(String, Option<String>, Option<String>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_type, previous_value, new_value FROM project_timeline
             WHERE project_id = ?1 AND tenant_id = ?2
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![project_id, tenant_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn upsert_task(&self, row: &TaskRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO tasks (
                external_id, tenant_id, contact_id, title, body, due_date,
                completed, created_at, deleted, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?8, ?9, ?10)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, contact_id),
                title = COALESCE(excluded.title, title),
                body = COALESCE(excluded.body, body),
                due_date = COALESCE(excluded.due_date, due_date),
                completed = excluded.completed,
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.contact_id,
                row.title,
                row.body,
                row.due_date,
                row.completed as i32,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_task_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tasks SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_note(&self, row: &NoteRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO notes (
                external_id, tenant_id, contact_id, body, created_at, deleted,
                last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, ?6, ?7)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, contact_id),
                body = COALESCE(excluded.body, body),
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.contact_id,
                row.body,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_note_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE notes SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_message(&self, row: &MessageRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO messages (
                external_id, tenant_id, contact_id, conversation_id, direction,
                body, created_at, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, contact_id),
                conversation_id = COALESCE(excluded.conversation_id, conversation_id),
                direction = COALESCE(excluded.direction, direction),
                body = COALESCE(excluded.body, body),
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.contact_id,
                row.conversation_id,
                row.direction,
                row.body,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_appointment(&self, row: &AppointmentRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO appointments (
                external_id, tenant_id, contact_id, calendar_id, title,
                start_time, end_time, status, created_at, deleted,
                last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?9, ?10, ?11)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, contact_id),
                calendar_id = COALESCE(excluded.calendar_id, calendar_id),
                title = COALESCE(excluded.title, title),
                start_time = COALESCE(excluded.start_time, start_time),
                end_time = COALESCE(excluded.end_time, end_time),
                status = COALESCE(excluded.status, status),
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.contact_id,
                row.calendar_id,
                row.title,
                row.start_time,
                row.end_time,
                row.status,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_appointment_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE appointments SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_campaign(&self, row: &CampaignRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO campaigns (
                external_id, tenant_id, name, status, created_at,
                last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                status = COALESCE(excluded.status, status),
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.name,
                row.status,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_custom_object(
        &self,
        row: &CustomObjectRow,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO custom_objects (
                external_id, tenant_id, object_type, data, created_at, deleted,
                last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, ?6, ?7)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                object_type = COALESCE(excluded.object_type, object_type),
                data = excluded.data,
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.object_type,
                row.data,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_custom_object_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE custom_objects SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    pub fn upsert_association(
        &self,
        row: &AssociationRow,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO associations (
                external_id, tenant_id, first_object, second_object, relation,
                created_at, deleted, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?6, ?7, ?8)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                first_object = COALESCE(excluded.first_object, first_object),
                second_object = COALESCE(excluded.second_object, second_object),
                relation = COALESCE(excluded.relation, relation),
                deleted = 0,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.first_object,
                row.second_object,
                row.relation,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_association_deleted(
        &self,
        external_id: &str,
        tenant_id: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE associations SET deleted = 1, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE external_id = ?1 AND tenant_id = ?2",
            params![external_id, tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Users and tenants
    // =========================================================================

    pub fn upsert_app_user(&self, row: &AppUserRow, stamp: &Stamp) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO app_users (
                external_id, tenant_id, name, email, role, requires_reauth,
                created_at, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?7, ?8)
             ON CONFLICT(external_id, tenant_id) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                email = COALESCE(excluded.email, email),
                role = COALESCE(excluded.role, role),
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                row.external_id,
                row.tenant_id,
                row.name,
                row.email,
                row.role,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;
        Ok(())
    }

    /// Issue a one-time setup token for a newly provisioned user.
    pub fn insert_user_setup_token(
        &self,
        token: &str,
        user_id: &str,
        tenant_id: &str,
        expires_at: &str,
        now: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO user_setup_tokens (token, user_id, tenant_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, user_id, tenant_id, expires_at, now],
        )?;
        Ok(())
    }

    /// Record (or revive) an installed tenant.
    pub fn upsert_tenant_install(
        &self,
        install: &TenantInstall,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO tenants (
                tenant_id, company_id, install_kind, plan, status, installed_at,
                uninstalled_at, last_webhook_update, processed_by, webhook_id
             ) VALUES (?1, ?2, ?3, ?4, 'installed', ?5, NULL, ?5, ?6, ?7)
             ON CONFLICT(tenant_id) DO UPDATE SET
                company_id = COALESCE(excluded.company_id, company_id),
                install_kind = excluded.install_kind,
                plan = COALESCE(excluded.plan, plan),
                status = 'installed',
                uninstalled_at = NULL,
                last_webhook_update = excluded.last_webhook_update,
                processed_by = excluded.processed_by,
                webhook_id = excluded.webhook_id",
            params![
                install.tenant_id,
                install.company_id,
                install.install_kind,
                install.plan,
                stamp.at,
                stamp.by,
                stamp.webhook_id,
            ],
        )?;

        // Placeholder credential row; the OAuth worker fills in tokens.
        tx.execute(
            "INSERT OR IGNORE INTO oauth_credentials (tenant_id, updated_at) VALUES (?1, ?2)",
            params![install.tenant_id, stamp.at],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Uninstall cascade, in one transaction: mark the tenant uninstalled,
    /// revoke its credentials, and flag its users for re-auth. Projected
    /// entity data is retained.
    pub fn mark_tenant_uninstalled(&self, tenant_id: &str, stamp: &Stamp) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "UPDATE tenants SET status = 'uninstalled', uninstalled_at = ?2,
                last_webhook_update = ?2, processed_by = ?3, webhook_id = ?4
             WHERE tenant_id = ?1",
            params![tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;

        tx.execute(
            "DELETE FROM oauth_credentials WHERE tenant_id = ?1",
            params![tenant_id],
        )?;

        tx.execute(
            "DELETE FROM user_setup_tokens WHERE tenant_id = ?1",
            params![tenant_id],
        )?;

        tx.execute(
            "UPDATE app_users SET requires_reauth = 1, last_webhook_update = ?2,
                processed_by = ?3, webhook_id = ?4
             WHERE tenant_id = ?1",
            params![tenant_id, stamp.at, stamp.by, stamp.webhook_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Record a plan change for a tenant.
    pub fn update_tenant_plan(
        &self,
        tenant_id: &str,
        plan: &str,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tenants SET plan = ?2, last_webhook_update = ?3,
                processed_by = ?4, webhook_id = ?5
             WHERE tenant_id = ?1",
            params![tenant_id, plan, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    /// Update tenant display fields from a location-detail event.
    pub fn update_tenant_details(
        &self,
        tenant_id: &str,
        name: Option<&str>,
        address: Option<&str>,
        stamp: &Stamp,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tenants SET
                name = COALESCE(?2, name),
                address = COALESCE(?3, address),
                last_webhook_update = ?4, processed_by = ?5, webhook_id = ?6
             WHERE tenant_id = ?1",
            params![tenant_id, name, address, stamp.at, stamp.by, stamp.webhook_id],
        )?;
        Ok(())
    }

    /// Tenant status ("installed"/"uninstalled"), if the tenant exists.
    pub fn tenant_status(&self, tenant_id: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM tenants WHERE tenant_id = ?1")?;
        let mut rows = stmt.query_map(params![tenant_id], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

// Statement helpers shared between standalone methods and composed
// transactions. They take a bare `Connection` so a `Transaction` (which
// derefs to one) works too.

fn upsert_invoice_stmt(
    conn: &Connection,
    row: &InvoiceRow,
    stamp: &Stamp,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "INSERT INTO invoices (
            external_id, tenant_id, contact_id, project_id, invoice_number,
            status, currency, amount_total, amount_due, amount_paid,
            issued_at, paid_at, created_at, deleted,
            last_webhook_update, processed_by, webhook_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?13, ?14, ?15)
         ON CONFLICT(external_id, tenant_id) DO UPDATE SET
            contact_id = COALESCE(excluded.contact_id, contact_id),
            project_id = COALESCE(excluded.project_id, project_id),
            invoice_number = COALESCE(excluded.invoice_number, invoice_number),
            status = excluded.status,
            currency = COALESCE(excluded.currency, currency),
            amount_total = excluded.amount_total,
            amount_due = excluded.amount_due,
            amount_paid = excluded.amount_paid,
            issued_at = COALESCE(excluded.issued_at, issued_at),
            paid_at = COALESCE(excluded.paid_at, paid_at),
            deleted = 0,
            last_webhook_update = excluded.last_webhook_update,
            processed_by = excluded.processed_by,
            webhook_id = excluded.webhook_id",
        params![
            row.external_id,
            row.tenant_id,
            row.contact_id,
            row.project_id,
            row.invoice_number,
            row.status,
            row.currency,
            row.amount_total,
            row.amount_due,
            row.amount_paid,
            row.issued_at,
            row.paid_at,
            stamp.at,
            stamp.by,
            stamp.webhook_id,
        ],
    )
}

fn upsert_project_stmt(
    conn: &Connection,
    row: &ProjectRow,
    stamp: &Stamp,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "INSERT INTO projects (
            external_id, tenant_id, contact_id, name, status, pipeline_stage,
            monetary_value, created_at, last_webhook_update, processed_by, webhook_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?10)
         ON CONFLICT(external_id, tenant_id) DO UPDATE SET
            contact_id = COALESCE(excluded.contact_id, contact_id),
            name = COALESCE(excluded.name, name),
            status = excluded.status,
            pipeline_stage = COALESCE(excluded.pipeline_stage, pipeline_stage),
            monetary_value = excluded.monetary_value,
            last_webhook_update = excluded.last_webhook_update,
            processed_by = excluded.processed_by,
            webhook_id = excluded.webhook_id",
        params![
            row.external_id,
            row.tenant_id,
            row.contact_id,
            row.name,
            row.status,
            row.pipeline_stage,
            row.monetary_value,
            stamp.at,
            stamp.by,
            stamp.webhook_id,
        ],
    )
}

fn append_timeline_stmt(
    conn: &Connection,
    entry: &TimelineEntry,
    stamp: &Stamp,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "INSERT INTO project_timeline (
            id, project_id, tenant_id, event_id, entry_type, cause,
            previous_value, new_value, created_at, webhook_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(event_id) DO NOTHING",
        params![
            uuid::Uuid::new_v4().to_string(),
            entry.project_id,
            entry.tenant_id,
            entry.event_id,
            entry.entry_type,
            entry.cause,
            entry.previous_value,
            entry.new_value,
            stamp.at,
            stamp.webhook_id,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueType;

    fn db() -> SyncDb {
        SyncDb::open_in_memory().expect("in-memory db")
    }

    fn stamp() -> Stamp {
        Stamp {
            at: "2026-01-01T00:00:00+00:00".into(),
            by: "test",
            webhook_id: "wh-1".into(),
        }
    }

    fn new_item(id: &str, event_id: &str, queue_type: QueueType) -> NewQueueItem {
        NewQueueItem {
            id: id.into(),
            event_id: event_id.into(),
            tenant_id: "loc-1".into(),
            queue_type,
            event_type: "ContactCreate".into(),
            payload: "{}".into(),
            max_attempts: 5,
            received_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn test_enqueue_dedups_on_event_id() {
        let db = db();
        assert!(db
            .enqueue_if_absent(&new_item("q1", "ev-1", QueueType::Contacts))
            .unwrap());
        // Same event_id, different row id: dropped
        assert!(!db
            .enqueue_if_absent(&new_item("q2", "ev-1", QueueType::Contacts))
            .unwrap());

        let counts = db.queue_counts(QueueType::Contacts).unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = db();
        db.enqueue_if_absent(&new_item("q1", "ev-1", QueueType::General))
            .unwrap();

        let now = "2026-01-01T00:01:00+00:00";
        let first = db.claim_batch(QueueType::General, 10, now).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, crate::types::QueueStatus::Processing);

        // A second claim pass sees nothing: the status guard already fired
        let second = db.claim_batch(QueueType::General, 10, now).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_concurrent_claims_never_overlap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("claims.db");

        let seed = SyncDb::open_at(&path).unwrap();
        for i in 0..40 {
            seed.enqueue_if_absent(&new_item(
                &format!("q{}", i),
                &format!("ev-{}", i),
                QueueType::General,
            ))
            .unwrap();
        }
        drop(seed);

        // Two connections race for the same backlog
        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let db = SyncDb::open_at(&path).unwrap();
                db.claim_batch(QueueType::General, 40, "2026-01-01T00:01:00+00:00")
                    .unwrap()
                    .into_iter()
                    .map(|item| item.id)
                    .collect::<Vec<_>>()
            }));
        }

        let mut all_ids: Vec<String> = Vec::new();
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        all_ids.sort();
        let total = all_ids.len();
        all_ids.dedup();
        assert_eq!(all_ids.len(), total, "no item may be claimed twice");
        assert_eq!(total, 40, "every item must be claimed exactly once");
    }

    #[test]
    fn test_claim_respects_retry_deadline() {
        let db = db();
        db.enqueue_if_absent(&new_item("q1", "ev-1", QueueType::General))
            .unwrap();
        db.requeue_for_retry("q1", "2026-01-01T01:00:00+00:00", "transient")
            .unwrap();

        // Before the deadline: not claimable
        let early = db
            .claim_batch(QueueType::General, 10, "2026-01-01T00:30:00+00:00")
            .unwrap();
        assert!(early.is_empty());

        // After: claimable again, with the attempt recorded
        let late = db
            .claim_batch(QueueType::General, 10, "2026-01-01T01:30:00+00:00")
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].attempts, 1);
        assert_eq!(late[0].last_error.as_deref(), Some("transient"));
    }

    #[test]
    fn test_claim_batch_is_per_queue_type() {
        let db = db();
        db.enqueue_if_absent(&new_item("q1", "ev-1", QueueType::Financial))
            .unwrap();
        db.enqueue_if_absent(&new_item("q2", "ev-2", QueueType::General))
            .unwrap();

        let claimed = db
            .claim_batch(QueueType::Financial, 10, "2026-01-01T00:01:00+00:00")
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "q1");
    }

    #[test]
    fn test_requeue_failed_resets_attempts() {
        let db = db();
        db.enqueue_if_absent(&new_item("q1", "ev-1", QueueType::Critical))
            .unwrap();
        db.mark_failed("q1", "2026-01-01T00:05:00+00:00", "validation")
            .unwrap();
        assert_eq!(db.queue_counts(QueueType::Critical).unwrap().failed, 1);

        let requeued = db.requeue_failed(Some(QueueType::Critical)).unwrap();
        assert_eq!(requeued, 1);

        let item = db.get_item("q1").unwrap().expect("row");
        assert_eq!(item.status, crate::types::QueueStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.next_retry_at.is_none());
    }

    #[test]
    fn test_invoice_payment_is_replay_safe() {
        let db = db();
        let stamp = stamp();

        db.upsert_project(
            &ProjectRow {
                external_id: "proj-1".into(),
                tenant_id: "loc-1".into(),
                status: "open".into(),
                monetary_value: 1000.0,
                ..Default::default()
            },
            &stamp,
        )
        .unwrap();

        let entry = TimelineEntry {
            project_id: "proj-1".into(),
            tenant_id: "loc-1".into(),
            event_id: "ev-pay-1".into(),
            entry_type: "invoice_paid".into(),
            cause: Some("INV-1".into()),
            previous_value: None,
            new_value: Some("250".into()),
        };
        let invoice = InvoiceRow {
            external_id: "INV-1".into(),
            tenant_id: "loc-1".into(),
            project_id: Some("proj-1".into()),
            status: "paid".into(),
            amount_total: 250.0,
            amount_paid: 250.0,
            ..Default::default()
        };

        assert!(db
            .apply_invoice_event(&invoice, Some((&entry, ProjectAggregate::Paid(250.0))), &stamp)
            .unwrap());
        // Replay of the same event: invoice converges, no second bump
        assert!(!db
            .apply_invoice_event(&invoice, Some((&entry, ProjectAggregate::Paid(250.0))), &stamp)
            .unwrap());

        let paid: f64 = db
            .conn_ref()
            .query_row(
                "SELECT amount_paid FROM projects WHERE external_id = 'proj-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(paid, 250.0);

        let timeline = db.project_timeline("proj-1", "loc-1").unwrap();
        assert_eq!(timeline.len(), 1);

        let status: String = db
            .conn_ref()
            .query_row(
                "SELECT status FROM invoices WHERE external_id = 'INV-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "paid");
    }

    #[test]
    fn test_failed_aggregate_update_rolls_back_invoice() {
        let db = db();
        let stamp = stamp();

        db.upsert_project(
            &ProjectRow {
                external_id: "proj-1".into(),
                tenant_id: "loc-1".into(),
                status: "open".into(),
                ..Default::default()
            },
            &stamp,
        )
        .unwrap();

        // Break the aggregate update step while leaving the invoice upsert
        // and timeline append intact
        db.conn_ref()
            .execute_batch("ALTER TABLE projects RENAME TO projects_hidden")
            .unwrap();

        let entry = TimelineEntry {
            project_id: "proj-1".into(),
            tenant_id: "loc-1".into(),
            event_id: "ev-pay-1".into(),
            entry_type: "invoice_paid".into(),
            cause: None,
            previous_value: None,
            new_value: None,
        };
        let invoice = InvoiceRow {
            external_id: "INV-1".into(),
            tenant_id: "loc-1".into(),
            project_id: Some("proj-1".into()),
            status: "paid".into(),
            amount_total: 100.0,
            amount_paid: 100.0,
            ..Default::default()
        };

        let result =
            db.apply_invoice_event(&invoice, Some((&entry, ProjectAggregate::Paid(100.0))), &stamp);
        assert!(result.is_err());

        // Neither the invoice upsert nor the timeline append survived
        let invoices: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(invoices, 0, "invoice upsert must roll back");
        let entries: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM project_timeline", [], |row| row.get(0))
            .unwrap();
        assert_eq!(entries, 0, "timeline append must roll back");
    }

    #[test]
    fn test_failed_timeline_append_rolls_back_project_upsert() {
        let db = db();
        let stamp = stamp();

        // Break the append step while leaving the project upsert intact
        db.conn_ref()
            .execute_batch("ALTER TABLE project_timeline RENAME TO project_timeline_hidden")
            .unwrap();

        let row = ProjectRow {
            external_id: "proj-1".into(),
            tenant_id: "loc-1".into(),
            status: "open".into(),
            pipeline_stage: Some("stage-2".into()),
            ..Default::default()
        };
        let entry = TimelineEntry {
            project_id: "proj-1".into(),
            tenant_id: "loc-1".into(),
            event_id: "ev-stage-1".into(),
            entry_type: "stage_change".into(),
            cause: None,
            previous_value: None,
            new_value: Some("stage-2".into()),
        };

        assert!(db.upsert_project_with_timeline(&row, &entry, &stamp).is_err());

        let projects: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(projects, 0, "project upsert must roll back");
    }

    #[test]
    fn test_uninstall_cascade() {
        let db = db();
        let stamp = stamp();

        db.upsert_tenant_install(
            &TenantInstall {
                tenant_id: "loc-1".into(),
                company_id: Some("comp-1".into()),
                install_kind: "location".into(),
                plan: Some("pro".into()),
            },
            &stamp,
        )
        .unwrap();
        db.upsert_app_user(
            &AppUserRow {
                external_id: "user-1".into(),
                tenant_id: "loc-1".into(),
                email: Some("a@example.com".into()),
                ..Default::default()
            },
            &stamp,
        )
        .unwrap();

        db.mark_tenant_uninstalled("loc-1", &stamp).unwrap();

        assert_eq!(db.tenant_status("loc-1").unwrap().as_deref(), Some("uninstalled"));

        let creds: i32 = db
            .conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM oauth_credentials WHERE tenant_id = 'loc-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(creds, 0, "credentials must be revoked");

        let reauth: i32 = db
            .conn_ref()
            .query_row(
                "SELECT requires_reauth FROM app_users WHERE external_id = 'user-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(reauth, 1, "users must be flagged for re-auth");
    }

    #[test]
    fn test_reinstall_revives_tenant() {
        let db = db();
        let stamp = stamp();
        let install = TenantInstall {
            tenant_id: "loc-1".into(),
            company_id: None,
            install_kind: "location".into(),
            plan: None,
        };

        db.upsert_tenant_install(&install, &stamp).unwrap();
        db.mark_tenant_uninstalled("loc-1", &stamp).unwrap();
        db.upsert_tenant_install(&install, &stamp).unwrap();

        assert_eq!(db.tenant_status("loc-1").unwrap().as_deref(), Some("installed"));
    }

    #[test]
    fn test_contact_upsert_converges() {
        let db = db();
        let stamp = stamp();

        db.upsert_contact(
            &ContactRow {
                external_id: "c-1".into(),
                tenant_id: "loc-1".into(),
                first_name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
                ..Default::default()
            },
            &stamp,
        )
        .unwrap();
        db.upsert_contact(
            &ContactRow {
                external_id: "c-1".into(),
                tenant_id: "loc-1".into(),
                first_name: Some("Ada".into()),
                last_name: Some("Lovelace".into()),
                email: Some("ada@newdomain.com".into()),
                ..Default::default()
            },
            &stamp,
        )
        .unwrap();

        let (count, email): (i32, String) = db
            .conn_ref()
            .query_row(
                "SELECT COUNT(*), MAX(email) FROM contacts WHERE external_id = 'c-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(email, "ada@newdomain.com");
    }
}
