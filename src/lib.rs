//! CRM webhook ingestion queue and processing pipeline.
//!
//! Inbound platform events are classified, enqueued durably in SQLite, and
//! projected into a local system of record by per-category processors.
//! Processing is batched, retried with backoff, and observable through a
//! per-queue SLA dashboard.

pub mod config;
pub mod db;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod ingest;
pub mod metrics;
pub mod migrations;
pub mod processors;
pub mod queue_manager;
pub mod server;
pub mod types;
