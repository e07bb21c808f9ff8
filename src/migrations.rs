//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("schema_version table could not be created: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("schema_version read failed: {}", e))
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Only called when there are pending migrations.
fn backup_before_migration(conn: &Connection) -> Result<(), String> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("could not resolve database file path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        // Nothing on disk to back up
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = rusqlite::Connection::open(&backup_path)
        .map_err(|e| format!("could not open backup target {}: {}", backup_path, e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("backup of {} could not start: {}", db_path, e))?;

    backup
        .step(-1)
        .map_err(|e| format!("backup copy did not complete: {}", e))?;

    log::info!("Migrations: backup written to {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
///
/// Forward-compat guard: if the database has a higher version than the highest
/// known migration, returns an error telling the operator to update hooksync.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    // Forward-compat guard
    if current > max_known {
        return Err(format!(
            "database is at schema version {}, ahead of the latest migration this build ships \
             ({}); update hooksync before running it against this file",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|e| format!("migration v{} did not apply: {}", migration.version, e))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("could not record migration v{}: {}", migration.version, e))?;

        log::info!("Migrations: applied v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1, "should apply exactly 1 migration (baseline)");

        let version = current_version(&conn).expect("version query");
        assert_eq!(version, 1);

        // Verify key tables exist with the columns callers depend on
        let queue_count: i32 = conn
            .query_row("SELECT COUNT(*) FROM webhook_queue", [], |row| row.get(0))
            .expect("webhook_queue table should exist");
        assert_eq!(queue_count, 0);

        conn.execute(
            "INSERT INTO webhook_queue (id, event_id, tenant_id, queue_type, event_type,
             payload, status, attempts, max_attempts, received_at)
             VALUES ('q1', 'ev1', 't1', 'contacts', 'ContactCreate',
             '{}', 'pending', 0, 5, '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("webhook_queue should accept a full row");

        conn.execute(
            "INSERT INTO project_timeline (id, project_id, tenant_id, event_id, entry_type, created_at)
             VALUES ('tl1', 'p1', 't1', 'ev2', 'status_change', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("project_timeline table should exist");

        conn.execute(
            "INSERT INTO metric_samples (id, event_id, tenant_id, queue_type, received_at,
             completed_at, success)
             VALUES ('m1', 'ev1', 't1', 'contacts', '2026-01-01T00:00:00Z',
             '2026-01-01T00:00:05Z', 1)",
            [],
        )
        .expect("metric_samples table should exist");

        conn.execute(
            "INSERT INTO tenants (tenant_id, install_kind, status, installed_at)
             VALUES ('t1', 'location', 'installed', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("tenants table should exist");
    }

    #[test]
    fn test_queue_event_id_is_unique() {
        let conn = mem_db();
        run_migrations(&conn).expect("migrations");

        let insert = "INSERT INTO webhook_queue (id, event_id, tenant_id, queue_type, event_type,
                      payload, status, attempts, max_attempts, received_at)
                      VALUES (?1, 'ev-dup', 't1', 'general', 'X', '{}', 'pending', 0, 5,
                      '2026-01-01T00:00:00Z')";
        conn.execute(insert, ["q1"]).expect("first insert");
        assert!(
            conn.execute(insert, ["q2"]).is_err(),
            "duplicate event_id must be rejected"
        );
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();

        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let result = run_migrations(&conn);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(
            err.contains("ahead of the latest migration"),
            "error should mention version mismatch: {}",
            err
        );
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();

        let first = run_migrations(&conn).expect("first run");
        assert_eq!(first, 1);

        let second = run_migrations(&conn).expect("second run");
        assert_eq!(second, 0, "second run should apply no migrations");

        let version = current_version(&conn).expect("version query");
        assert_eq!(version, 1);
    }

    #[test]
    fn test_pre_migration_backup_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test_backup.db");

        let conn = Connection::open(&db_path).expect("open db");
        conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();

        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1);

        let backup_path = dir.path().join("test_backup.db.pre-migration.bak");
        assert!(
            backup_path.exists(),
            "pre-migration backup should be created at {}",
            backup_path.display()
        );
    }
}
