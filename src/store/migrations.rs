//! Version-tracked schema migrations for the tracking database.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads the
//! current version from `_migrations` and applies only newer steps, in order.
//! A database written by the older tracker (a `processed_emails` table and no
//! `_migrations` table) has its rows imported once, after V1 is applied.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS processed_messages (
            message_id TEXT PRIMARY KEY,
            thread_id TEXT,
            subject TEXT,
            sender TEXT,
            processed_at TEXT NOT NULL,
            summary TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_processed_messages_processed_at
            ON processed_messages(processed_at);

        CREATE TABLE IF NOT EXISTS digests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT,
            email_count INTEGER,
            created_at TEXT,
            digest_file TEXT,
            digest_data TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_digests_created_at ON digests(created_at);
    "#,
}];

/// Rewrites legacy `YYYY-MM-DD HH:MM:SS` timestamps into the RFC 3339 form
/// the store writes, so cutoff comparisons stay lexicographic.
const LEGACY_IMPORT_SQL: &str = r#"
    INSERT OR IGNORE INTO processed_messages
        (message_id, thread_id, subject, sender, processed_at, summary)
    SELECT message_id, thread_id, subject, sender,
           COALESCE(strftime('%Y-%m-%dT%H:%M:%SZ', processed_at), strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
           summary
    FROM processed_emails;

    UPDATE digests
    SET created_at = strftime('%Y-%m-%dT%H:%M:%SZ', created_at)
    WHERE created_at IS NOT NULL AND created_at NOT LIKE '%T%';
"#;

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;
    let legacy = current_version == 0 && table_exists(conn, "processed_emails").await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if legacy {
        conn.execute_batch(LEGACY_IMPORT_SQL)
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to import legacy tracker rows: {e}")))?;
        tracing::info!("Legacy tracker database detected, imported processed_emails");
    }

    tracing::debug!(version = get_current_version(conn).await?, "Database migrations complete");
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

async fn table_exists(conn: &Connection, name: &str) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
            libsql::params![name],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check for table {name}: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read table check: {e}")))?;

    Ok(row.map(|r| r.get::<i64>(0).unwrap_or(0) > 0).unwrap_or(false))
}

/// Record a version in `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
