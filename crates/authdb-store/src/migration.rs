//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, crate::now_secs()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- The node this database belongs to, and its durable clock
        CREATE TABLE node_identity (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            node_id BLOB NOT NULL,            -- 1..=32 bytes, never contains '/'
            clock BLOB NOT NULL,              -- 8 bytes BE, last clock handed out
            created_at INTEGER NOT NULL
        );

        -- Records, keyed by key hash
        CREATE TABLE records (
            key_hash BLOB PRIMARY KEY,        -- 32 bytes
            created_at INTEGER NOT NULL,
            public INTEGER NOT NULL,
            satellite_address TEXT NOT NULL,
            macaroon_head BLOB NOT NULL,
            encrypted_secret_key BLOB NOT NULL,
            encrypted_access_grant BLOB NOT NULL,
            expires_at INTEGER,
            invalidation_reason TEXT,
            invalidated_at INTEGER,
            state INTEGER NOT NULL,           -- RecordState as u32
            content_node BLOB NOT NULL,       -- version of the credential fields
            content_clock BLOB NOT NULL,
            invalidation_node BLOB,           -- version of the invalidation fields
            invalidation_clock BLOB
        ) WITHOUT ROWID;

        -- Replication log: key-only, the key is the full encoded entry
        CREATE TABLE replication_log (
            entry BLOB PRIMARY KEY
        ) WITHOUT ROWID;

        -- Last applied clock per peer
        CREATE TABLE replication_watermarks (
            peer BLOB PRIMARY KEY,
            clock BLOB NOT NULL,              -- 8 bytes BE
            updated_at INTEGER NOT NULL
        ) WITHOUT ROWID;
        "#,
    )?;

    Ok(())
}
