//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use crsync_core::SiteId;
use rusqlite::Connection;
use tracing::info;

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

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            info!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: change tracking tables and the sync watermark.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per (table, row, column). The tombstone cid holds the row's
        -- causal length; other cids hold the column's latest value.
        CREATE TABLE __crsync_clock (
            tbl TEXT NOT NULL,
            pk BLOB NOT NULL,                 -- packed primary key
            cid TEXT NOT NULL,
            val BLOB,                         -- no affinity, values kept as written
            col_version INTEGER NOT NULL,
            db_version INTEGER NOT NULL,      -- local version the cell was written at
            site_id BLOB,                     -- origin peer, NULL for local writes
            cl INTEGER NOT NULL,              -- causal length, odd while the row exists
            seq INTEGER NOT NULL,
            PRIMARY KEY (tbl, pk, cid)
        );

        -- Tables with change tracking enabled
        CREATE TABLE __crsync_tables (
            name TEXT PRIMARY KEY
        );

        -- This database's peer identity
        CREATE TABLE __crsync_site (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            site_id BLOB NOT NULL
        );

        -- Per-operation control keys read by the triggers
        CREATE TABLE __crsync_meta (
            key TEXT PRIMARY KEY,
            value INTEGER
        );
        INSERT INTO __crsync_meta (key, value) VALUES ('tick', 0);

        -- Last version exchanged with the remote
        CREATE TABLE __crsync_version (
            version INTEGER NOT NULL
        );
        INSERT INTO __crsync_version (version) VALUES (0);

        CREATE INDEX idx_crsync_clock_db_version ON __crsync_clock(db_version);
        "#,
    )?;

    conn.execute(
        "INSERT INTO __crsync_site (id, site_id) VALUES (0, ?1)",
        [SiteId::random().as_bytes().as_slice()],
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "__crsync_clock",
            "__crsync_meta",
            "__crsync_site",
            "__crsync_tables",
            "__crsync_version",
            "schema_migrations",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let site: Vec<u8> = conn
            .query_row("SELECT site_id FROM __crsync_site", [], |row| row.get(0))
            .unwrap();

        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);

        let again: Vec<u8> = conn
            .query_row("SELECT site_id FROM __crsync_site", [], |row| row.get(0))
            .unwrap();
        assert_eq!(site, again);
        assert_eq!(site.len(), SiteId::LEN);
    }

    #[test]
    fn test_watermark_seeded_to_zero() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let synced: i64 = conn
            .query_row("SELECT version FROM __crsync_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synced, 0);
    }
}
