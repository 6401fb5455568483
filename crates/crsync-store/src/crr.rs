//! Change tracking for user tables.
//!
//! A tracked table gets three AFTER triggers that mirror every write into
//! `__crsync_clock`. Each row has a sentinel cell under the tombstone cid that
//! carries its causal length; every other column gets its own cell with a
//! per-column version.
//!
//! Trigger statements avoid `OR REPLACE`: SQLite lets the conflict policy of
//! the statement that fired a trigger override the trigger body's, so cells
//! are written as an UPDATE followed by a guarded INSERT instead.

use crsync_core::TOMBSTONE;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::engine::Engine;
use crate::error::{Result, StoreError};

pub(crate) const META_PENDING: &str = "pending_version";
pub(crate) const META_MERGING: &str = "merging";

/// Shape of a tracked table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    /// Primary key columns in key order.
    pub primary_key: Vec<String>,
    /// Non-key columns in declaration order.
    pub columns: Vec<String>,
}

impl TableInfo {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Read a table's key and column layout.
pub fn table_info(conn: &Connection, table: &str) -> Result<TableInfo> {
    let mut stmt = conn.prepare(
        "SELECT name, pk, \"notnull\", dflt_value IS NOT NULL FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Err(StoreError::UnknownTable(table.to_string()));
    }

    let mut keyed: Vec<(i64, String)> = Vec::new();
    let mut columns = Vec::new();
    for (name, pk, not_null, has_default) in rows {
        if pk > 0 {
            keyed.push((pk, name));
        } else if not_null && !has_default {
            return Err(StoreError::UnsupportedColumn {
                table: table.to_string(),
                column: name,
            });
        } else {
            columns.push(name);
        }
    }

    if keyed.is_empty() {
        return Err(StoreError::NoPrimaryKey(table.to_string()));
    }
    keyed.sort();

    Ok(TableInfo {
        name: table.to_string(),
        primary_key: keyed.into_iter().map(|(_, name)| name).collect(),
        columns,
    })
}

/// Names of all tracked tables.
pub fn tracked_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM __crsync_tables ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

pub fn is_tracked(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM __crsync_tables WHERE name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Start recording changes to `table`. Idempotent.
///
/// Rows already present when tracking is first enabled are recorded at one
/// new version.
pub fn enable_tracking(conn: &Connection, table: &str) -> Result<()> {
    let info = table_info(conn, table)?;

    let added = conn.execute(
        "INSERT OR IGNORE INTO __crsync_tables (name) VALUES (?1)",
        [table],
    )? == 1;
    if added {
        backfill(conn, &info)?;
    }

    conn.execute_batch(&trigger_sql(&info))?;
    if added {
        info!(table, primary_key = ?info.primary_key, "change tracking enabled");
    }
    Ok(())
}

fn backfill(conn: &Connection, info: &TableInfo) -> Result<()> {
    let version = match conn.pending_version()? {
        Some(pinned) => pinned,
        None => conn.current_version()? + 1,
    };
    let table = lit(&info.name);
    let source = ident(&info.name);
    let pk = pack_expr(None, &info.primary_key);

    let written = conn.execute(
        &format!(
            "INSERT INTO __crsync_clock (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
             SELECT {table}, {pk}, {tomb}, NULL, 1, ?1, NULL, 1, 0 FROM {source}",
            tomb = lit(TOMBSTONE),
        ),
        [version],
    )?;
    if written == 0 {
        return Ok(());
    }

    for (i, column) in info.columns.iter().enumerate() {
        conn.execute(
            &format!(
                "INSERT INTO __crsync_clock (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
                 SELECT {table}, {pk}, {cid}, {col}, 1, ?1, NULL, 1, ?2 FROM {source}",
                cid = lit(column),
                col = ident(column),
            ),
            rusqlite::params![version, i as i64 + 1],
        )?;
    }
    info!(table = %info.name, rows = written, version, "backfilled existing rows");
    Ok(())
}

// ============================================================================
// Trigger generation
// ============================================================================

const TICK: &str = "(SELECT value FROM __crsync_meta WHERE key = 'tick')";

fn trigger_sql(info: &TableInfo) -> String {
    let table = &info.name;
    let new_pk = pack_expr(Some("NEW"), &info.primary_key);
    let old_pk = pack_expr(Some("OLD"), &info.primary_key);
    let pk_changed = info
        .primary_key
        .iter()
        .map(|c| format!("OLD.{c} IS NOT NEW.{c}", c = ident(c)))
        .collect::<Vec<_>>()
        .join(" OR ");
    let pk_changed = format!("({})", pk_changed);

    let mut insert = vec![set_tick()];
    insert.extend(sentinel(table, &new_pk, None));
    for column in &info.columns {
        let value = format!("NEW.{}", ident(column));
        insert.extend(cell(table, &new_pk, column, &value, None));
    }

    let mut update = vec![set_tick()];
    update.extend(tombstone(table, &old_pk, Some(&pk_changed)));
    update.extend(sentinel(table, &new_pk, Some(&pk_changed)));
    for column in &info.columns {
        let col = ident(column);
        let value = format!("NEW.{}", col);
        let guard = format!("(NEW.{col} IS NOT OLD.{col} OR {pk_changed})");
        update.extend(cell(table, &new_pk, column, &value, Some(&guard)));
    }

    let mut delete = vec![set_tick()];
    delete.extend(tombstone(table, &old_pk, None));

    [("insert", "INSERT", insert), ("update", "UPDATE", update), ("delete", "DELETE", delete)]
        .into_iter()
        .map(|(suffix, event, body)| {
            format!(
                "CREATE TRIGGER IF NOT EXISTS {name} AFTER {event} ON {target}\n\
                 WHEN (SELECT value FROM __crsync_meta WHERE key = '{merging}') IS NULL\n\
                 BEGIN\n{body}\nEND;\n",
                name = ident(&format!("__crsync_{}_{}", table, suffix)),
                target = ident(table),
                merging = META_MERGING,
                body = body.join("\n"),
            )
        })
        .collect()
}

fn set_tick() -> String {
    format!(
        "UPDATE __crsync_meta SET value = COALESCE(\
         (SELECT value FROM __crsync_meta WHERE key = '{pending}'), \
         (SELECT COALESCE(MAX(db_version), 0) + 1 FROM __crsync_clock)) \
         WHERE key = 'tick';",
        pending = META_PENDING
    )
}

fn seq() -> String {
    format!("(SELECT COALESCE(MAX(seq) + 1, 0) FROM __crsync_clock WHERE db_version = {TICK})")
}

fn locate(table: &str, pk: &str, cid: &str) -> String {
    format!("tbl = {} AND pk = {} AND cid = {}", lit(table), pk, lit(cid))
}

fn and_guard(guard: Option<&str>) -> String {
    guard.map(|g| format!(" AND {}", g)).unwrap_or_default()
}

/// Mark the row alive: a fresh sentinel at causal length 1, or the next odd
/// causal length after a delete.
fn sentinel(table: &str, pk: &str, guard: Option<&str>) -> [String; 2] {
    let at = locate(table, pk, TOMBSTONE);
    let next = "CASE WHEN cl % 2 = 0 THEN cl + 1 ELSE cl END";
    [
        format!(
            "UPDATE __crsync_clock SET cl = {next}, col_version = {next}, db_version = {TICK}, \
             site_id = NULL, seq = {seq} WHERE {at}{guard};",
            seq = seq(),
            guard = and_guard(guard),
        ),
        format!(
            "INSERT INTO __crsync_clock (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
             SELECT {table}, {pk}, {tomb}, NULL, 1, {TICK}, NULL, 1, {seq} \
             WHERE NOT EXISTS (SELECT 1 FROM __crsync_clock WHERE {at}){guard};",
            table = lit(table),
            tomb = lit(TOMBSTONE),
            seq = seq(),
            guard = and_guard(guard),
        ),
    ]
}

/// Mark the row deleted with the next even causal length and drop its cells.
fn tombstone(table: &str, pk: &str, guard: Option<&str>) -> [String; 3] {
    let at = locate(table, pk, TOMBSTONE);
    let next = "CASE WHEN cl % 2 = 1 THEN cl + 1 ELSE cl END";
    [
        format!(
            "UPDATE __crsync_clock SET cl = {next}, col_version = {next}, db_version = {TICK}, \
             site_id = NULL, seq = {seq} WHERE {at}{guard};",
            seq = seq(),
            guard = and_guard(guard),
        ),
        format!(
            "INSERT INTO __crsync_clock (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
             SELECT {table}, {pk}, {tomb}, NULL, 2, {TICK}, NULL, 2, {seq} \
             WHERE NOT EXISTS (SELECT 1 FROM __crsync_clock WHERE {at}){guard};",
            table = lit(table),
            tomb = lit(TOMBSTONE),
            seq = seq(),
            guard = and_guard(guard),
        ),
        format!(
            "DELETE FROM __crsync_clock WHERE tbl = {table} AND pk = {pk} AND cid != {tomb}{guard};",
            table = lit(table),
            tomb = lit(TOMBSTONE),
            guard = and_guard(guard),
        ),
    ]
}

/// Record a column write, bumping its version.
fn cell(table: &str, pk: &str, column: &str, value: &str, guard: Option<&str>) -> [String; 2] {
    let at = locate(table, pk, column);
    let cl = format!(
        "COALESCE((SELECT cl FROM __crsync_clock WHERE {}), 1)",
        locate(table, pk, TOMBSTONE)
    );
    [
        format!(
            "UPDATE __crsync_clock SET val = {value}, col_version = col_version + 1, \
             db_version = {TICK}, site_id = NULL, cl = {cl}, seq = {seq} WHERE {at}{guard};",
            seq = seq(),
            guard = and_guard(guard),
        ),
        format!(
            "INSERT INTO __crsync_clock (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
             SELECT {table}, {pk}, {cid}, {value}, 1, {TICK}, NULL, {cl}, {seq} \
             WHERE NOT EXISTS (SELECT 1 FROM __crsync_clock WHERE {at}){guard};",
            table = lit(table),
            cid = lit(column),
            seq = seq(),
            guard = and_guard(guard),
        ),
    ]
}

fn pack_expr(row: Option<&str>, columns: &[String]) -> String {
    let args = columns
        .iter()
        .map(|c| match row {
            Some(row) => format!("{}.{}", row, ident(c)),
            None => ident(c),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("crsync_pack({})", args)
}

/// Quote an SQL identifier.
pub(crate) fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal.
pub(crate) fn lit(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{open_connection, Engine, PeerFilter};
    use crsync_core::{pack, Value};

    fn setup() -> Connection {
        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch(
            "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER DEFAULT 0);",
        )
        .unwrap();
        enable_tracking(&conn, "todos").unwrap();
        conn
    }

    fn cells(conn: &Connection) -> Vec<(String, i64, i64, i64)> {
        conn.prepare("SELECT cid, col_version, db_version, cl FROM __crsync_clock ORDER BY cid")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_table_info() {
        let conn = setup();
        let info = table_info(&conn, "todos").unwrap();
        assert_eq!(info.primary_key, vec!["id"]);
        assert_eq!(info.columns, vec!["title", "done"]);
    }

    #[test]
    fn test_rejects_untrackable_tables() {
        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch(
            "CREATE TABLE nokey (a TEXT);
             CREATE TABLE strict_col (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
        .unwrap();
        assert!(matches!(
            enable_tracking(&conn, "missing"),
            Err(StoreError::UnknownTable(_))
        ));
        assert!(matches!(
            enable_tracking(&conn, "nokey"),
            Err(StoreError::NoPrimaryKey(_))
        ));
        assert!(matches!(
            enable_tracking(&conn, "strict_col"),
            Err(StoreError::UnsupportedColumn { .. })
        ));
    }

    #[test]
    fn test_enable_is_idempotent() {
        let conn = setup();
        enable_tracking(&conn, "todos").unwrap();
        assert_eq!(tracked_tables(&conn).unwrap(), vec!["todos"]);
        assert!(is_tracked(&conn, "todos").unwrap());
    }

    #[test]
    fn test_insert_records_every_column() {
        let conn = setup();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'a')", [])
            .unwrap();

        let cells = cells(&conn);
        assert_eq!(cells.len(), 3);
        assert!(cells.iter().all(|(_, cv, v, cl)| *cv == 1 && *v == 1 && *cl == 1));
        assert_eq!(conn.current_version().unwrap(), 1);
    }

    #[test]
    fn test_update_bumps_only_changed_columns() {
        let conn = setup();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute("UPDATE todos SET title = 'b' WHERE id = 1", [])
            .unwrap();

        let cells = cells(&conn);
        let title = cells.iter().find(|c| c.0 == "title").unwrap();
        let done = cells.iter().find(|c| c.0 == "done").unwrap();
        assert_eq!((title.1, title.2), (2, 2));
        assert_eq!((done.1, done.2), (1, 1));
    }

    #[test]
    fn test_conflict_policy_does_not_leak_into_triggers() {
        let conn = setup();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute("INSERT OR IGNORE INTO todos (id, title) VALUES (2, 'b')", [])
            .unwrap();
        conn.execute("UPDATE OR IGNORE todos SET title = 'c' WHERE id = 2", [])
            .unwrap();

        let title: i64 = conn
            .query_row(
                "SELECT col_version FROM __crsync_clock WHERE cid = 'title' AND pk = ?1",
                [pack(&[Value::Integer(2)]).unwrap().to_vec()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, 2);
    }

    #[test]
    fn test_delete_and_reinsert_causal_length() {
        let conn = setup();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute("DELETE FROM todos WHERE id = 1", []).unwrap();

        let after_delete = cells(&conn);
        assert_eq!(after_delete, vec![(TOMBSTONE.to_string(), 2, 2, 2)]);

        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'z')", [])
            .unwrap();
        let sentinel = cells(&conn)
            .into_iter()
            .find(|c| c.0 == TOMBSTONE)
            .unwrap();
        assert_eq!(sentinel.3, 3);

        let changes = conn.raw_change_rows(2, &PeerFilter::Any).unwrap();
        assert!(changes.iter().all(|c| c.causal_length == 3));
    }

    #[test]
    fn test_primary_key_change_moves_row() {
        let conn = setup();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute("UPDATE todos SET id = 5 WHERE id = 1", []).unwrap();

        let old_pk = pack(&[Value::Integer(1)]).unwrap().to_vec();
        let new_pk = pack(&[Value::Integer(5)]).unwrap().to_vec();
        let old_cl: i64 = conn
            .query_row(
                "SELECT cl FROM __crsync_clock WHERE pk = ?1 AND cid = ?2",
                rusqlite::params![old_pk, TOMBSTONE],
                |row| row.get(0),
            )
            .unwrap();
        let new_title: String = conn
            .query_row(
                "SELECT val FROM __crsync_clock WHERE pk = ?1 AND cid = 'title'",
                [new_pk],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_cl, 2);
        assert_eq!(new_title, "a");
    }

    #[test]
    fn test_existing_rows_are_backfilled() {
        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch(
            "CREATE TABLE notes (a TEXT, b INTEGER, body TEXT, PRIMARY KEY (b, a));
             INSERT INTO notes VALUES ('x', 1, 'hello'), ('y', 2, NULL);",
        )
        .unwrap();
        enable_tracking(&conn, "notes").unwrap();

        let info = table_info(&conn, "notes").unwrap();
        assert_eq!(info.primary_key, vec!["b", "a"]);

        let changes = conn.raw_change_rows(0, &PeerFilter::Any).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.db_version == 1 && c.column == "body"));
        assert_eq!(
            changes[0].primary_key,
            pack(&[Value::Integer(1), Value::from("x")]).unwrap()
        );
    }
}
