//! The storage engine interface, realized on SQLite.
//!
//! Everything above this module talks to the database through [`Engine`].
//! It is implemented for [`Connection`], so transactions and savepoints get
//! it through deref.

use std::cmp::Ordering;
use std::collections::HashMap;

use bytes::Bytes;
use crsync_core::{pack, unpack, ChangeRecord, SiteId, Value, TOMBSTONE};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::crr::{self, ident, TableInfo, META_MERGING, META_PENDING};
use crate::error::{Result, StoreError};
use crate::migration;

/// Which origins to include when reading changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    /// Every change.
    Any,
    /// Only changes written by this database.
    LocalOnly,
    /// Everything except changes that came from this peer.
    Exclude(SiteId),
}

/// Operations the replication core needs from the storage engine.
pub trait Engine {
    /// Highest local `db_version` assigned so far. Never cached.
    fn current_version(&self) -> Result<i64>;

    /// This database's stable peer identity.
    fn site_identity(&self) -> Result<SiteId>;

    /// Changes with `db_version > since`, ordered by version and sequence.
    ///
    /// With `since == 0` tombstones are left out.
    fn raw_change_rows(&self, since: i64, filter: &PeerFilter) -> Result<Vec<ChangeRecord>>;

    /// Merge remote changes. Returns how many rows changed local state;
    /// replaying rows that are already known returns 0.
    fn insert_raw_change_rows(&self, rows: &[ChangeRecord]) -> Result<usize>;

    /// True if a transaction is already open on this connection.
    fn in_transaction(&self) -> bool;

    /// The version pinned for the current operation, if any.
    fn pending_version(&self) -> Result<Option<i64>>;

    /// Pin (or with `None`, unpin) the version that writes are recorded at.
    fn set_pending_version(&self, version: Option<i64>) -> Result<()>;
}

/// Open a connection, register SQL functions and apply migrations.
///
/// `":memory:"` opens a private in-memory database.
pub fn open_connection(path: &str) -> Result<Connection> {
    let mut conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    register_functions(&conn)?;
    migration::migrate(&mut conn)?;
    Ok(conn)
}

/// Register `crsync_pack(...)`, used by the change tracking triggers.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "crsync_pack",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let values: Vec<Value> = (0..ctx.len()).map(|i| from_sql_ref(ctx.get_raw(i))).collect();
            pack(&values)
                .map(|packed| packed.to_vec())
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )?;
    Ok(())
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

pub(crate) fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(Bytes::from(b)),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(Bytes::copy_from_slice(b)),
    }
}

impl Engine for Connection {
    fn current_version(&self) -> Result<i64> {
        Ok(self.query_row(
            "SELECT COALESCE(MAX(db_version), 0) FROM __crsync_clock",
            [],
            |row| row.get(0),
        )?)
    }

    fn site_identity(&self) -> Result<SiteId> {
        let bytes: Vec<u8> =
            self.query_row("SELECT site_id FROM __crsync_site WHERE id = 0", [], |row| {
                row.get(0)
            })?;
        Ok(SiteId::try_from(bytes.as_slice())?)
    }

    fn raw_change_rows(&self, since: i64, filter: &PeerFilter) -> Result<Vec<ChangeRecord>> {
        let local = self.site_identity()?;

        let mut sql = String::from(
            "SELECT tbl, pk, cid, val, col_version, db_version, site_id, cl, seq \
             FROM __crsync_clock WHERE db_version > ?",
        );
        let mut args = vec![SqlValue::Integer(since)];
        if since == 0 {
            sql.push_str(" AND cid != ?");
            args.push(SqlValue::Text(TOMBSTONE.to_string()));
        }
        match filter {
            PeerFilter::Any => {}
            PeerFilter::LocalOnly => sql.push_str(" AND site_id IS NULL"),
            PeerFilter::Exclude(peer) if *peer == local => sql.push_str(" AND site_id IS NOT NULL"),
            PeerFilter::Exclude(peer) => {
                sql.push_str(" AND (site_id IS NULL OR site_id != ?)");
                args.push(SqlValue::Blob(peer.as_bytes().to_vec()));
            }
        }
        sql.push_str(" ORDER BY db_version, seq, tbl, pk, cid");

        let mut stmt = self.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                let site_id = match row.get::<_, Option<Vec<u8>>>(6)? {
                    None => local,
                    Some(bytes) => SiteId::try_from(bytes.as_slice()).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(6, Type::Blob, Box::new(e))
                    })?,
                };
                Ok(ChangeRecord {
                    site_id,
                    column: row.get(2)?,
                    primary_key: Bytes::from(row.get::<_, Vec<u8>>(1)?),
                    table: row.get(0)?,
                    value: from_sql(row.get(3)?),
                    db_version: row.get(5)?,
                    col_version: row.get(4)?,
                    causal_length: row.get(7)?,
                    seq: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_raw_change_rows(&self, rows: &[ChangeRecord]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let version = match self.pending_version()? {
            Some(pinned) => pinned,
            None => self.current_version()? + 1,
        };
        let seq = self.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM __crsync_clock WHERE db_version = ?1",
            [version],
            |row| row.get(0),
        )?;
        let merger = Merger {
            conn: self,
            local: self.site_identity()?,
            version,
            seq,
            tables: HashMap::new(),
        };

        self.execute(
            "INSERT OR REPLACE INTO __crsync_meta (key, value) VALUES (?1, 1)",
            [META_MERGING],
        )?;
        let outcome = merger.apply(rows);
        self.execute("DELETE FROM __crsync_meta WHERE key = ?1", [META_MERGING])?;
        outcome
    }

    fn in_transaction(&self) -> bool {
        !self.is_autocommit()
    }

    fn pending_version(&self) -> Result<Option<i64>> {
        let value: Option<Option<i64>> = self
            .query_row(
                "SELECT value FROM __crsync_meta WHERE key = ?1",
                [META_PENDING],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn set_pending_version(&self, version: Option<i64>) -> Result<()> {
        match version {
            Some(v) => self.execute(
                "INSERT OR REPLACE INTO __crsync_meta (key, value) VALUES (?1, ?2)",
                params![META_PENDING, v],
            )?,
            None => self.execute("DELETE FROM __crsync_meta WHERE key = ?1", [META_PENDING])?,
        };
        Ok(())
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Applies remote rows with causal-length and last-writer-wins rules.
///
/// Causal length decides whether the row exists. Within one causal length a
/// higher column version wins, and equal versions fall back to
/// [`Value::merge_cmp`]. Every row written by one call shares `version`.
struct Merger<'a> {
    conn: &'a Connection,
    local: SiteId,
    version: i64,
    seq: i64,
    tables: HashMap<String, Option<TableInfo>>,
}

impl<'a> Merger<'a> {
    fn apply(mut self, rows: &[ChangeRecord]) -> Result<usize> {
        let mut applied = 0;
        for row in rows {
            if self.merge(row)? {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(applied, version = self.version, "merged remote changes");
        }
        Ok(applied)
    }

    fn table(&mut self, name: &str) -> Result<Option<TableInfo>> {
        if let Some(cached) = self.tables.get(name) {
            return Ok(cached.clone());
        }
        let info = if crr::is_tracked(self.conn, name)? {
            Some(crr::table_info(self.conn, name)?)
        } else {
            None
        };
        self.tables.insert(name.to_string(), info.clone());
        Ok(info)
    }

    fn merge(&mut self, row: &ChangeRecord) -> Result<bool> {
        let Some(info) = self.table(&row.table)? else {
            warn!(table = %row.table, "skipping change for untracked table");
            return Ok(false);
        };
        if !row.is_tombstone() && !info.has_column(&row.column) {
            warn!(table = %row.table, column = %row.column, "skipping change for unknown column");
            return Ok(false);
        }

        let key = unpack(&row.primary_key)?;
        if key.len() != info.primary_key.len() {
            return Err(StoreError::InvalidData(format!(
                "{} key columns for {}, expected {}",
                key.len(),
                row.table,
                info.primary_key.len()
            )));
        }
        let origin = (row.site_id != self.local).then_some(row.site_id);
        let local_cl = self.causal_length(row)?;

        if row.is_tombstone() {
            if row.causal_length <= local_cl {
                return Ok(false);
            }
            self.write_clock(row, TOMBSTONE, &Value::Null, row.col_version, origin)?;
            if row.is_delete() {
                self.delete_row(&info, &key)?;
                self.conn.execute(
                    "DELETE FROM __crsync_clock WHERE tbl = ?1 AND pk = ?2 AND cid != ?3",
                    params![row.table, row.primary_key.as_ref(), TOMBSTONE],
                )?;
            } else {
                self.revive_row(&info, &key, row)?;
            }
            return Ok(true);
        }

        if row.causal_length < local_cl || row.is_delete() {
            return Ok(false);
        }

        let reborn = row.causal_length > local_cl;
        if reborn {
            self.write_clock(row, TOMBSTONE, &Value::Null, row.causal_length, origin)?;
            self.revive_row(&info, &key, row)?;
        }

        let existing: Option<(i64, SqlValue)> = self
            .conn
            .query_row(
                "SELECT col_version, val FROM __crsync_clock WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
                params![row.table, row.primary_key.as_ref(), row.column],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let wins = match existing {
            None => true,
            Some((col_version, val)) => match row.col_version.cmp(&col_version) {
                Ordering::Greater => true,
                Ordering::Equal => row.value.merge_cmp(&from_sql(val)) == Ordering::Greater,
                Ordering::Less => false,
            },
        };
        if !wins {
            return Ok(reborn);
        }

        let mut args = vec![to_sql(&row.value)];
        args.extend(key.iter().map(to_sql));
        self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ? WHERE {}",
                ident(&info.name),
                ident(&row.column),
                key_predicate(&info)
            ),
            params_from_iter(args),
        )?;
        self.write_clock(row, &row.column, &row.value, row.col_version, origin)?;
        Ok(true)
    }

    fn causal_length(&self, row: &ChangeRecord) -> Result<i64> {
        let cl: Option<i64> = self
            .conn
            .query_row(
                "SELECT cl FROM __crsync_clock WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
                params![row.table, row.primary_key.as_ref(), TOMBSTONE],
                |r| r.get(0),
            )
            .optional()?;
        Ok(cl.unwrap_or(0))
    }

    fn write_clock(
        &mut self,
        row: &ChangeRecord,
        cid: &str,
        value: &Value,
        col_version: i64,
        origin: Option<SiteId>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO __crsync_clock \
             (tbl, pk, cid, val, col_version, db_version, site_id, cl, seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.table,
                row.primary_key.as_ref(),
                cid,
                to_sql(value),
                col_version,
                self.version,
                origin.map(|site| site.as_bytes().to_vec()),
                row.causal_length,
                self.seq,
            ],
        )?;
        self.seq += 1;
        Ok(())
    }

    /// Ensure the base row exists and drop cells from an earlier life.
    fn revive_row(&self, info: &TableInfo, key: &[Value], row: &ChangeRecord) -> Result<()> {
        let columns = info
            .primary_key
            .iter()
            .map(|c| ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; key.len()].join(", ");
        self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                ident(&info.name),
                columns,
                placeholders
            ),
            params_from_iter(key.iter().map(to_sql)),
        )?;
        self.conn.execute(
            "DELETE FROM __crsync_clock WHERE tbl = ?1 AND pk = ?2 AND cid != ?3 AND cl < ?4",
            params![row.table, row.primary_key.as_ref(), TOMBSTONE, row.causal_length],
        )?;
        Ok(())
    }

    fn delete_row(&self, info: &TableInfo, key: &[Value]) -> Result<()> {
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {}",
                ident(&info.name),
                key_predicate(info)
            ),
            params_from_iter(key.iter().map(to_sql)),
        )?;
        Ok(())
    }
}

fn key_predicate(info: &TableInfo) -> String {
    info.primary_key
        .iter()
        .map(|c| format!("{} IS ?", ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}
