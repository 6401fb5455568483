//! Change log operations.
//!
//! `apply_operation` is the single path through which a local write turns
//! into a change batch: it samples the version, runs the caller's closure and
//! diffs the log afterwards, all inside one transaction.

use crsync_core::ChangeRecord;
use rusqlite::Connection;

use crate::engine::{Engine, PeerFilter};
use crate::error::Result;
use crate::version::{select_version, update_version};

/// Result of [`apply_operation`]: the closure's own value plus the changes
/// it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub result: T,
    pub changes: Vec<ChangeRecord>,
}

/// All changes with `db_version > since` that pass `filter`.
///
/// `since == 0` means "from the beginning" and leaves tombstones out.
pub fn changes_since(
    conn: &Connection,
    since: i64,
    filter: &PeerFilter,
) -> Result<Vec<ChangeRecord>> {
    conn.raw_change_rows(since, filter)
}

/// Merge a remote batch, then advance the watermark. Returns the new
/// watermark.
///
/// Duplicates are ignored. If local changes were still unpushed before the
/// insert, the watermark stays where it is so the next push still covers
/// them.
pub fn insert_changes(conn: &Connection, batch: &[ChangeRecord]) -> Result<i64> {
    atomically(conn, |conn| {
        let before = select_version(conn)?;
        if batch.is_empty() {
            return Ok(before.synced);
        }
        conn.insert_raw_change_rows(batch)?;
        if before.has_unsynced() {
            Ok(before.synced)
        } else {
            update_version(conn, None)
        }
    })
}

/// Merge a remote batch and return what actually changed locally.
///
/// The result can differ from `batch`: rows that lose the merge are dropped
/// and accepted rows carry this database's versions.
pub fn resolve_changes(conn: &Connection, batch: &[ChangeRecord]) -> Result<Vec<ChangeRecord>> {
    Ok(apply_operation(conn, |conn| insert_changes(conn, batch))?.changes)
}

/// Run `op` in a transaction and report the changes it made.
///
/// Every write inside `op` is recorded at one pinned version. Nested calls
/// share the outer pin.
pub fn apply_operation<T, F>(conn: &Connection, op: F) -> Result<Applied<T>>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    atomically(conn, |conn| {
        let previous = conn.pending_version()?;
        let (before, pinned) = match previous {
            Some(pinned) => (pinned - 1, pinned),
            None => {
                let current = conn.current_version()?;
                (current, current + 1)
            }
        };

        conn.set_pending_version(Some(pinned))?;
        let outcome = op(conn);
        conn.set_pending_version(previous)?;
        let result = outcome?;

        let changes = conn.raw_change_rows(before, &PeerFilter::Any)?;
        Ok(Applied { result, changes })
    })
}

/// Run `f` inside the open transaction, or in a new one if there is none.
pub(crate) fn atomically<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    if conn.in_transaction() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
