//! The change record: one logged mutation to a single column of a single row.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{SiteId, Value};

/// Reserved column name marking a row deletion (or re-insertion sentinel).
pub const TOMBSTONE: &str = "__crsql_del";

/// A single replicated mutation.
///
/// `(site_id, table, primary_key, column)` plus `db_version` identifies a
/// change. Records are never mutated once created; replaying one is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Originating peer.
    pub site_id: SiteId,
    /// Mutated column, or [`TOMBSTONE`].
    pub column: String,
    /// Packed composite primary key, see [`crate::pack`].
    pub primary_key: Bytes,
    pub table: String,
    pub value: Value,
    /// Version of the originating database at time of write.
    pub db_version: i64,
    /// Per-column logical clock.
    pub col_version: i64,
    /// Odd while the row exists, even once deleted.
    pub causal_length: i64,
    /// Intra-transaction ordering.
    pub seq: i64,
}

impl ChangeRecord {
    /// True if this record marks a row deletion or resurrection rather than
    /// a column update.
    pub fn is_tombstone(&self) -> bool {
        self.column == TOMBSTONE
    }

    /// True if the causal length says the row is deleted.
    pub fn is_delete(&self) -> bool {
        self.causal_length % 2 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(column: &str, cl: i64) -> ChangeRecord {
        ChangeRecord {
            site_id: SiteId::from_bytes([1; 16]),
            column: column.to_string(),
            primary_key: Bytes::from_static(&[1, 1, 0, 0, 0, 0, 0, 0, 0, 1]),
            table: "todos".to_string(),
            value: Value::Null,
            db_version: 1,
            col_version: 1,
            causal_length: cl,
            seq: 0,
        }
    }

    #[test]
    fn test_tombstone_detection() {
        assert!(record(TOMBSTONE, 2).is_tombstone());
        assert!(record(TOMBSTONE, 2).is_delete());
        assert!(!record("title", 1).is_tombstone());
        assert!(!record("title", 1).is_delete());
    }
}
