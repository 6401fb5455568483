//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use crsync_core::{pack, ChangeRecord, EncodedBatch, SiteId, Value, TOMBSTONE};
use crsync_store::{Store, StoreError};

/// Schema used by most scenarios: a tracked `todos` table and a tracked
/// `tags` table.
pub const TODO_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER DEFAULT 0);
    CREATE TABLE IF NOT EXISTS tags (id INTEGER PRIMARY KEY, name TEXT);
";

/// A simulated remote peer that hand-writes change records.
pub struct TestFixture {
    pub site_id: SiteId,
}

impl TestFixture {
    /// Create a new test fixture with a random site id.
    pub fn new() -> Self {
        Self {
            site_id: SiteId::random(),
        }
    }

    /// Create with a deterministic site id.
    pub fn with_seed(seed: u8) -> Self {
        Self {
            site_id: SiteId::from_bytes([seed; 16]),
        }
    }

    /// Packed single-column integer key.
    pub fn key(id: i64) -> bytes::Bytes {
        // One integer component always fits the key format.
        pack(&[Value::Integer(id)]).unwrap_or_default()
    }

    /// A first write of `column` on a live row.
    pub fn set(
        &self,
        table: &str,
        id: i64,
        column: &str,
        value: impl Into<Value>,
        db_version: i64,
    ) -> ChangeRecord {
        self.set_at(table, id, column, value, db_version, 1)
    }

    /// A write of `column` carrying an explicit column version.
    pub fn set_at(
        &self,
        table: &str,
        id: i64,
        column: &str,
        value: impl Into<Value>,
        db_version: i64,
        col_version: i64,
    ) -> ChangeRecord {
        ChangeRecord {
            site_id: self.site_id,
            column: column.to_string(),
            primary_key: Self::key(id),
            table: table.to_string(),
            value: value.into(),
            db_version,
            col_version,
            causal_length: 1,
            seq: 0,
        }
    }

    /// A row deletion after its first life.
    pub fn delete(&self, table: &str, id: i64, db_version: i64) -> ChangeRecord {
        ChangeRecord {
            site_id: self.site_id,
            column: TOMBSTONE.to_string(),
            primary_key: Self::key(id),
            table: table.to_string(),
            value: Value::Null,
            db_version,
            col_version: 2,
            causal_length: 2,
            seq: 0,
        }
    }

    /// Encode `records` as one batch, renumbering `seq` within each version.
    ///
    /// Records must all carry this fixture's site id; a mixed set encodes
    /// as the empty batch.
    pub fn batch(&self, mut records: Vec<ChangeRecord>) -> EncodedBatch {
        let mut previous = None;
        let mut seq = 0;
        for record in &mut records {
            if previous != Some(record.db_version) {
                previous = Some(record.db_version);
                seq = 0;
            }
            record.seq = seq;
            seq += 1;
        }
        crsync_core::encode(&records).unwrap_or_default()
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple fixtures with distinct, deterministic site ids.
pub fn multi_site_fixtures(count: usize) -> Vec<TestFixture> {
    (0..count)
        .map(|i| TestFixture::with_seed(i as u8 + 1))
        .collect()
}

/// A private in-memory store with `schema` applied and `tables` tracked.
pub async fn tracked_store(schema: &'static str, tables: &[&str]) -> Result<Arc<Store>, StoreError> {
    let store = Arc::new(Store::open_memory()?);
    store
        .write(move |conn| {
            conn.execute_batch(schema)?;
            Ok(())
        })
        .await?;
    for table in tables {
        store.enable_tracking(table).await?;
    }
    Ok(store)
}

/// Poll `check` until it holds, for up to three seconds.
///
/// Panics when the condition is never reached.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crsync_store::PeerFilter;

    #[test]
    fn test_fixture_records() {
        let fixture = TestFixture::with_seed(9);
        let set = fixture.set("todos", 1, "title", "milk", 3);
        assert_eq!(set.site_id, SiteId::from_bytes([9; 16]));
        assert_eq!(set.causal_length, 1);
        assert!(!set.is_tombstone());

        let delete = fixture.delete("todos", 1, 4);
        assert!(delete.is_tombstone());
        assert!(delete.is_delete());
        assert_eq!(delete.primary_key, set.primary_key);
    }

    #[test]
    fn test_batch_numbers_seq_per_version() {
        let fixture = TestFixture::with_seed(1);
        let batch = fixture.batch(vec![
            fixture.set("todos", 1, "title", "a", 1),
            fixture.set("todos", 1, "done", 0i64, 1),
            fixture.set("todos", 2, "title", "b", 2),
        ]);
        let seqs: Vec<i64> = batch.decode().unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 0]);
        assert_eq!(batch.site_id().unwrap(), Some(fixture.site_id));
    }

    #[test]
    fn test_multi_site() {
        let sites: Vec<SiteId> = multi_site_fixtures(3).iter().map(|f| f.site_id).collect();
        assert_ne!(sites[0], sites[1]);
        assert_ne!(sites[1], sites[2]);
        assert_ne!(sites[0], sites[2]);
    }

    #[tokio::test]
    async fn test_tracked_store_accepts_fixture_changes() {
        let store = tracked_store(TODO_SCHEMA, &["todos", "tags"]).await.unwrap();
        let remote = TestFixture::with_seed(5);

        store
            .insert_changes(vec![remote.set("todos", 1, "title", "milk", 1)])
            .await
            .unwrap();

        let title: String = store
            .read(|conn| Ok(conn.query_row("SELECT title FROM todos WHERE id = 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(title, "milk");

        let changes = store.changes_since(0, PeerFilter::Exclude(remote.site_id)).await.unwrap();
        assert!(changes.is_empty());
    }
}
