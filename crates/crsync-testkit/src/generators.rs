//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use crsync_core::{pack, ChangeRecord, SiteId, Value, TOMBSTONE};

/// Generate a random SiteId.
pub fn site_id() -> impl Strategy<Value = SiteId> {
    any::<[u8; 16]>().prop_map(SiteId::from_bytes)
}

/// Generate short text that leans on the codec's delimiter and tag characters.
pub fn wire_text() -> impl Strategy<Value = String> {
    "[a-c,*'^&!+?]{0,8}".prop_map(String::from)
}

/// Generate an identifier-like name.
pub fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}".prop_map(String::from)
}

/// Generate any column value. Floats are finite so records compare equal to
/// themselves.
pub fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1e12f64..1e12f64).prop_map(Value::Float),
        wire_text().prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::from),
    ]
}

/// A single primary key component.
pub fn key_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        wire_text().prop_map(Value::Text),
    ]
}

/// Generate a packed primary key of one to three columns.
pub fn primary_key() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(key_value(), 1..=3).prop_filter_map("packable key", |values| pack(&values).ok())
}

/// Everything about a change record except who wrote it and when.
#[derive(Debug, Clone)]
pub struct ChangeParams {
    pub table: String,
    pub column: String,
    pub primary_key: Bytes,
    pub value: Value,
    pub col_version: i64,
    pub causal_length: i64,
}

impl ChangeParams {
    pub fn into_record(self, site_id: SiteId, db_version: i64, seq: i64) -> ChangeRecord {
        ChangeRecord {
            site_id,
            column: self.column,
            primary_key: self.primary_key,
            table: self.table,
            value: self.value,
            db_version,
            col_version: self.col_version,
            causal_length: self.causal_length,
            seq,
        }
    }
}

impl Arbitrary for ChangeParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        let column = prop_oneof![
            4 => name(),
            1 => wire_text(),
            1 => Just(TOMBSTONE.to_string()),
        ];
        (
            prop_oneof![Just("todos".to_string()), Just("tags".to_string()), name()],
            column,
            primary_key(),
            value(),
            1i64..=5,
            1i64..=4,
        )
            .prop_map(|(table, column, primary_key, value, col_version, causal_length)| ChangeParams {
                table,
                column,
                primary_key,
                value,
                col_version,
                causal_length,
            })
            .boxed()
    }
}

/// Generate a change record written by `site_id`.
pub fn change_record(site_id: SiteId) -> impl Strategy<Value = ChangeRecord> {
    (any::<ChangeParams>(), 1i64..=100, 0i64..10)
        .prop_map(move |(params, db_version, seq)| params.into_record(site_id, db_version, seq))
}

/// Generate a homogeneous batch as a peer would send it: one site, versions
/// non-decreasing, `seq` counting up inside each version.
pub fn batch(max_len: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
    (
        site_id(),
        prop::collection::vec((any::<ChangeParams>(), 0i64..3), 0..=max_len),
    )
        .prop_map(|(site, rows)| {
            let mut db_version = 1;
            let mut seq = 0;
            rows.into_iter()
                .map(|(params, step)| {
                    if step > 0 {
                        db_version += step;
                        seq = 0;
                    }
                    let record = params.into_record(site, db_version, seq);
                    seq += 1;
                    record
                })
                .collect()
        })
}

/// Generate a change set spanning several sites, as a server would relay it.
pub fn mixed_batch(max_groups: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
    prop::collection::vec(batch(6), 0..=max_groups).prop_map(|groups| groups.concat())
}
