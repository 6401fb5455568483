//! Golden codec vectors checked through the public API.

use std::collections::BTreeSet;

use crsync::{affected_tables, EncodedBatch};
use crsync_testkit::vectors::{all_vectors, verify_all_vectors};

#[test]
fn test_golden_vectors_roundtrip() {
    for (name, matches, actual) in verify_all_vectors() {
        assert!(matches, "vector '{}' encoded as {}", name, actual);
    }
}

#[test]
fn test_golden_vectors_header_and_tables() {
    for vector in all_vectors() {
        let batch = EncodedBatch::new(vector.encoded.clone());

        let sender = batch.site_id().unwrap();
        assert_eq!(sender, vector.records.first().map(|r| r.site_id), "{}", vector.name);

        let expected: BTreeSet<String> = vector.records.iter().map(|r| r.table.clone()).collect();
        assert_eq!(affected_tables(&batch).unwrap(), expected, "{}", vector.name);
    }
}
