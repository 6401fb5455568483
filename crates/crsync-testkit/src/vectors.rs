//! Golden test vectors for the wire codec.
//!
//! Each vector pins a batch to its exact encoding, so any other
//! implementation of the codec can be checked byte for byte.

use bytes::Bytes;
use serde::Serialize;

use crsync_core::{decode, encode, pack, ChangeRecord, SiteId, Value, TOMBSTONE};

/// A golden test vector.
#[derive(Debug, Clone, Serialize)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// The decoded batch.
    pub records: Vec<ChangeRecord>,
    /// Its exact wire form.
    pub encoded: String,
}

const SITE: SiteId = SiteId::from_bytes([0x01; 16]);

fn site_hex() -> String {
    "01".repeat(16)
}

fn key(values: &[Value]) -> Bytes {
    pack(values).unwrap_or_default()
}

fn record(column: &str, pk: Bytes, table: &str, value: Value, versions: [i64; 4]) -> ChangeRecord {
    let [db_version, col_version, causal_length, seq] = versions;
    ChangeRecord {
        site_id: SITE,
        column: column.to_string(),
        primary_key: pk,
        table: table.to_string(),
        value,
        db_version,
        col_version,
        causal_length,
        seq,
    }
}

/// Get all golden test vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    let todo_1 = key(&[Value::Integer(1)]);
    let todo_7 = key(&[Value::Integer(7)]);
    let note_k = key(&[Value::from("k")]);
    let price = key(&[Value::Integer(1), Value::from("a")]);

    vec![
        GoldenVector {
            name: "empty batch",
            records: vec![],
            encoded: String::new(),
        },
        GoldenVector {
            name: "single insert",
            records: vec![record(
                "title",
                todo_1.clone(),
                "todos",
                Value::from("milk"),
                [1, 1, 1, 0],
            )],
            encoded: format!(
                "&{},'title,&01010000000000000001,'todos,'milk,^1,^1,^1,^0",
                site_hex()
            ),
        },
        GoldenVector {
            name: "one row, two columns, shared version",
            records: vec![
                record("title", todo_1.clone(), "todos", Value::from("milk"), [2, 1, 1, 0]),
                record("done", todo_1, "todos", Value::Integer(0), [2, 1, 1, 1]),
            ],
            encoded: format!(
                "&{},'title,'done*2&01010000000000000001*2'todos,'milk,^0*2^2*2^1*2^1,^0,^1",
                site_hex()
            ),
        },
        GoldenVector {
            name: "row deletion",
            records: vec![record(TOMBSTONE, todo_7, "todos", Value::Null, [4, 2, 2, 0])],
            encoded: format!(
                "&{},'__crsql_del,&01010000000000000007,'todos,!,^4,^2,^2,^0",
                site_hex()
            ),
        },
        GoldenVector {
            name: "delimiters inside text",
            records: vec![record("note", note_k, "notes", Value::from("a,b*c"), [1, 1, 1, 0])],
            encoded: format!(
                "&{},'note,&0103000000016b,'notes,'a,,b**c,^1,^1,^1,^0",
                site_hex()
            ),
        },
        GoldenVector {
            name: "composite key and mixed value types",
            records: vec![
                record("amount", price.clone(), "prices", Value::Float(1.5), [9, 3, 1, 0]),
                record("paid", price.clone(), "prices", Value::Bool(true), [9, 3, 1, 1]),
                record(
                    "receipt",
                    price,
                    "prices",
                    Value::Blob(Bytes::from_static(&[0xde, 0xad])),
                    [9, 3, 1, 2],
                ),
            ],
            encoded: format!(
                "&{},'amount,'paid,'receipt*3&02010000000000000001030000000161*3'prices,+1.5,?1,&dead*3^9*3^3*3^1,^0,^1,^2",
                site_hex()
            ),
        },
    ]
}

/// Check every vector in both directions.
///
/// Returns `(name, matches, actual_encoding)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let actual = encode(&v.records)
                .map(|batch| batch.into_string())
                .unwrap_or_else(|e| format!("error: {}", e));
            let decodes = decode(&v.encoded).map_or(false, |records| records == v.records);
            (v.name.to_string(), actual == v.encoded && decodes, actual)
        })
        .collect()
}

/// All vectors as pretty JSON, for sharing with other implementations.
pub fn vectors_json() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&all_vectors())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_match() {
        for (name, matches, actual) in verify_all_vectors() {
            assert!(matches, "vector '{}' encoded as {}", name, actual);
        }
    }

    #[test]
    fn test_vector_names_are_unique() {
        let vectors = all_vectors();
        let mut names: Vec<_> = vectors.iter().map(|v| v.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), vectors.len());
    }

    #[test]
    fn test_vectors_export_as_json() {
        let json = vectors_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(all_vectors().len()));
        assert!(json.contains("__crsql_del"));
    }
}
