//! Compact wire codec for change batches.
//!
//! A batch shares one originating site, written once as a header. The rest
//! of the batch is columnar: every record's `column` comes first, then every
//! `primary_key`, and so on through `seq`. Inside a field, consecutive equal
//! scalars collapse into one run.
//!
//! ```text
//! batch  = "" | header run*
//! header = "&" hex(site_id)
//! run    = "," scalar | "*" count scalar        (count >= 2)
//! scalar = "!" | "?" ("0"|"1") | "^" int | "+" float | "'" text | "&" hex
//! ```
//!
//! Inside text, `,` and `*` are written twice. A delimiter is real only when
//! it is not immediately followed by itself.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::change::ChangeRecord;
use crate::error::CodecError;
use crate::types::{SiteId, Value};

const RUN: u8 = b',';
const REPEAT: u8 = b'*';

const TAG_NULL: char = '!';
const TAG_BOOL: char = '?';
const TAG_INTEGER: char = '^';
const TAG_FLOAT: char = '+';
const TAG_TEXT: char = '\'';
const TAG_BLOB: char = '&';

/// Number of per-record fields after the site header.
const FIELDS: usize = 8;

/// Wire form of a homogeneous `ChangeRecord` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedBatch(String);

impl EncodedBatch {
    /// Wrap an already-encoded string. Validation happens on decode.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The originating peer, read from the header only.
    ///
    /// Returns `None` for the empty batch.
    pub fn site_id(&self) -> Result<Option<SiteId>, CodecError> {
        if self.0.is_empty() {
            return Ok(None);
        }
        let mut parser = Parser::new(&self.0);
        parser.header().map(Some)
    }

    /// Decode into records.
    pub fn decode(&self) -> Result<Vec<ChangeRecord>, CodecError> {
        decode(&self.0)
    }
}

impl fmt::Display for EncodedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EncodedBatch {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for EncodedBatch {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a batch. Every record must share one `site_id`.
pub fn encode(records: &[ChangeRecord]) -> Result<EncodedBatch, CodecError> {
    let Some(first) = records.first() else {
        return Ok(EncodedBatch::default());
    };

    if let Some(other) = records.iter().find(|r| r.site_id != first.site_id) {
        return Err(CodecError::MixedSites {
            first: first.site_id.to_hex(),
            other: other.site_id.to_hex(),
        });
    }

    let mut out = String::with_capacity(34 + records.len() * FIELDS * 4);
    out.push(TAG_BLOB);
    out.push_str(&first.site_id.to_hex());

    for field in 0..FIELDS {
        let mut run: Option<(String, usize)> = None;
        for record in records {
            let scalar = scalar_for(record, field);
            match &mut run {
                Some((prev, count)) if *prev == scalar => *count += 1,
                _ => {
                    if let Some((prev, count)) = run.take() {
                        push_run(&mut out, &prev, count);
                    }
                    run = Some((scalar, 1));
                }
            }
        }
        if let Some((prev, count)) = run {
            push_run(&mut out, &prev, count);
        }
    }

    Ok(EncodedBatch(out))
}

fn push_run(out: &mut String, scalar: &str, count: usize) {
    if count == 1 {
        out.push(RUN as char);
    } else {
        out.push(REPEAT as char);
        out.push_str(&count.to_string());
    }
    out.push_str(scalar);
}

fn scalar_for(record: &ChangeRecord, field: usize) -> String {
    match field {
        0 => text_scalar(&record.column),
        1 => blob_scalar(&record.primary_key),
        2 => text_scalar(&record.table),
        3 => value_scalar(&record.value),
        4 => int_scalar(record.db_version),
        5 => int_scalar(record.col_version),
        6 => int_scalar(record.causal_length),
        _ => int_scalar(record.seq),
    }
}

fn value_scalar(value: &Value) -> String {
    match value {
        Value::Null => TAG_NULL.to_string(),
        Value::Bool(b) => format!("{}{}", TAG_BOOL, u8::from(*b)),
        Value::Integer(i) => int_scalar(*i),
        Value::Float(f) => format!("{}{}", TAG_FLOAT, f),
        Value::Text(s) => text_scalar(s),
        Value::Blob(b) => blob_scalar(b),
    }
}

fn int_scalar(i: i64) -> String {
    format!("{}{}", TAG_INTEGER, i)
}

fn blob_scalar(bytes: &[u8]) -> String {
    format!("{}{}", TAG_BLOB, hex::encode(bytes))
}

fn text_scalar(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    out.push(TAG_TEXT);
    for c in s.chars() {
        if c == RUN as char || c == REPEAT as char {
            out.push(c);
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a batch produced by [`encode`].
///
/// Fails on any malformed input; a partial batch is never returned.
pub fn decode(input: &str) -> Result<Vec<ChangeRecord>, CodecError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut parser = Parser::new(input);
    let site_id = parser.header()?;
    let runs = parser.runs()?;

    let total = runs
        .iter()
        .try_fold(0usize, |acc, (count, _)| acc.checked_add(*count))
        .ok_or_else(|| CodecError::Truncated("run counts overflow".to_string()))?;
    if total == 0 || total % FIELDS != 0 {
        return Err(CodecError::Truncated(format!(
            "{} values do not fill {} fields",
            total, FIELDS
        )));
    }
    let n = total / FIELDS;
    // No two records of a batch share both `db_version` and `seq`, so each
    // record costs at least one run in one of those fields.
    if n > runs.len() {
        return Err(CodecError::Oversized {
            records: n,
            runs: runs.len(),
        });
    }

    let mut columns: Vec<Vec<(char, Value)>> = Vec::with_capacity(FIELDS);
    let mut current: Vec<(char, Value)> = Vec::with_capacity(n);
    for (count, scalar) in runs {
        if current.len() + count > n {
            return Err(CodecError::Truncated(format!(
                "run of {} crosses field {} boundary",
                count,
                FIELD_NAMES[columns.len()]
            )));
        }
        current.extend(std::iter::repeat(scalar).take(count));
        if current.len() == n {
            columns.push(std::mem::replace(&mut current, Vec::with_capacity(n)));
        }
    }

    let mut fields = columns.into_iter();
    let mut next_field = || fields.next().unwrap_or_default().into_iter();
    let column = next_field();
    let primary_key = next_field();
    let table = next_field();
    let value = next_field();
    let db_version = next_field();
    let col_version = next_field();
    let causal_length = next_field();
    let seq = next_field();

    let mut records = Vec::with_capacity(n);
    let zipped = column
        .zip(primary_key)
        .zip(table)
        .zip(value)
        .zip(db_version)
        .zip(col_version)
        .zip(causal_length)
        .zip(seq);
    for (((((((column, pk), table), value), db_version), col_version), cl), seq) in zipped {
        records.push(ChangeRecord {
            site_id,
            column: expect_text("column", column)?,
            primary_key: expect_blob("primary_key", pk)?,
            table: expect_text("table", table)?,
            value: value.1,
            db_version: expect_int("db_version", db_version)?,
            col_version: expect_int("col_version", col_version)?,
            causal_length: expect_int("causal_length", cl)?,
            seq: expect_int("seq", seq)?,
        });
    }

    Ok(records)
}

const FIELD_NAMES: [&str; FIELDS] = [
    "column",
    "primary_key",
    "table",
    "value",
    "db_version",
    "col_version",
    "causal_length",
    "seq",
];

fn expect_text(field: &'static str, (tag, value): (char, Value)) -> Result<String, CodecError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(CodecError::UnexpectedTag {
            field,
            expected: "text",
            tag,
        }),
    }
}

fn expect_blob(field: &'static str, (tag, value): (char, Value)) -> Result<Bytes, CodecError> {
    match value {
        Value::Blob(b) => Ok(b),
        _ => Err(CodecError::UnexpectedTag {
            field,
            expected: "blob",
            tag,
        }),
    }
}

fn expect_int(field: &'static str, (tag, value): (char, Value)) -> Result<i64, CodecError> {
    match value {
        Value::Integer(i) => Ok(i),
        _ => Err(CodecError::UnexpectedTag {
            field,
            expected: "integer",
            tag,
        }),
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn header(&mut self) -> Result<SiteId, CodecError> {
        let (tag, value) = self.scalar()?;
        let bytes = match value {
            Value::Blob(b) => b,
            _ => {
                return Err(CodecError::UnexpectedTag {
                    field: "site_id",
                    expected: "blob",
                    tag,
                })
            }
        };
        SiteId::try_from(bytes.as_ref())
            .map_err(|_| CodecError::InvalidHex(format!("site id of {} bytes", bytes.len())))
    }

    fn runs(&mut self) -> Result<Vec<(usize, (char, Value))>, CodecError> {
        let bytes = self.input.as_bytes();
        let mut runs = Vec::new();

        while self.pos < bytes.len() {
            let start = self.pos;
            let count = match bytes[start] {
                RUN => {
                    self.pos += 1;
                    1
                }
                REPEAT => {
                    self.pos += 1;
                    let digits = bytes[self.pos..]
                        .iter()
                        .take_while(|b| b.is_ascii_digit())
                        .count();
                    let count: usize = self.input[self.pos..self.pos + digits]
                        .parse()
                        .map_err(|_| CodecError::InvalidCount(start))?;
                    if count < 2 {
                        return Err(CodecError::InvalidCount(start));
                    }
                    self.pos += digits;
                    count
                }
                _ => return Err(self.unknown_tag()),
            };
            if self.pos >= bytes.len() {
                return Err(CodecError::UnterminatedEscape(start));
            }
            runs.push((count, self.scalar()?));
        }

        Ok(runs)
    }

    /// Parse one tagged scalar, stopping at the next real delimiter.
    fn scalar(&mut self) -> Result<(char, Value), CodecError> {
        let tag = match self.input[self.pos..].chars().next() {
            Some(c) => c,
            None => return Err(CodecError::Truncated("missing scalar".to_string())),
        };
        let payload_start = self.pos + tag.len_utf8();
        let end = self.scan(payload_start);
        let payload = &self.input[payload_start..end];

        let value = match tag {
            TAG_NULL if payload.is_empty() => Value::Null,
            TAG_NULL => return Err(CodecError::InvalidNumber(payload.to_string())),
            TAG_BOOL => match payload {
                "0" => Value::Bool(false),
                "1" => Value::Bool(true),
                _ => return Err(CodecError::InvalidNumber(payload.to_string())),
            },
            TAG_INTEGER => Value::Integer(
                payload
                    .parse()
                    .map_err(|_| CodecError::InvalidNumber(payload.to_string()))?,
            ),
            TAG_FLOAT => Value::Float(
                payload
                    .parse()
                    .map_err(|_| CodecError::InvalidNumber(payload.to_string()))?,
            ),
            TAG_TEXT => Value::Text(unescape(payload)),
            TAG_BLOB => Value::Blob(Bytes::from(
                hex::decode(payload).map_err(|e| CodecError::InvalidHex(e.to_string()))?,
            )),
            _ => return Err(self.unknown_tag()),
        };

        self.pos = end;
        Ok((tag, value))
    }

    /// Byte offset of the next real delimiter at or after `from`.
    fn scan(&self, from: usize) -> usize {
        let bytes = self.input.as_bytes();
        let mut i = from;
        while i < bytes.len() {
            let b = bytes[i];
            if b == RUN || b == REPEAT {
                if bytes.get(i + 1) == Some(&b) {
                    i += 2;
                    continue;
                }
                return i;
            }
            i += 1;
        }
        bytes.len()
    }

    fn unknown_tag(&self) -> CodecError {
        CodecError::UnknownTag {
            tag: self.input[self.pos..].chars().next().unwrap_or('\0'),
            offset: self.pos,
        }
    }
}

fn unescape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars().peekable();
    while let Some(c) = chars.next() {
        if (c == RUN as char || c == REPEAT as char) && chars.peek() == Some(&c) {
            chars.next();
        }
        out.push(c);
    }
    out
}

/// Split records into contiguous runs that share one `site_id`, so each run
/// can be encoded as its own batch without reordering.
pub fn group_by_site(records: &[ChangeRecord]) -> Vec<&[ChangeRecord]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=records.len() {
        if i == records.len() || records[i].site_id != records[start].site_id {
            groups.push(&records[start..i]);
            start = i;
        }
    }
    groups
}
