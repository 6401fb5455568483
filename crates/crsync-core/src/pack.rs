//! Composite primary key packing.
//!
//! Layout: one count byte, then for every value a tag byte followed by its
//! payload. Integers and floats are 8 bytes big-endian; text and blobs carry
//! a u32 big-endian length prefix. Booleans pack as integers so a key has
//! the same bytes whether it came from Rust or from the SQL engine.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::types::Value;

const TAG_NULL: u8 = 0x00;
const TAG_INTEGER: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_BLOB: u8 = 0x04;

/// Pack key columns into their canonical byte form.
pub fn pack(values: &[Value]) -> Result<Bytes, CoreError> {
    let count = u8::try_from(values.len())
        .map_err(|_| CoreError::MalformedKey(format!("{} key columns", values.len())))?;

    let mut buf = BytesMut::with_capacity(1 + values.len() * 9);
    buf.put_u8(count);
    for value in values {
        match value {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_INTEGER);
                buf.put_i64(i64::from(*b));
            }
            Value::Integer(i) => {
                buf.put_u8(TAG_INTEGER);
                buf.put_i64(*i);
            }
            Value::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*f);
            }
            Value::Text(s) => {
                buf.put_u8(TAG_TEXT);
                put_len(&mut buf, s.len())?;
                buf.put_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buf.put_u8(TAG_BLOB);
                put_len(&mut buf, b.len())?;
                buf.put_slice(b);
            }
        }
    }
    Ok(buf.freeze())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CoreError> {
    let len = u32::try_from(len)
        .map_err(|_| CoreError::MalformedKey(format!("key component of {} bytes", len)))?;
    buf.put_u32(len);
    Ok(())
}

/// Unpack a key produced by [`pack`].
pub fn unpack(bytes: &[u8]) -> Result<Vec<Value>, CoreError> {
    let mut reader = Reader { bytes, pos: 0 };
    let count = reader.take(1)?[0] as usize;
    let mut values = Vec::with_capacity(count);

    for _ in 0..count {
        let tag = reader.take(1)?[0];
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_INTEGER => Value::Integer(i64::from_be_bytes(reader.array()?)),
            TAG_FLOAT => Value::Float(f64::from_be_bytes(reader.array()?)),
            TAG_TEXT => {
                let len = u32::from_be_bytes(reader.array()?) as usize;
                let raw = reader.take(len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| CoreError::MalformedKey(e.to_string()))?;
                Value::Text(text.to_string())
            }
            TAG_BLOB => {
                let len = u32::from_be_bytes(reader.array()?) as usize;
                Value::Blob(Bytes::copy_from_slice(reader.take(len)?))
            }
            other => {
                return Err(CoreError::MalformedKey(format!(
                    "unknown tag {:#04x} at offset {}",
                    other,
                    reader.pos - 1
                )))
            }
        };
        values.push(value);
    }

    if reader.pos != bytes.len() {
        return Err(CoreError::MalformedKey(format!(
            "{} trailing bytes",
            bytes.len() - reader.pos
        )));
    }
    Ok(values)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CoreError::MalformedKey(format!("truncated at offset {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CoreError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }
}
