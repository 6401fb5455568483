//! Error types for crsync core.

use thiserror::Error;

/// Errors raised while decoding an encoded change batch.
///
/// Malformed input is an integrity failure: the decoder never returns a
/// partially decoded batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown type tag {tag:?} at offset {offset}")]
    UnknownTag { tag: char, offset: usize },

    #[error("field `{field}` expects {expected}, got tag {tag:?}")]
    UnexpectedTag {
        field: &'static str,
        expected: &'static str,
        tag: char,
    },

    #[error("unterminated escape at offset {0}")]
    UnterminatedEscape(usize),

    #[error("invalid run count at offset {0}")]
    InvalidCount(usize),

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("invalid hex payload: {0}")]
    InvalidHex(String),

    #[error("truncated batch: {0}")]
    Truncated(String),

    #[error("{records} records cannot come from {runs} runs")]
    Oversized { records: usize, runs: usize },

    #[error("batch mixes site ids {first} and {other}")]
    MixedSites { first: String, other: String },
}

/// Core errors outside the codec.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed packed key: {0}")]
    MalformedKey(String),

    #[error("invalid site id length: expected 16, got {0}")]
    InvalidSiteId(usize),
}
