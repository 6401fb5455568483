//! # crsync Core
//!
//! Pure primitives for crsync: change records, the compact wire codec,
//! transport chunking, and table-dependency extraction.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over replicated change data.
//!
//! ## Key Types
//!
//! - [`ChangeRecord`] - One logged mutation to a single column of a single row
//! - [`SiteId`] - Opaque 16-byte peer identifier
//! - [`Value`] - Closed set of scalar types a column can hold
//! - [`EncodedBatch`] - Wire form of a `ChangeRecord` batch
//! - [`Plan`] - Logical query plan walked by the dependency extractor
//!
//! ## Wire Format
//!
//! Batches are encoded columnar with run-length collapsing. See [`codec`].

pub mod change;
pub mod chunk;
pub mod codec;
pub mod deps;
pub mod error;
pub mod pack;
pub mod plan;
pub mod types;

pub use change::{ChangeRecord, TOMBSTONE};
pub use chunk::{chunk, ChunkOptions};
pub use codec::{decode, encode, group_by_site, EncodedBatch};
pub use deps::{affected_tables, tables_of, Dependencies};
pub use error::{CodecError, CoreError};
pub use pack::{pack, unpack};
pub use plan::{Expr, Plan, Select, TableExpr, TableRef, Visitor};
pub use types::{SiteId, Value};
