//! # crsync Testkit
//!
//! Testing utilities for crsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Fixed batches with their exact wire encoding
//! - **Generators**: Proptest strategies for values, keys and change batches
//! - **Fixtures**: Change builders for a site, tracked stores and polling helpers
//!
//! ## Golden Vectors
//!
//! ```rust
//! use crsync_testkit::vectors::all_vectors;
//!
//! for vector in all_vectors() {
//!     let encoded = crsync_core::encode(&vector.records).unwrap();
//!     assert_eq!(encoded.as_str(), vector.encoded, "{}", vector.name);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use crsync_testkit::generators::batch;
//!
//! proptest! {
//!     #[test]
//!     fn decode_inverts_encode(records in batch(16)) {
//!         let encoded = crsync_core::encode(&records).unwrap();
//!         prop_assert_eq!(encoded.decode().unwrap(), records);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use crsync_testkit::fixtures::TestFixture;
//!
//! let remote = TestFixture::with_seed(7);
//! let change = remote.set("todos", 1, "title", "milk", 1);
//! assert_eq!(change.site_id, remote.site_id);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{eventually, multi_site_fixtures, tracked_store, TestFixture, TODO_SCHEMA};
pub use generators::{batch, change_record, site_id, value};
pub use vectors::{all_vectors, verify_all_vectors, GoldenVector};
