//! # authdb Testkit
//!
//! Testing utilities for authdb.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: exact log key bytes every implementation must produce
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: multi-node clusters on an in-memory network
//!
//! ## Golden Vectors
//!
//! ```rust
//! use authdb_testkit::vectors::verify_all_vectors;
//!
//! for (name, matches, hex) in verify_all_vectors() {
//!     assert!(matches, "{}: {}", name, hex);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use authdb_testkit::generators::pooled_log_entry;
//!
//! proptest! {
//!     #[test]
//!     fn resolve_ignores_order(mut entries in prop::collection::vec(pooled_log_entry(), 1..8)) {
//!         let forward = authdb_core::resolve(&entries);
//!         entries.reverse();
//!         prop_assert_eq!(forward, authdb_core::resolve(&entries));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use authdb_testkit::fixtures::{test_record, TestCluster};
//!
//! async fn example() {
//!     let cluster = TestCluster::new(&["n1", "n2"]).await;
//!     cluster.node("n1").put(&test_record(1, "secret")).await.unwrap();
//!     cluster.sync_all().await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{numbered_cluster, test_record, TestCluster};
pub use generators::{record_from_params, RecordParams};
pub use vectors::{all_vectors, entry_from_vector, verify_all_vectors, GoldenVector};
