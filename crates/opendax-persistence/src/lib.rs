// SPDX-License-Identifier: MIT

//! Retention backends for RETAIN-flagged tags.
//!
//! `opendax-core` only knows about the [`opendax_core::retention::RetentionStore`]
//! trait; this crate supplies two implementations:
//!
//! - [`flat_file::FlatFileStore`]: the original bit-exact record-file format.
//! - [`sqlite::SqliteStore`]: a structured backend for deployments that want
//!   to inspect or back up retained tags with ordinary SQL tooling.

pub mod flat_file;
pub mod sqlite;

pub use flat_file::FlatFileStore;
pub use sqlite::SqliteStore;
