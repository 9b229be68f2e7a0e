// SPDX-License-Identifier: MIT

//! Core tag-server engine: the typed tag store, compound types, events,
//! mappings, groups, atomic read-modify-write, overrides, and the wire
//! protocol and dispatcher that drive them from a single-threaded
//! connection loop.
//!
//! `opendax-core` has no storage-engine dependency; retention backends
//! implement [`retention::RetentionStore`] and live in `opendax-persistence`.

pub mod atomic;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod groups;
pub mod handle;
pub mod io;
pub mod mapping;
pub mod protocol;
pub mod queue;
pub mod retention;
pub mod runtime;
pub mod store;
pub mod systags;
pub mod types;

pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use store::TagServer;
