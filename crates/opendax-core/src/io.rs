// SPDX-License-Identifier: MIT

//! The capability trait backing virtual and special tags.
//!
//! A virtual tag's data is produced or consumed by a function rather than a
//! flat buffer (e.g. `_time`, `_my_tagname`). A special tag runs this hook
//! *before* the normal buffer path, without replacing it. Both cases are
//! served by the same small trait, following the "polymorphic over a
//! capability set" guidance for what was a raw function pointer in the
//! original implementation.

use crate::error::Result;

/// A read/write capability installed on a tag in place of (or ahead of) its
/// flat data buffer.
pub trait TagIo: Send {
    /// Produces `size` bytes starting at `offset`.
    fn read(&mut self, offset: u32, size: u32) -> Result<Vec<u8>>;

    /// Consumes `data` at `offset`. Virtual tags with no meaningful write
    /// path should return `Err(Error::ReadOnly)`.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;
}
