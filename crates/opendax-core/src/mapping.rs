// SPDX-License-Identifier: MIT

//! Declarative propagation from a source tag slice to a destination slice.

use crate::handle::TagHandle;

/// No more than this many chained copies happen per originating write; a
/// cycle beyond this depth is safe (never crashes) but will not fully
/// propagate.
pub const MAX_MAP_HOPS: u32 = 128;

/// A single outgoing mapping, attached to its source tag.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub id: u32,
    pub source: TagHandle,
    pub dest: TagHandle,
}
