// SPDX-License-Identifier: MIT

//! Wire-level tag handles: a 21-byte descriptor of a slice of a tag.
//!
//! The on-wire layout (index, byte offset, bit offset, count, size, type) is
//! taken from the original server's `group_add` decoding, which is the only
//! place in the source that lays out a handle byte-for-byte; the
//! specification's mapping-request table states 22 bytes for the same
//! structure, one more than the fields account for. We follow the decoding
//! that is actually exercised (21 bytes) for both mapping and group handles;
//! see `DESIGN.md`.

use crate::error::{Error, Result};
use crate::types::TagType;

/// A slice of a tag: which tag, which bytes/bits, how many elements, and
/// their declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHandle {
    pub index: u32,
    pub byte: u32,
    pub bit: u8,
    pub count: u32,
    pub size: u32,
    pub type_: TagType,
}

impl TagHandle {
    pub const WIRE_SIZE: usize = 21;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Arg);
        }
        Ok(TagHandle {
            index: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            byte: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            bit: buf[8],
            count: u32::from_ne_bytes(buf[9..13].try_into().unwrap()),
            size: u32::from_ne_bytes(buf[13..17].try_into().unwrap()),
            type_: u32::from_ne_bytes(buf[17..21].try_into().unwrap()),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_ne_bytes());
        out.extend_from_slice(&self.byte.to_ne_bytes());
        out.push(self.bit);
        out.extend_from_slice(&self.count.to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
        out.extend_from_slice(&self.type_.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_form() {
        let h = TagHandle {
            index: 7,
            byte: 4,
            bit: 3,
            count: 2,
            size: 8,
            type_: crate::types::DINT,
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), TagHandle::WIRE_SIZE);
        assert_eq!(TagHandle::decode(&buf).unwrap(), h);
    }
}
