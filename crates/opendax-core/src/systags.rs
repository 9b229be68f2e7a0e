// SPDX-License-Identifier: MIT

//! Built-in virtual tags backed by [`TagIo`] instead of a flat buffer.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::io::TagIo;

/// `_time`: milliseconds since the Unix epoch, read-only, refreshed on
/// every read rather than ticked by the poll loop.
#[derive(Debug, Default)]
pub struct TimeTag;

impl TagIo for TimeTag {
    fn read(&mut self, offset: u32, size: u32) -> Result<Vec<u8>> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let bytes = millis.to_ne_bytes();
        let start = offset as usize;
        let end = start + size as usize;
        bytes.get(start..end).map(|s| s.to_vec()).ok_or(Error::Arg)
    }

    fn write(&mut self, _offset: u32, _data: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

/// `_my_tagname`: reports the name of the module currently making a
/// request. There is a single shared tag index; the dispatcher re-installs
/// a fresh `MyTagName` with the calling module's name immediately before
/// each read, mirroring the original's ambient "current fd" lookup.
#[derive(Debug)]
pub struct MyTagName {
    name: Vec<u8>,
}

impl MyTagName {
    pub fn new(name: &str, width: usize) -> Self {
        let mut bytes = name.as_bytes().to_vec();
        bytes.resize(width, 0);
        MyTagName { name: bytes }
    }
}

impl TagIo for MyTagName {
    fn read(&mut self, offset: u32, size: u32) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + size as usize;
        self.name.get(start..end).map(|s| s.to_vec()).ok_or(Error::Arg)
    }

    fn write(&mut self, _offset: u32, _data: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_tag_advances() {
        let mut t = TimeTag;
        let a = u64::from_ne_bytes(t.read(0, 8).unwrap().try_into().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = u64::from_ne_bytes(t.read(0, 8).unwrap().try_into().unwrap());
        assert!(b >= a);
    }

    #[test]
    fn my_tagname_pads_to_width() {
        let mut t = MyTagName::new("plc1", 8);
        let bytes = t.read(0, 8).unwrap();
        assert_eq!(&bytes[0..4], b"plc1");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }
}
