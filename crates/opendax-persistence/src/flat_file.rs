// SPDX-License-Identifier: MIT

//! The flat-file retention format: a header plus two singly-linked record
//! chains (compound types, then tags), appended to in place and tombstoned
//! rather than compacted on delete.
//!
//! ```text
//! header:    "DAXRET" | version:u16 | first_type_ptr:u32 | first_tag_ptr:u32
//! type rec:  next_ptr:u32 | spec_len:u32 | spec bytes
//! tag rec:   next_ptr:u32 | data_size:u32 | name_len:u8 | flags:u8 | type:u32
//!            | count:u32 | name bytes | data bytes
//! ```
//!
//! The tag record carries no `attr` field; only RETAIN tags ever reach this
//! backend, so `attr` is synthesized as `ATTR_RETAIN` on load.
//!
//! All multi-byte fields are host byte order; the file is not meant to move
//! between machines of different endianness, matching the original format's
//! scope.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use opendax_core::error::{Error, Result};
use opendax_core::retention::{RetainedTag, RetainedType, RetentionStore};
use opendax_core::store::ATTR_RETAIN;

const MAGIC: &[u8; 6] = b"DAXRET";
const VERSION: u16 = 1;
const HEADER_SIZE: u64 = 16;
const TAG_RECORD_HEADER_SIZE: u64 = 18;
const TOMBSTONE_BIT: u8 = 0x01;

struct TagLocation {
    record_offset: u64,
    data_offset: u64,
    data_size: u32,
}

/// The original record-file retention backend.
pub struct FlatFileStore {
    file: File,
    first_type_ptr: u32,
    first_tag_ptr: u32,
    tag_locations: HashMap<String, TagLocation>,
}

impl FlatFileStore {
    /// Opens (or creates) the retention file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let is_new = !path.as_ref().exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if is_new {
            write_header(&mut file, 0, 0)?;
        }

        let (first_type_ptr, first_tag_ptr) = read_header(&mut file)?;
        Ok(FlatFileStore {
            file,
            first_type_ptr,
            first_tag_ptr,
            tag_locations: HashMap::new(),
        })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        Ok(offset)
    }

    fn write_first_type_ptr(&mut self, ptr: u32) -> Result<()> {
        self.first_type_ptr = ptr;
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&ptr.to_ne_bytes())?;
        Ok(())
    }

    fn write_first_tag_ptr(&mut self, ptr: u32) -> Result<()> {
        self.first_tag_ptr = ptr;
        self.file.seek(SeekFrom::Start(12))?;
        self.file.write_all(&ptr.to_ne_bytes())?;
        Ok(())
    }
}

fn write_header(file: &mut File, first_type_ptr: u32, first_tag_ptr: u32) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.write_all(&VERSION.to_ne_bytes())?;
    file.write_all(&first_type_ptr.to_ne_bytes())?;
    file.write_all(&first_tag_ptr.to_ne_bytes())?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<(u32, u32)> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    if &header[0..6] != MAGIC {
        return Err(Error::Io("not an OpenDAX retention file".into()));
    }
    let first_type_ptr = u32::from_ne_bytes(header[8..12].try_into().unwrap());
    let first_tag_ptr = u32::from_ne_bytes(header[12..16].try_into().unwrap());
    Ok((first_type_ptr, first_tag_ptr))
}

impl RetentionStore for FlatFileStore {
    fn load_types(&mut self) -> Result<Vec<RetainedType>> {
        let mut out = Vec::new();
        let mut ptr = self.first_type_ptr;
        while ptr != 0 {
            self.file.seek(SeekFrom::Start(ptr as u64))?;
            let mut head = [0u8; 8];
            self.file.read_exact(&mut head)?;
            let next_ptr = u32::from_ne_bytes(head[0..4].try_into().unwrap());
            let spec_len = u32::from_ne_bytes(head[4..8].try_into().unwrap()) as usize;
            let mut spec_bytes = vec![0u8; spec_len];
            self.file.read_exact(&mut spec_bytes)?;
            let spec = String::from_utf8(spec_bytes).map_err(|e| Error::Io(e.to_string()))?;
            out.push(RetainedType { spec });
            ptr = next_ptr;
        }
        // Records are stored most-recently-appended first; restore them in
        // declaration order.
        out.reverse();
        Ok(out)
    }

    fn load_tags(&mut self) -> Result<Vec<RetainedTag>> {
        let mut out = Vec::new();
        let mut ptr = self.first_tag_ptr;
        while ptr != 0 {
            let record_offset = ptr as u64;
            self.file.seek(SeekFrom::Start(record_offset))?;
            let mut head = [0u8; TAG_RECORD_HEADER_SIZE as usize];
            self.file.read_exact(&mut head)?;
            let next_ptr = u32::from_ne_bytes(head[0..4].try_into().unwrap());
            let data_size = u32::from_ne_bytes(head[4..8].try_into().unwrap());
            let name_len = head[8] as usize;
            let flags = head[9];
            let tag_type = u32::from_ne_bytes(head[10..14].try_into().unwrap());
            let count = u32::from_ne_bytes(head[14..18].try_into().unwrap());

            let mut name_bytes = vec![0u8; name_len];
            self.file.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes).map_err(|e| Error::Io(e.to_string()))?;
            let data_offset = record_offset + TAG_RECORD_HEADER_SIZE + name_len as u64;

            if flags & TOMBSTONE_BIT == 0 {
                let mut data = vec![0u8; data_size as usize];
                self.file.seek(SeekFrom::Start(data_offset))?;
                self.file.read_exact(&mut data)?;
                out.push(RetainedTag {
                    name: name.clone(),
                    tag_type,
                    count,
                    attr: ATTR_RETAIN,
                    data,
                });
                self.tag_locations.insert(
                    name,
                    TagLocation {
                        record_offset,
                        data_offset,
                        data_size,
                    },
                );
            }
            ptr = next_ptr;
        }
        out.reverse();
        Ok(out)
    }

    fn record_tag(&mut self, tag: &RetainedTag) -> Result<()> {
        if tag.name.len() > u8::MAX as usize {
            return Err(Error::Arg);
        }
        let mut record =
            Vec::with_capacity(TAG_RECORD_HEADER_SIZE as usize + tag.name.len() + tag.data.len());
        record.extend_from_slice(&self.first_tag_ptr.to_ne_bytes());
        record.extend_from_slice(&(tag.data.len() as u32).to_ne_bytes());
        record.push(tag.name.len() as u8);
        record.push(0); // flags: not tombstoned
        record.extend_from_slice(&tag.tag_type.to_ne_bytes());
        record.extend_from_slice(&tag.count.to_ne_bytes());
        record.extend_from_slice(tag.name.as_bytes());
        record.extend_from_slice(&tag.data);

        let record_offset = self.append(&record)?;
        let data_offset = record_offset + TAG_RECORD_HEADER_SIZE + tag.name.len() as u64;
        self.tag_locations.insert(
            tag.name.clone(),
            TagLocation {
                record_offset,
                data_offset,
                data_size: tag.data.len() as u32,
            },
        );
        self.write_first_tag_ptr(record_offset as u32)
    }

    fn persist_write(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<()> {
        let loc = self.tag_locations.get(name).ok_or(Error::NotFound)?;
        if offset as u64 + data.len() as u64 > loc.data_size as u64 {
            log::warn!("persist_write: {name} write at {offset} overruns retained data size");
            return Err(Error::TooBig);
        }
        self.file.seek(SeekFrom::Start(loc.data_offset + offset as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn record_type(&mut self, spec: &str) -> Result<()> {
        let mut record = Vec::with_capacity(8 + spec.len());
        record.extend_from_slice(&self.first_type_ptr.to_ne_bytes());
        record.extend_from_slice(&(spec.len() as u32).to_ne_bytes());
        record.extend_from_slice(spec.as_bytes());
        let record_offset = self.append(&record)?;
        self.write_first_type_ptr(record_offset as u32)
    }

    fn remove_tag(&mut self, name: &str) -> Result<()> {
        let loc = self.tag_locations.remove(name).ok_or_else(|| {
            log::warn!("remove_tag: no retained record for {name}");
            Error::NotFound
        })?;
        self.file.seek(SeekFrom::Start(loc.record_offset + 9))?;
        self.file.write_all(&[TOMBSTONE_BIT])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendax_core::types;

    #[test]
    fn round_trips_a_tag_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.dax");

        {
            let mut store = FlatFileStore::open(&path).unwrap();
            store
                .record_tag(&RetainedTag {
                    name: "speed".into(),
                    tag_type: types::DINT,
                    count: 1,
                    attr: 0x0004,
                    data: vec![0, 0, 0, 0],
                })
                .unwrap();
            store.persist_write("speed", 0, &42i32.to_ne_bytes()).unwrap();
        }

        let mut store = FlatFileStore::open(&path).unwrap();
        let tags = store.load_tags().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "speed");
        assert_eq!(i32::from_ne_bytes(tags[0].data.clone().try_into().unwrap()), 42);
    }

    #[test]
    fn tombstoned_tag_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.dax");

        let mut store = FlatFileStore::open(&path).unwrap();
        store
            .record_tag(&RetainedTag {
                name: "x".into(),
                tag_type: types::DINT,
                count: 1,
                attr: 0x0004,
                data: vec![0; 4],
            })
            .unwrap();
        store.remove_tag("x").unwrap();
        drop(store);

        let mut store = FlatFileStore::open(&path).unwrap();
        assert!(store.load_tags().unwrap().is_empty());
    }

    #[test]
    fn type_declaration_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.dax");

        let mut store = FlatFileStore::open(&path).unwrap();
        store.record_type("a:x,DINT,1").unwrap();
        store.record_type("b:y,DINT,1").unwrap();
        let types = store.load_types().unwrap();
        assert_eq!(types[0].spec, "a:x,DINT,1");
        assert_eq!(types[1].spec, "b:y,DINT,1");
    }
}
