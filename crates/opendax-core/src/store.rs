// SPDX-License-Identifier: MIT

//! The tag store: the indexed array of tags, the sorted name index, and the
//! read/write/delete operations that every other engine builds on.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventOptions, ModuleId, Notification};
use crate::io::TagIo;
use crate::mapping::{Mapping, MAX_MAP_HOPS};
use crate::queue::Queue;
use crate::retention::{NullRetentionStore, RetainedTag, RetentionStore};
use crate::types::{self, TagType, TypeRegistry};

/// Maximum length of a tag name, in bytes.
pub const MAX_TAG_NAME: usize = 32;

pub const ATTR_READONLY: u16 = 0x0001;
pub const ATTR_VIRTUAL: u16 = 0x0002;
pub const ATTR_RETAIN: u16 = 0x0004;
pub const ATTR_OVERRIDE: u16 = 0x0008;
pub const ATTR_OVR_SET: u16 = 0x0010;
pub const ATTR_SPECIAL: u16 = 0x0020;
pub const ATTR_OWNED: u16 = 0x0040;
pub const ATTR_EVENT: u16 = 0x0080;
pub const ATTR_MAPPING: u16 = 0x0100;

enum Backing {
    Flat(Vec<u8>),
    Queue(Queue),
    Virtual(Box<dyn TagIo>),
}

/// A tag: name, type, attributes, data, and the event/mapping/override state
/// attached to it.
pub struct Tag {
    pub index: u32,
    pub name: String,
    pub tag_type: TagType,
    pub count: u32,
    pub attr: u16,
    backing: Backing,
    pub owner_fd: Option<ModuleId>,
    pub events: Vec<Event>,
    pub mappings: Vec<Mapping>,
    override_mask: Option<Vec<u8>>,
    override_data: Option<Vec<u8>>,
    next_event_id: u32,
    next_map_id: u32,
    special: Option<Box<dyn TagIo>>,
    deleted: bool,
}

impl Tag {
    pub fn byte_size(&self) -> u32 {
        match &self.backing {
            Backing::Flat(d) => d.len() as u32,
            Backing::Queue(q) => q.element_size() as u32,
            Backing::Virtual(_) => 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.backing, Backing::Queue(_))
    }
}

/// Owns the tag array, the name index, the type registry, and (optionally) a
/// retention backend. This is the single mutable "database" object the
/// dispatcher drives; see `DESIGN NOTES` in the specification for why this
/// stays one owning struct rather than scattered global state.
pub struct TagServer {
    pub types: TypeRegistry,
    tags: Vec<Tag>,
    /// Kept sorted by name for O(log n) lookup by bisection.
    name_index: Vec<(String, u32)>,
    retention: Box<dyn RetentionStore>,
    tag_added_index: Option<u32>,
    tag_deleted_index: Option<u32>,
    my_tagname_index: Option<u32>,
    start_time_unix: u64,
    /// CDT types already handed to the retention backend via `record_type`,
    /// so a second RETAIN tag of the same custom type doesn't persist a
    /// duplicate type record.
    retained_types: std::collections::HashSet<TagType>,
}

impl TagServer {
    /// Builds a fresh store with the fixed system tags installed, and no
    /// retention backend (writes to RETAIN tags are simply not persisted).
    pub fn new(start_time_unix: u64) -> Self {
        Self::with_retention(start_time_unix, Box::new(NullRetentionStore))
    }

    pub fn with_retention(start_time_unix: u64, retention: Box<dyn RetentionStore>) -> Self {
        let mut server = TagServer {
            types: TypeRegistry::new(),
            tags: Vec::new(),
            name_index: Vec::new(),
            retention,
            tag_added_index: None,
            tag_deleted_index: None,
            my_tagname_index: None,
            start_time_unix,
            retained_types: std::collections::HashSet::new(),
        };
        server.install_system_tags();
        server
    }

    fn install_system_tags(&mut self) {
        // `_tagcount`/`_lastindex`/`_dbsize` are read through tag_count() /
        // tag_len() by callers rather than materialized as live counters
        // here, since they must always reflect the *current* store size.
        let added_idx = self
            .tag_add(None, "_tag_added", types::DINT, 1, 0)
            .expect("system tag install");
        self.tag_added_index = Some(added_idx);
        let deleted_idx = self
            .tag_add(None, "_tag_deleted", types::DINT, 1, 0)
            .expect("system tag install");
        self.tag_deleted_index = Some(deleted_idx);
        self.tag_add(None, "_starttime", types::UDINT, 1, ATTR_READONLY)
            .expect("system tag install");
        self.tag_add(None, "_lastmodule", types::CHAR, MAX_TAG_NAME as u32 + 1, 0)
            .expect("system tag install");
        self.tag_add(None, "_overrides_installed", types::UINT, 1, ATTR_READONLY)
            .expect("system tag install");
        self.tag_add(None, "_overrides_set", types::UINT, 1, ATTR_READONLY)
            .expect("system tag install");
        let time_idx = self
            .tag_add(None, "_time", types::ULINT, 1, ATTR_READONLY | ATTR_VIRTUAL)
            .expect("system tag install");
        self.install_virtual(time_idx, Box::new(crate::systags::TimeTag))
            .expect("system tag install");
        let my_tagname_idx = self
            .tag_add(
                None,
                "_my_tagname",
                types::CHAR,
                MAX_TAG_NAME as u32 + 1,
                ATTR_READONLY | ATTR_VIRTUAL,
            )
            .expect("system tag install");
        self.install_virtual(
            my_tagname_idx,
            Box::new(crate::systags::MyTagName::new("", MAX_TAG_NAME + 1)),
        )
        .expect("system tag install");
        self.my_tagname_index = Some(my_tagname_idx);
        if let Ok(idx) = self.find_index("_starttime") {
            let _ = self.tag_write_system(idx, 0, &(self.start_time_unix as u32).to_ne_bytes());
        }
    }

    /// Re-targets `_my_tagname` to report `name` on its next read. Called
    /// just before dispatching a request on behalf of a module, mirroring
    /// the original's ambient "current fd" lookup.
    pub fn set_my_tagname_caller(&mut self, name: &str) {
        if let Some(idx) = self.my_tagname_index {
            let _ = self.install_virtual(
                idx,
                Box::new(crate::systags::MyTagName::new(name, MAX_TAG_NAME + 1)),
            );
        }
    }

    // ------------------------------------------------------------------
    // Name index
    // ------------------------------------------------------------------

    fn find_index(&self, name: &str) -> Result<u32> {
        self.name_index
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .map(|pos| self.name_index[pos].1)
            .map_err(|_| Error::NotFound)
    }

    fn insert_name(&mut self, name: &str, index: u32) {
        let pos = self
            .name_index
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .unwrap_or_else(|p| p);
        self.name_index.insert(pos, (name.to_string(), index));
    }

    fn remove_name(&mut self, name: &str) {
        if let Ok(pos) = self
            .name_index
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
        {
            self.name_index.remove(pos);
        }
    }

    pub fn tag_count(&self) -> u32 {
        self.name_index.len() as u32
    }

    pub fn db_size(&self) -> u32 {
        self.tags.len() as u32
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn tag_get_by_name(&self, name: &str) -> Result<&Tag> {
        let idx = self.find_index(name)?;
        Ok(&self.tags[idx as usize])
    }

    pub fn tag_get_by_index(&self, index: u32) -> Result<&Tag> {
        let tag = self.tags.get(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        Ok(tag)
    }

    // ------------------------------------------------------------------
    // tag_add / tag_del
    // ------------------------------------------------------------------

    /// Adds a tag, or grows an existing one in place when `name` already
    /// exists, the type matches, and the new count is larger.
    pub fn tag_add(
        &mut self,
        owner_fd: Option<ModuleId>,
        name: &str,
        tag_type: TagType,
        count: u32,
        attr: u16,
    ) -> Result<u32> {
        if name.is_empty()
            || name.len() > MAX_TAG_NAME
            || !types::is_valid_identifier(name)
            || count == 0
        {
            return Err(Error::Arg);
        }

        if let Ok(existing) = self.find_index(name) {
            return self.grow_tag(existing, owner_fd, tag_type, count);
        }

        let byte_size = self.types.tag_size(tag_type, count)?;
        let backing = if types::is_queue(tag_type) {
            Backing::Queue(Queue::new(byte_size as usize))
        } else {
            Backing::Flat(vec![0u8; byte_size as usize])
        };

        let index = self.tags.len() as u32;
        let owned = attr & ATTR_OWNED != 0;
        self.tags.push(Tag {
            index,
            name: name.to_string(),
            tag_type,
            count,
            attr,
            backing,
            owner_fd: if owned { owner_fd } else { None },
            events: Vec::new(),
            mappings: Vec::new(),
            override_mask: None,
            override_data: None,
            next_event_id: 1,
            next_map_id: 1,
            special: None,
            deleted: false,
        });
        self.insert_name(name, index);
        if types::is_custom(tag_type) {
            self.types.inc_refcount(tag_type);
        }

        if attr & ATTR_RETAIN != 0 {
            if types::is_custom(tag_type) && self.retained_types.insert(tag_type) {
                if let Some(cdt) = self.types.get(tag_type) {
                    let spec = cdt.serialize(&self.types);
                    self.retention.record_type(&spec)?;
                }
            }
            self.retention.record_tag(&RetainedTag {
                name: name.to_string(),
                tag_type,
                count,
                attr,
                data: vec![0u8; byte_size as usize],
            })?;
        }

        self.publish_tag_added(index, tag_type, count, attr, name);
        Ok(index)
    }

    fn grow_tag(
        &mut self,
        index: u32,
        owner_fd: Option<ModuleId>,
        tag_type: TagType,
        count: u32,
    ) -> Result<u32> {
        let tag = &self.tags[index as usize];
        if tag.tag_type != tag_type {
            return Err(Error::Duplicate);
        }
        if let Some(owner) = tag.owner_fd {
            if Some(owner) != owner_fd {
                return Err(Error::Duplicate);
            }
        }
        if count <= tag.count {
            return Err(Error::Duplicate);
        }
        let new_size = self.types.tag_size(tag_type, count)?;
        let tag = &mut self.tags[index as usize];
        match &mut tag.backing {
            Backing::Flat(data) => data.resize(new_size as usize, 0),
            Backing::Queue(_) => return Err(Error::Illegal),
            Backing::Virtual(_) => return Err(Error::Illegal),
        }
        tag.count = count;
        let (tag_type, attr, name) = (tag.tag_type, tag.attr, tag.name.clone());
        self.publish_tag_added(index, tag_type, count, attr, &name);
        Ok(index)
    }

    fn publish_tag_added(&mut self, index: u32, tag_type: TagType, count: u32, attr: u16, name: &str) {
        if let Some(sys_idx) = self.tag_added_index {
            if index != sys_idx {
                let _ = self.tag_write_system(sys_idx, 0, &(index as i32).to_ne_bytes());
            }
        }
        log::info!(
            "tag_added: index={index} type={tag_type:#x} count={count} attr={attr:#x} name={name}"
        );
    }

    /// Frees a tag's data and override buffers, removes it from the name
    /// index, decrements its CDT refcount, and tears down every event and
    /// mapping attached to it. The index itself is never reused.
    pub fn tag_del(&mut self, index: u32) -> Result<u32> {
        let tag = self.tags.get(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        let (name, tag_type, attr) = (tag.name.clone(), tag.tag_type, tag.attr);

        self.remove_name(&name);
        if types::is_custom(tag_type) {
            self.types.dec_refcount(tag_type);
        }
        if attr & ATTR_RETAIN != 0 {
            let _ = self.retention.remove_tag(&name);
        }

        let tag = &mut self.tags[index as usize];
        tag.events.clear();
        tag.mappings.clear();
        tag.override_mask = None;
        tag.override_data = None;
        tag.deleted = true;
        tag.backing = Backing::Flat(Vec::new());

        if let Some(sys_idx) = self.tag_deleted_index {
            let _ = self.tag_write_system(sys_idx, 0, &(index as i32).to_ne_bytes());
        }
        Ok(index)
    }

    // ------------------------------------------------------------------
    // tag_read / tag_write / tag_mask_write
    // ------------------------------------------------------------------

    pub fn tag_read(&mut self, fd: Option<ModuleId>, index: u32, offset: u32, size: u32) -> Result<Vec<u8>> {
        let _ = fd;
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }

        if let Some(special) = tag.special.as_mut() {
            if let Ok(bytes) = special.read(offset, size) {
                return Ok(bytes);
            }
        }

        match &mut tag.backing {
            Backing::Virtual(io) => io.read(offset, size),
            Backing::Queue(q) => {
                if offset != 0 || size as usize != q.element_size() {
                    return Err(Error::Illegal);
                }
                q.dequeue().ok_or(Error::Empty)
            }
            Backing::Flat(data) => {
                let start = offset as usize;
                let end = start + size as usize;
                if end > data.len() {
                    return Err(Error::TooBig);
                }
                let mut out = data[start..end].to_vec();
                if tag.attr & ATTR_OVR_SET != 0 {
                    if let (Some(mask), Some(odata)) = (&tag.override_mask, &tag.override_data) {
                        for i in 0..out.len() {
                            let m = mask.get(start + i).copied().unwrap_or(0);
                            let o = odata.get(start + i).copied().unwrap_or(0);
                            out[i] = (o & m) | (out[i] & !m);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Writes `buf` at `offset`, then cascades through mappings and fires
    /// events (own events first, then each cascaded write's events), and
    /// persists to retention if `RETAIN` is set. Returns every notification
    /// produced, in firing order.
    pub fn tag_write(
        &mut self,
        fd: Option<ModuleId>,
        index: u32,
        offset: u32,
        buf: &[u8],
    ) -> Result<Vec<Notification>> {
        self.tag_write_hop(fd, index, offset, buf, 0, false)
    }

    /// Writes bypassing the READONLY/OWNED permission check. Used for
    /// system-tag publication and retention restore, neither of which is a
    /// client request.
    pub(crate) fn tag_write_system(&mut self, index: u32, offset: u32, buf: &[u8]) -> Result<Vec<Notification>> {
        self.tag_write_hop(None, index, offset, buf, 0, true)
    }

    fn tag_write_hop(
        &mut self,
        fd: Option<ModuleId>,
        index: u32,
        offset: u32,
        buf: &[u8],
        hop: u32,
        bypass_perm: bool,
    ) -> Result<Vec<Notification>> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        // READONLY and OWNED both gate writes to the tag's owning module;
        // a tag with neither flag may be written by anyone.
        if !bypass_perm && tag.attr & (ATTR_READONLY | ATTR_OWNED) != 0 {
            let is_owner = tag.owner_fd.is_some() && tag.owner_fd == fd;
            if !is_owner {
                return Err(Error::ReadOnly);
            }
        }

        if let Some(special) = tag.special.as_mut() {
            special.write(offset, buf)?;
        }

        match &mut tag.backing {
            Backing::Virtual(io) => {
                io.write(offset, buf)?;
            }
            Backing::Queue(q) => {
                if offset != 0 || buf.len() != q.element_size() {
                    return Err(Error::Illegal);
                }
                q.enqueue(buf);
            }
            Backing::Flat(data) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > data.len() {
                    return Err(Error::TooBig);
                }
                data[start..end].copy_from_slice(buf);
            }
        }

        let mut notifications = self.event_check(index, offset, buf.len() as u32);

        if hop < MAX_MAP_HOPS {
            let mappings = self.tags[index as usize].mappings.clone();
            for m in mappings {
                let (src_start, src_end) = (m.source.byte, m.source.byte + m.source.size);
                let write_start = offset;
                let write_end = offset + buf.len() as u32;
                if src_end <= write_start || write_end <= src_start {
                    continue;
                }
                let overlap_start = src_start.max(write_start);
                let overlap_end = src_end.min(write_end);
                let src_bytes = self.tag_read(
                    None,
                    index,
                    overlap_start,
                    overlap_end - overlap_start,
                )?;
                let dest_offset = m.dest.byte + (overlap_start - src_start);
                match self.tag_write_hop(None, m.dest.index, dest_offset, &src_bytes, hop + 1, true) {
                    Ok(mut cascaded) => notifications.append(&mut cascaded),
                    Err(Error::Deleted) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        } else {
            log::warn!(
                "mapping traversal from tag {index} aborted: exceeded {MAX_MAP_HOPS} hops"
            );
        }

        let tag = &self.tags[index as usize];
        if tag.attr & ATTR_RETAIN != 0 {
            let name = tag.name.clone();
            self.retention.persist_write(&name, offset, buf)?;
        }

        Ok(notifications)
    }

    pub fn tag_mask_write(
        &mut self,
        fd: Option<ModuleId>,
        index: u32,
        offset: u32,
        data: &[u8],
        mask: &[u8],
    ) -> Result<Vec<Notification>> {
        if data.len() != mask.len() {
            return Err(Error::Arg);
        }
        let tag = self.tags.get(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        if matches!(tag.backing, Backing::Virtual(_)) {
            return Err(Error::Illegal);
        }
        let current = self.tag_read(fd, index, offset, data.len() as u32)?;
        let merged: Vec<u8> = current
            .iter()
            .zip(data.iter())
            .zip(mask.iter())
            .map(|((&old, &new), &m)| (new & m) | (old & !m))
            .collect();
        self.tag_write(fd, index, offset, &merged)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn event_check(&mut self, index: u32, offset: u32, size: u32) -> Vec<Notification> {
        let Some(tag) = self.tags.get_mut(index as usize) else {
            return Vec::new();
        };
        let data_snapshot = match &tag.backing {
            Backing::Flat(d) => d.clone(),
            _ => return Vec::new(),
        };
        let mut out = Vec::new();
        for ev in tag.events.iter_mut() {
            if let Some(value) = ev.check(offset, size, &data_snapshot) {
                out.push(Notification {
                    module: ev.module,
                    tag_index: index,
                    event_id: ev.id,
                    value,
                });
            }
        }
        out
    }

    pub fn event_add(
        &mut self,
        tag_index: u32,
        module: ModuleId,
        kind: EventKind,
        byte: u32,
        bit: u8,
        count: u32,
        size: u32,
        datatype: TagType,
        options: EventOptions,
    ) -> Result<u32> {
        let tag = self.tags.get_mut(tag_index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        let initial = match &tag.backing {
            Backing::Flat(d) => {
                let end = (byte + size) as usize;
                if end > d.len() {
                    return Err(Error::TooBig);
                }
                d[byte as usize..end].to_vec()
            }
            _ => vec![0; size as usize],
        };
        let id = tag.next_event_id;
        tag.next_event_id += 1;
        tag.attr |= ATTR_EVENT;
        tag.events.push(Event::new(
            id, module, kind, byte, bit, count, size, datatype, options, &initial,
        ));
        Ok(id)
    }

    pub fn event_del(&mut self, tag_index: u32, event_id: u32, module: ModuleId) -> Result<()> {
        let tag = self.tags.get_mut(tag_index as usize).ok_or(Error::Arg)?;
        let before = tag.events.len();
        tag.events
            .retain(|e| !(e.id == event_id && e.module == module));
        if tag.events.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Looks up a single event by tag, id, and owning module.
    pub fn event_get(&self, tag_index: u32, event_id: u32, module: ModuleId) -> Result<&Event> {
        let tag = self.tags.get(tag_index as usize).ok_or(Error::Arg)?;
        tag.events
            .iter()
            .find(|e| e.id == event_id && e.module == module)
            .ok_or(Error::NotFound)
    }

    pub fn event_opt(
        &mut self,
        tag_index: u32,
        event_id: u32,
        module: ModuleId,
        options: EventOptions,
    ) -> Result<()> {
        let tag = self.tags.get_mut(tag_index as usize).ok_or(Error::Arg)?;
        let ev = tag
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.module == module)
            .ok_or(Error::NotFound)?;
        ev.options = options;
        Ok(())
    }

    /// Removes every event owned by `module`, wherever it is attached.
    /// Called when a module disconnects.
    pub fn remove_module_events(&mut self, module: ModuleId) {
        for tag in self.tags.iter_mut() {
            tag.events.retain(|e| e.module != module);
        }
    }

    // ------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------

    pub fn map_add(
        &mut self,
        source: crate::handle::TagHandle,
        dest: crate::handle::TagHandle,
    ) -> Result<u32> {
        if dest.size < source.size {
            return Err(Error::TooBig);
        }
        let src_tag = self.tags.get_mut(source.index as usize).ok_or(Error::Arg)?;
        if src_tag.deleted {
            return Err(Error::Deleted);
        }
        let id = src_tag.next_map_id;
        src_tag.next_map_id += 1;
        src_tag.attr |= ATTR_MAPPING;
        src_tag.mappings.push(Mapping { id, source, dest });
        Ok(id)
    }

    pub fn map_del(&mut self, source_index: u32, map_id: u32) -> Result<()> {
        let tag = self.tags.get_mut(source_index as usize).ok_or(Error::Arg)?;
        let before = tag.mappings.len();
        tag.mappings.retain(|m| m.id != map_id);
        if tag.mappings.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn map_get(&self, source_index: u32, map_id: u32) -> Result<Mapping> {
        let tag = self.tags.get(source_index as usize).ok_or(Error::Arg)?;
        tag.mappings
            .iter()
            .find(|m| m.id == map_id)
            .copied()
            .ok_or(Error::NotFound)
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    pub fn override_add(&mut self, index: u32, offset: u32, data: &[u8], mask: &[u8]) -> Result<()> {
        if data.len() != mask.len() {
            return Err(Error::Arg);
        }
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        let size = tag.byte_size() as usize;
        let end = offset as usize + data.len();
        if end > size {
            return Err(Error::TooBig);
        }
        let omask = tag.override_mask.get_or_insert_with(|| vec![0; size]);
        if omask.len() < size {
            omask.resize(size, 0);
        }
        let odata = tag.override_data.get_or_insert_with(|| vec![0; size]);
        if odata.len() < size {
            odata.resize(size, 0);
        }
        for i in 0..data.len() {
            let m = mask[i];
            odata[offset as usize + i] = (data[i] & m) | (odata[offset as usize + i] & !m);
            omask[offset as usize + i] |= m;
        }
        tag.attr |= ATTR_OVERRIDE;
        Ok(())
    }

    pub fn override_del(&mut self, index: u32, offset: u32, mask: &[u8]) -> Result<()> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if let Some(omask) = tag.override_mask.as_mut() {
            for (i, &m) in mask.iter().enumerate() {
                if let Some(slot) = omask.get_mut(offset as usize + i) {
                    *slot &= !m;
                }
            }
            if omask.iter().all(|&b| b == 0) {
                tag.override_mask = None;
                tag.override_data = None;
                tag.attr &= !(ATTR_OVERRIDE | ATTR_OVR_SET);
            }
        }
        Ok(())
    }

    pub fn override_set(&mut self, index: u32, flag: bool) -> Result<()> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if tag.override_mask.is_none() {
            return Err(Error::Illegal);
        }
        if flag {
            tag.attr |= ATTR_OVR_SET;
        } else {
            tag.attr &= !ATTR_OVR_SET;
        }
        Ok(())
    }

    pub fn override_get(&self, index: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        let tag = self.tags.get(index as usize).ok_or(Error::Arg)?;
        Ok((
            tag.override_data.clone().unwrap_or_default(),
            tag.override_mask.clone().unwrap_or_default(),
        ))
    }

    // ------------------------------------------------------------------
    // Atomic ops support (raw byte access for atomic.rs)
    // ------------------------------------------------------------------

    pub fn tag_raw_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        if tag.deleted {
            return Err(Error::Deleted);
        }
        match &mut tag.backing {
            Backing::Flat(d) => Ok(d.as_mut_slice()),
            _ => Err(Error::BadType),
        }
    }

    pub fn tag_type_of(&self, index: u32) -> Result<TagType> {
        Ok(self.tags.get(index as usize).ok_or(Error::Arg)?.tag_type)
    }

    pub fn install_virtual(&mut self, index: u32, io: Box<dyn TagIo>) -> Result<()> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        tag.backing = Backing::Virtual(io);
        tag.attr |= ATTR_VIRTUAL;
        Ok(())
    }

    pub fn install_special(&mut self, index: u32, hook: Box<dyn TagIo>) -> Result<()> {
        let tag = self.tags.get_mut(index as usize).ok_or(Error::Arg)?;
        tag.special = Some(hook);
        tag.attr |= ATTR_SPECIAL;
        Ok(())
    }

    pub fn retention_load(&mut self) -> Result<()> {
        let types = self.retention.load_types()?;
        for t in types {
            self.types.create(&t.spec)?;
        }
        let tags = self.retention.load_tags()?;
        for t in tags {
            let idx = self.tag_add(None, &t.name, t.tag_type, t.count, t.attr)?;
            let len = t.data.len();
            if len > 0 {
                let _ = self.tag_write_system(idx, 0, &t.data);
            }
        }
        Ok(())
    }
}

/// Per-tag map from name to index, exposed for diagnostics and tests.
pub fn snapshot_names(server: &TagServer) -> HashMap<String, u32> {
    server
        .name_index
        .iter()
        .map(|(n, i)| (n.clone(), *i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DINT;

    #[test]
    fn create_read_write_base_tag() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "t1", DINT, 4, 0).unwrap();
        s.tag_write(None, idx, 4, &[0x12, 0x34, 0x56, 0x78]).unwrap();
        let bytes = s.tag_read(None, idx, 0, 16).unwrap();
        assert_eq!(&bytes[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[0; 8]);
    }

    #[test]
    fn deleted_index_returns_deleted_error() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "t2", DINT, 1, 0).unwrap();
        s.tag_del(idx).unwrap();
        assert_eq!(s.tag_read(None, idx, 0, 4).unwrap_err(), Error::Deleted);
        assert_eq!(
            s.tag_get_by_name("t2").unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn grow_requires_matching_type_and_larger_count() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "t3", DINT, 2, 0).unwrap();
        assert_eq!(s.tag_add(None, "t3", DINT, 2, 0).unwrap_err(), Error::Duplicate);
        let idx2 = s.tag_add(None, "t3", DINT, 5, 0).unwrap();
        assert_eq!(idx, idx2);
        assert_eq!(s.tag_get_by_index(idx).unwrap().count, 5);
        assert_eq!(
            s.tag_add(None, "t3", crate::types::INT, 6, 0).unwrap_err(),
            Error::Duplicate
        );
    }

    #[test]
    fn masked_write_law() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "t4", DINT, 1, 0).unwrap();
        s.tag_write(None, idx, 0, &[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        s.tag_mask_write(None, idx, 0, &[0xAA, 0x00, 0x00, 0x00], &[0x0F, 0xFF, 0x00, 0x00])
            .unwrap();
        let out = s.tag_read(None, idx, 0, 4).unwrap();
        assert_eq!(out[0], (0xAA & 0x0F) | (0xFF & !0x0F));
        assert_eq!(out[1], 0x00);
        assert_eq!(out[2], 0xFF);
    }

    #[test]
    fn override_overlay_law() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "x", crate::types::INT, 1, 0).unwrap();
        s.tag_write(None, idx, 0, &0x1234u16.to_ne_bytes()).unwrap();
        s.override_add(idx, 0, &0x5678u16.to_ne_bytes(), &0xFF00u16.to_ne_bytes())
            .unwrap();
        s.override_set(idx, true).unwrap();
        let v = u16::from_ne_bytes(s.tag_read(None, idx, 0, 2).unwrap().try_into().unwrap());
        let expected = (0x5678u16 & 0xFF00) | (0x1234u16 & !0xFF00u16);
        assert_eq!(v, expected);
        s.override_set(idx, false).unwrap();
        let v = u16::from_ne_bytes(s.tag_read(None, idx, 0, 2).unwrap().try_into().unwrap());
        assert_eq!(v, 0x1234);
    }

    #[test]
    fn mapping_propagates_bytes() {
        let mut s = TagServer::new(0);
        let src = s.tag_add(None, "src", crate::types::INT, 1, 0).unwrap();
        let dst = s.tag_add(None, "dst", crate::types::INT, 1, 0).unwrap();
        s.map_add(
            crate::handle::TagHandle { index: src, byte: 0, bit: 0, count: 1, size: 2, type_: crate::types::INT },
            crate::handle::TagHandle { index: dst, byte: 0, bit: 0, count: 1, size: 2, type_: crate::types::INT },
        )
        .unwrap();
        s.tag_write(None, src, 0, &0x00AAu16.to_ne_bytes()).unwrap();
        let out = s.tag_read(None, dst, 0, 2).unwrap();
        assert_eq!(out, 0x00AAu16.to_ne_bytes());
    }

    #[test]
    fn change_event_fires_once_on_first_distinct_write() {
        let mut s = TagServer::new(0);
        let idx = s.tag_add(None, "t", DINT, 1, 0).unwrap();
        s.event_add(idx, 9, EventKind::Change, 0, 0, 1, 4, DINT, EventOptions::default())
            .unwrap();
        let n1 = s.tag_write(None, idx, 0, &5i32.to_ne_bytes()).unwrap();
        let n2 = s.tag_write(None, idx, 0, &5i32.to_ne_bytes()).unwrap();
        assert_eq!(n1.len(), 1);
        assert_eq!(n2.len(), 0);
    }
}
