// SPDX-License-Identifier: MIT

//! Command routing: decodes a request payload, drives the tag store and
//! engines, and encodes the response payload. One frame in, one frame out;
//! the transport (see `opendax-server`) owns sockets and framing.

use crate::atomic::{self, AtomicOp};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventOptions, ModuleId, Notification};
use crate::groups::{self, GroupTable};
use crate::handle::TagHandle;
use crate::protocol::{self, Command, Request};
use crate::store::TagServer;

/// A registered client connection: a name and its own group namespace.
/// Events and mappings live on tags, not here, since they must survive a
/// module disconnecting from a different fd than it registered on.
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub timeout: u32,
    /// Index of this module's reserved `_m<name><seq>` status tag, created
    /// during registration.
    pub status_index: u32,
    pub groups: GroupTable,
}

/// Live modules, keyed by id. Ids are never reused, matching the tag and
/// type tables' tombstone-don't-reuse discipline.
#[derive(Default)]
pub struct ModuleTable {
    modules: Vec<Option<Module>>,
    next_id: ModuleId,
    next_seq: u32,
}

impl ModuleTable {
    /// Registers a module with a placeholder `status_index`; the caller
    /// fills it in with [`ModuleTable::get_mut`] once the status tag exists,
    /// since creating that tag needs the id this call hands back.
    pub fn register(&mut self, name: String, timeout: u32) -> ModuleId {
        let id = self.next_id;
        self.next_id += 1;
        self.modules.push(Some(Module {
            id,
            name,
            timeout,
            status_index: 0,
            groups: GroupTable::default(),
        }));
        id
    }

    /// Next module sequence number, used to build a unique `_m<name><seq>`
    /// status tag name. Three digits below 1000, five digits beyond.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn unregister(&mut self, id: ModuleId) {
        if let Some(slot) = self
            .modules
            .iter_mut()
            .find(|m| m.as_ref().map(|m| m.id) == Some(id))
        {
            *slot = None;
        }
    }

    pub fn get(&self, id: ModuleId) -> Result<&Module> {
        self.modules
            .iter()
            .find_map(|m| m.as_ref().filter(|m| m.id == id))
            .ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Result<&mut Module> {
        self.modules
            .iter_mut()
            .find_map(|m| m.as_mut().filter(|m| m.id == id))
            .ok_or(Error::NotFound)
    }
}

/// Owns the tag store and the module table; the single point every decoded
/// request passes through.
pub struct Dispatcher {
    pub server: TagServer,
    pub modules: ModuleTable,
    /// Notifications produced by the request just handled, queued here so
    /// the transport can push each one to its owning module's connection
    /// rather than only to whichever connection issued the write.
    pending: Vec<Notification>,
}

impl Dispatcher {
    pub fn new(server: TagServer) -> Self {
        Dispatcher {
            server,
            modules: ModuleTable::default(),
            pending: Vec::new(),
        }
    }

    /// Runs one request end to end and returns the encoded response frame
    /// together with every notification it fired, for the transport to
    /// push onward to each notification's owning module.
    pub fn handle(&mut self, from: Option<ModuleId>, req: &Request) -> (Vec<u8>, Vec<Notification>) {
        self.pending.clear();
        let frame = match self.dispatch(from, req) {
            Ok(payload) => protocol::encode_response(req.command, &payload),
            Err(e) => protocol::encode_error(req.command, &e),
        };
        (frame, std::mem::take(&mut self.pending))
    }

    /// Cleans up everything owned by a module whose connection just closed:
    /// its events, so no notification is ever sent to a dead socket.
    pub fn on_disconnect(&mut self, module: ModuleId) {
        self.server.remove_module_events(module);
        self.modules.unregister(module);
    }

    fn dispatch(&mut self, from: Option<ModuleId>, req: &Request) -> Result<Vec<u8>> {
        let p = &req.payload;
        match req.command {
            Command::ModReg => self.mod_reg(p),
            Command::ModSet => self.mod_set(p),
            Command::ModGet => self.mod_get(p),
            Command::TagAdd => self.tag_add(from, p),
            Command::TagDel => self.tag_del(p),
            Command::TagGet => self.tag_get(p),
            Command::TagList => self.tag_list(),
            Command::TagRead => self.tag_read(from, p),
            Command::TagWrite => self.tag_write(from, p),
            Command::TagMwrite => self.tag_mwrite(from, p),
            Command::EvntAdd => self.evnt_add(from.ok_or(Error::Arg)?, p),
            Command::EvntDel => self.evnt_del(from.ok_or(Error::Arg)?, p),
            Command::EvntGet => self.evnt_get(from.ok_or(Error::Arg)?, p),
            Command::EvntOpt => self.evnt_opt(from.ok_or(Error::Arg)?, p),
            Command::CdtCreate => self.cdt_create(p),
            Command::CdtGet => self.cdt_get(p),
            Command::MapAdd => self.map_add(p),
            Command::MapDel => self.map_del(p),
            Command::MapGet => self.map_get(p),
            Command::GrpAdd => self.grp_add(from.ok_or(Error::Arg)?, p),
            Command::GrpDel => self.grp_del(from.ok_or(Error::Arg)?, p),
            Command::GrpRead => self.grp_read(from.ok_or(Error::Arg)?, p),
            Command::GrpWrite => self.grp_write(from.ok_or(Error::Arg)?, p),
            Command::GrpMwrite => self.grp_mwrite(from.ok_or(Error::Arg)?, p),
            Command::AtomicOp => self.atomic_op(p),
            Command::AddOvrd => self.add_ovrd(p),
            Command::DelOvrd => self.del_ovrd(p),
            Command::GetOvrd => self.get_ovrd(p),
            Command::SetOvrd => self.set_ovrd(p),
        }
    }

    // ------------------------------------------------------------------
    // Module registration
    // ------------------------------------------------------------------

    /// A module registers on two independent channels, distinguished by the
    /// second `u32` field: `REGISTER_SYNC` carries `timeout, flags, name`
    /// and creates the module, `REGISTER_EVENT` carries `module_id, flags`
    /// and binds an already-registered module's async notification channel.
    fn mod_reg(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let first = r.u32()?;
        let flags = r.u32()?;
        if flags & protocol::REGISTER_EVENT != 0 {
            self.modules.get(first)?;
            return Ok(Vec::new());
        }

        let timeout = first;
        let name = r.string()?;
        let id = self.modules.register(name.clone(), timeout);
        let status_index = self.create_module_status_tag(id, &name)?;
        self.modules.get_mut(id)?.status_index = status_index;

        let mut out = Writer::new();
        out.u32(id);
        out.u16(protocol::REG_TEST_INT);
        out.u32(protocol::REG_TEST_DINT);
        out.u64(protocol::REG_TEST_LINT);
        out.f32(protocol::REG_TEST_REAL);
        out.f64(protocol::REG_TEST_LREAL);
        Ok(out.into_vec())
    }

    /// Creates the module's reserved `_m<name><seq>` status tag (the
    /// `_module` CDT, created once and reused after) and marks it running.
    /// Field offsets below are fixed by that CDT's member order:
    /// `starttime:TIME(4) id:DINT(4) running:BOOL faulted:BOOL status:CHAR(64) stop:BOOL run:BOOL reload:BOOL kill:BOOL`
    /// so the two leading `BOOL`s pack into the byte at offset 8.
    fn create_module_status_tag(&mut self, id: ModuleId, name: &str) -> Result<u32> {
        const MODULE_CDT_SPEC: &str = "_module:starttime,TIME,1:id,DINT,1:running,BOOL,1:faulted,BOOL,1:status,CHAR,64:stop,BOOL,1:run,BOOL,1:reload,BOOL,1:kill,BOOL,1";
        const RUNNING_BYTE: u32 = 8;
        const RUNNING_BIT: u8 = 0;

        let module_type = match self.server.types.get_type("_module") {
            Some(t) => t,
            None => self.server.types.create(MODULE_CDT_SPEC)?,
        };

        let seq = self.modules.next_seq();
        let seq_str = if seq < 1000 { format!("{seq:03}") } else { format!("{seq:05}") };
        let budget = crate::store::MAX_TAG_NAME.saturating_sub(2 + seq_str.len());
        let truncated: String = name.chars().take(budget).collect();
        let tagname = format!("_m{truncated}{seq_str}");

        let index = self
            .server
            .tag_add(None, &tagname, module_type, 1, crate::store::ATTR_READONLY)?;

        let starttime = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        self.server.tag_write_system(index, 0, &starttime.to_ne_bytes())?;
        self.server.tag_write_system(index, 4, &id.to_ne_bytes())?;
        if let Ok(byte) = self.server.tag_raw_mut(index) {
            byte[RUNNING_BYTE as usize] |= 1 << RUNNING_BIT;
        }

        if let Ok(lastmodule) = self.server.tag_get_by_name("_lastmodule") {
            let lastmodule_idx = lastmodule.index;
            let mut bytes = tagname.into_bytes();
            bytes.resize(crate::store::MAX_TAG_NAME, 0);
            self.server.tag_write_system(lastmodule_idx, 0, &bytes)?;
        }

        Ok(index)
    }

    fn mod_set(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        let _flags = r.u32()?;
        self.modules.get(id)?;
        Ok(Vec::new())
    }

    fn mod_get(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        let module = self.modules.get(id)?;
        let mut out = Writer::new();
        out.string(&module.name);
        Ok(out.into_vec())
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    fn tag_add(&mut self, from: Option<ModuleId>, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let name = r.string()?;
        let tag_type = r.u32()?;
        let count = r.u32()?;
        let attr = r.u16()?;
        let index = self.server.tag_add(from, &name, tag_type, count, attr)?;
        let mut out = Writer::new();
        out.u32(index);
        Ok(out.into_vec())
    }

    fn tag_del(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        self.server.tag_del(index)?;
        Ok(Vec::new())
    }

    fn tag_get(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let tag = if r.u8()? == 0 {
            let index = r.u32()?;
            self.server.tag_get_by_index(index)?
        } else {
            let name = r.string()?;
            self.server.tag_get_by_name(&name)?
        };
        let mut out = Writer::new();
        out.u32(tag.index);
        out.u32(tag.tag_type);
        out.u32(tag.count);
        out.u16(tag.attr);
        out.string(&tag.name);
        Ok(out.into_vec())
    }

    fn tag_list(&mut self) -> Result<Vec<u8>> {
        let names = crate::store::snapshot_names(&self.server);
        let mut entries: Vec<(u32, String)> = names.into_iter().map(|(n, i)| (i, n)).collect();
        entries.sort_by_key(|(i, _)| *i);

        let budget = protocol::MAX_FRAME_SIZE - protocol::FRAME_HEADER_SIZE;
        let mut out = Writer::new();
        out.u32(entries.len() as u32);
        let mut returned = 0u32;
        let mut body = Writer::new();
        for (index, name) in &entries {
            let mut entry = Writer::new();
            entry.u32(*index);
            entry.string(name);
            if out.len() + 4 + body.len() + entry.len() > budget {
                log::warn!("tag_list truncated at {returned} of {} entries: frame budget exhausted", entries.len());
                break;
            }
            body.bytes(&entry.into_vec());
            returned += 1;
        }
        out.u32(returned);
        out.bytes(&body.into_vec());
        Ok(out.into_vec())
    }

    fn tag_read(&mut self, from: Option<ModuleId>, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let offset = r.u32()?;
        let size = r.u32()?;
        // `_my_tagname` reports whichever module is reading it, so the
        // caller's name has to be threaded in just ahead of the read.
        if let Some(id) = from {
            if let Ok(module) = self.modules.get(id) {
                self.server.set_my_tagname_caller(&module.name);
            }
        }
        self.server.tag_read(from, index, offset, size)
    }

    fn tag_write(&mut self, from: Option<ModuleId>, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let offset = r.u32()?;
        let data = r.rest();
        let notifications = self.server.tag_write(from, index, offset, data)?;
        self.pending.extend(notifications);
        Ok(Vec::new())
    }

    fn tag_mwrite(&mut self, from: Option<ModuleId>, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let offset = r.u32()?;
        let (data, mask) = r.halves()?;
        let notifications = self.server.tag_mask_write(from, index, offset, data, mask)?;
        self.pending.extend(notifications);
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn evnt_add(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let tag_index = r.u32()?;
        let kind = decode_event_kind(&mut r)?;
        let byte = r.u32()?;
        let bit = r.u8()?;
        let count = r.u32()?;
        let size = r.u32()?;
        let datatype = r.u32()?;
        let send_data = r.u8()? != 0;
        let id = self.server.event_add(
            tag_index,
            module,
            kind,
            byte,
            bit,
            count,
            size,
            datatype,
            EventOptions { send_data },
        )?;
        let mut out = Writer::new();
        out.u32(id);
        Ok(out.into_vec())
    }

    fn evnt_del(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let tag_index = r.u32()?;
        let event_id = r.u32()?;
        self.server.event_del(tag_index, event_id, module)?;
        Ok(Vec::new())
    }

    fn evnt_get(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let tag_index = r.u32()?;
        let event_id = r.u32()?;
        let ev = self.server.event_get(tag_index, event_id, module)?;
        let mut out = Writer::new();
        out.u32(ev.byte);
        out.u8(ev.bit);
        out.u32(ev.count);
        out.u32(ev.size);
        out.u32(ev.datatype);
        out.u8(ev.options.send_data as u8);
        Ok(out.into_vec())
    }

    fn evnt_opt(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let tag_index = r.u32()?;
        let event_id = r.u32()?;
        let send_data = r.u8()? != 0;
        self.server
            .event_opt(tag_index, event_id, module, EventOptions { send_data })?;
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------
    // Compound types
    // ------------------------------------------------------------------

    fn cdt_create(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let spec = r.string()?;
        let t = self.server.types.create(&spec)?;
        let mut out = Writer::new();
        out.u32(t);
        Ok(out.into_vec())
    }

    fn cdt_get(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let t = if r.u8()? == 0 {
            r.u32()?
        } else {
            let name = r.string()?;
            self.server.types.get_type(&name).ok_or(Error::NotFound)?
        };
        let cdt = self.server.types.get(t).ok_or(Error::NotFound)?;
        let spec = cdt.serialize(&self.server.types);
        let mut out = Writer::new();
        out.u32(t);
        out.string(&spec);
        Ok(out.into_vec())
    }

    // ------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------

    fn map_add(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let source = r.handle()?;
        let dest = r.handle()?;
        let id = self.server.map_add(source, dest)?;
        let mut out = Writer::new();
        out.u32(id);
        Ok(out.into_vec())
    }

    fn map_del(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let source_index = r.u32()?;
        let map_id = r.u32()?;
        self.server.map_del(source_index, map_id)?;
        Ok(Vec::new())
    }

    fn map_get(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let source_index = r.u32()?;
        let map_id = r.u32()?;
        let mapping = self.server.map_get(source_index, map_id)?;
        let mut out = Writer::new();
        out.handle(&mapping.source);
        out.handle(&mapping.dest);
        Ok(out.into_vec())
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    fn grp_add(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let n = r.u8()? as usize;
        let mut members = Vec::with_capacity(n);
        for _ in 0..n {
            members.push(r.handle()?);
        }
        let id = self.modules.get_mut(module)?.groups.add(members)?;
        let mut out = Writer::new();
        out.u32(id);
        Ok(out.into_vec())
    }

    fn grp_del(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        self.modules.get_mut(module)?.groups.del(id)?;
        Ok(Vec::new())
    }

    fn grp_read(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        let group = self.modules.get(module)?.groups.get(id)?.clone();
        groups::group_read(&mut self.server, &group)
    }

    fn grp_write(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        let data = r.rest();
        let group = self.modules.get(module)?.groups.get(id)?.clone();
        let notifications = groups::group_write(&mut self.server, &group, data)?;
        self.pending.extend(notifications);
        Ok(Vec::new())
    }

    fn grp_mwrite(&mut self, module: ModuleId, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let id = r.u32()?;
        let (data, mask) = r.halves()?;
        let group = self.modules.get(module)?.groups.get(id)?.clone();
        let notifications = groups::group_mask_write(&mut self.server, &group, data, mask)?;
        self.pending.extend(notifications);
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------
    // Atomic ops
    // ------------------------------------------------------------------

    fn atomic_op(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let handle = r.handle()?;
        let op = decode_atomic_op(r.u8()?)?;
        let payload = r.rest();
        let notifications = atomic::atomic_op(&mut self.server, handle, payload, op)?;
        self.pending.extend(notifications);
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    fn add_ovrd(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let offset = r.u32()?;
        let (data, mask) = r.halves()?;
        self.server.override_add(index, offset, data, mask)?;
        Ok(Vec::new())
    }

    fn del_ovrd(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let offset = r.u32()?;
        let mask = r.rest();
        self.server.override_del(index, offset, mask)?;
        Ok(Vec::new())
    }

    fn get_ovrd(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let (data, mask) = self.server.override_get(index)?;
        let mut out = Writer::new();
        out.u32(data.len() as u32);
        out.bytes(&data);
        out.bytes(&mask);
        Ok(out.into_vec())
    }

    fn set_ovrd(&mut self, p: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(p);
        let index = r.u32()?;
        let flag = r.u8()? != 0;
        self.server.override_set(index, flag)?;
        Ok(Vec::new())
    }
}

fn decode_event_kind(r: &mut Reader) -> Result<EventKind> {
    Ok(match r.u8()? {
        0 => EventKind::Write,
        1 => EventKind::Change,
        2 => EventKind::Set,
        3 => EventKind::Reset,
        4 => EventKind::Equal { payload: r.f64()? },
        5 => EventKind::Greater { payload: r.f64()? },
        6 => EventKind::Less { payload: r.f64()? },
        7 => EventKind::Deadband { payload: r.f64()? },
        _ => return Err(Error::Arg),
    })
}

fn decode_atomic_op(tag: u8) -> Result<AtomicOp> {
    Ok(match tag {
        0 => AtomicOp::Inc,
        1 => AtomicOp::Dec,
        2 => AtomicOp::Not,
        3 => AtomicOp::Or,
        4 => AtomicOp::And,
        5 => AtomicOp::Nor,
        6 => AtomicOp::Nand,
        7 => AtomicOp::Xor,
        8 => AtomicOp::Xnor,
        _ => return Err(Error::Arg),
    })
}

/// A cursor over a request payload. All multi-byte scalars are host byte
/// order, matching the framing module's payload convention.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Arg);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Arg)
    }

    fn handle(&mut self) -> Result<TagHandle> {
        TagHandle::decode(self.take(TagHandle::WIRE_SIZE)?)
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    /// Splits the remainder of the payload into two equal halves (data then
    /// mask), as used by every masked-write command.
    fn halves(&mut self) -> Result<(&'a [u8], &'a [u8])> {
        let remaining = self.buf.len() - self.pos;
        if remaining % 2 != 0 {
            return Err(Error::Arg);
        }
        let half = remaining / 2;
        let data = self.take(half)?;
        let mask = self.take(half)?;
        Ok((data, mask))
    }
}

/// Accumulates a response payload; mirrors `Reader`'s encoding.
#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer::default()
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn string(&mut self, v: &str) {
        self.u16(v.len() as u16);
        self.buf.extend_from_slice(v.as_bytes());
    }

    fn handle(&mut self, h: &TagHandle) {
        h.encode(&mut self.buf);
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DINT;

    fn roundtrip(d: &mut Dispatcher, from: Option<ModuleId>, cmd: Command, payload: Vec<u8>) -> Vec<u8> {
        let req = Request { command: cmd, payload };
        let (frame, _notifications) = d.handle(from, &req);
        let word = u32::from_be_bytes(frame[4..8].try_into().unwrap());
        assert_eq!(word & protocol::ERROR_FLAG, 0, "unexpected error frame");
        frame[protocol::FRAME_HEADER_SIZE..].to_vec()
    }

    #[test]
    fn register_then_add_and_write_a_tag() {
        let mut d = Dispatcher::new(TagServer::new(0));

        let mut reg_payload = Writer::new();
        reg_payload.u32(0); // timeout
        reg_payload.u32(protocol::REGISTER_SYNC);
        reg_payload.string("plc1");
        let reg_resp = roundtrip(&mut d, None, Command::ModReg, reg_payload.into_vec());
        let module_id = u32::from_ne_bytes(reg_resp[0..4].try_into().unwrap());

        let mut add_payload = Writer::new();
        add_payload.string("speed");
        add_payload.u32(DINT);
        add_payload.u32(1);
        add_payload.u16(0);
        let add_resp = roundtrip(&mut d, Some(module_id), Command::TagAdd, add_payload.into_vec());
        let index = u32::from_ne_bytes(add_resp[0..4].try_into().unwrap());

        let mut write_payload = Writer::new();
        write_payload.u32(index);
        write_payload.u32(0);
        write_payload.bytes(&42i32.to_ne_bytes());
        roundtrip(&mut d, Some(module_id), Command::TagWrite, write_payload.into_vec());

        let mut read_payload = Writer::new();
        read_payload.u32(index);
        read_payload.u32(0);
        read_payload.u32(4);
        let read_resp = roundtrip(&mut d, Some(module_id), Command::TagRead, read_payload.into_vec());
        assert_eq!(i32::from_ne_bytes(read_resp.try_into().unwrap()), 42);
    }

    #[test]
    fn mod_reg_creates_a_running_status_tag() {
        let mut d = Dispatcher::new(TagServer::new(0));

        let mut reg_payload = Writer::new();
        reg_payload.u32(5); // timeout
        reg_payload.u32(protocol::REGISTER_SYNC);
        reg_payload.string("plc1");
        let reg_resp = roundtrip(&mut d, None, Command::ModReg, reg_payload.into_vec());
        let module_id = u32::from_ne_bytes(reg_resp[0..4].try_into().unwrap());

        let module = d.modules.get(module_id).unwrap();
        assert_eq!(module.timeout, 5);
        let status = d.server.tag_get_by_index(module.status_index).unwrap();
        assert_eq!(status.name, "_mplc1000");

        let data = d.server.tag_read(None, module.status_index, 8, 1).unwrap();
        assert_eq!(data[0] & 1, 1, "running bit should be set");
    }

    #[test]
    fn mod_reg_event_channel_binds_an_existing_module() {
        let mut d = Dispatcher::new(TagServer::new(0));

        let mut reg_payload = Writer::new();
        reg_payload.u32(0);
        reg_payload.u32(protocol::REGISTER_SYNC);
        reg_payload.string("plc1");
        let reg_resp = roundtrip(&mut d, None, Command::ModReg, reg_payload.into_vec());
        let module_id = u32::from_ne_bytes(reg_resp[0..4].try_into().unwrap());

        let mut event_payload = Writer::new();
        event_payload.u32(module_id);
        event_payload.u32(protocol::REGISTER_EVENT);
        let event_resp = roundtrip(&mut d, None, Command::ModReg, event_payload.into_vec());
        assert!(event_resp.is_empty());
    }

    #[test]
    fn my_tagname_reports_the_calling_module() {
        let mut d = Dispatcher::new(TagServer::new(0));
        let idx = d.server.tag_get_by_name("_my_tagname").unwrap().index;

        let mut reg_payload = Writer::new();
        reg_payload.u32(0);
        reg_payload.u32(protocol::REGISTER_SYNC);
        reg_payload.string("plc1");
        let reg_resp = roundtrip(&mut d, None, Command::ModReg, reg_payload.into_vec());
        let module_id = u32::from_ne_bytes(reg_resp[0..4].try_into().unwrap());

        let mut read_payload = Writer::new();
        read_payload.u32(idx);
        read_payload.u32(0);
        read_payload.u32(4);
        let resp = roundtrip(&mut d, Some(module_id), Command::TagRead, read_payload.into_vec());
        assert_eq!(&resp, b"plc1");
    }

    #[test]
    fn tag_write_response_payload_is_empty() {
        let mut d = Dispatcher::new(TagServer::new(0));
        let idx = d.server.tag_add(None, "t", DINT, 1, 0).unwrap();
        let mut payload = Writer::new();
        payload.u32(idx);
        payload.u32(0);
        payload.bytes(&1i32.to_ne_bytes());
        let resp = roundtrip(&mut d, None, Command::TagWrite, payload.into_vec());
        assert!(resp.is_empty());
    }

    #[test]
    fn unknown_tag_returns_error_frame_with_wire_code() {
        let mut d = Dispatcher::new(TagServer::new(0));
        let mut payload = Writer::new();
        payload.u8(0);
        payload.u32(999);
        let req = Request {
            command: Command::TagGet,
            payload: payload.into_vec(),
        };
        let (frame, _notifications) = d.handle(Some(0), &req);
        let word = u32::from_be_bytes(frame[4..8].try_into().unwrap());
        assert_ne!(word & protocol::ERROR_FLAG, 0);
        let code = i32::from_ne_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(code, Error::Arg.wire_code());
    }

    #[test]
    fn disconnect_clears_owned_events() {
        let mut d = Dispatcher::new(TagServer::new(0));
        let idx = d.server.tag_add(None, "t", DINT, 1, 0).unwrap();
        d.server
            .event_add(idx, 7, EventKind::Write, 0, 0, 1, 4, DINT, EventOptions::default())
            .unwrap();
        d.on_disconnect(7);
        assert_eq!(
            d.server.event_del(idx, 1, 7).unwrap_err(),
            Error::NotFound
        );
    }
}
