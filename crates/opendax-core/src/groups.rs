// SPDX-License-Identifier: MIT

//! Per-module tag groups for batched, single-frame I/O.

use crate::error::{Error, Result};
use crate::events::Notification;
use crate::handle::TagHandle;
use crate::protocol::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::store::TagServer;

/// Maximum number of members in one group.
pub const MAX_GROUP_MEMBERS: usize = 64;

/// Combined byte size budget for one group: everything must fit in a single
/// response frame's payload.
pub const GROUP_DATA_BUDGET: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// An ordered bundle of tag handles belonging to one module.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: u32,
    pub members: Vec<TagHandle>,
    pub total_size: u32,
}

/// Per-module group table. Grows like the tag array: starts small, doubles.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: Vec<Option<Group>>,
    next_id: u32,
}

impl GroupTable {
    pub fn add(&mut self, members: Vec<TagHandle>) -> Result<u32> {
        if members.is_empty() || members.len() > MAX_GROUP_MEMBERS {
            return Err(Error::Arg);
        }
        let total_size: u32 = members.iter().map(|m| m.size).sum();
        if total_size as usize > GROUP_DATA_BUDGET {
            return Err(Error::TooBig);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.groups.push(Some(Group {
            id,
            members,
            total_size,
        }));
        Ok(id)
    }

    pub fn del(&mut self, id: u32) -> Result<()> {
        let slot = self
            .groups
            .iter_mut()
            .find(|g| g.as_ref().map(|g| g.id) == Some(id))
            .ok_or(Error::NotFound)?;
        *slot = None;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<&Group> {
        self.groups
            .iter()
            .find_map(|g| g.as_ref().filter(|g| g.id == id))
            .ok_or(Error::NotFound)
    }
}

/// Reads every member of a group in order and concatenates the bytes.
pub fn group_read(server: &mut TagServer, group: &Group) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(group.total_size as usize);
    for m in &group.members {
        out.extend(server.tag_read(None, m.index, m.byte, m.size)?);
    }
    Ok(out)
}

/// Writes `buf` across every member of a group in order; `buf` must equal
/// the group's total size. Returns every notification fired across every
/// member, in member order.
pub fn group_write(server: &mut TagServer, group: &Group, buf: &[u8]) -> Result<Vec<Notification>> {
    if buf.len() != group.total_size as usize {
        return Err(Error::Arg);
    }
    let mut offset = 0usize;
    let mut notifications = Vec::new();
    for m in &group.members {
        let end = offset + m.size as usize;
        notifications.extend(server.tag_write(None, m.index, m.byte, &buf[offset..end])?);
        offset = end;
    }
    Ok(notifications)
}

/// Masked write across every member of a group; `data`/`mask` must each equal
/// the group's total size. Splits the mask at each member boundary and
/// drives it through `TagServer::tag_mask_write`, so each member's own
/// events and retention fire exactly as for an individual masked write.
pub fn group_mask_write(server: &mut TagServer, group: &Group, data: &[u8], mask: &[u8]) -> Result<Vec<Notification>> {
    if data.len() != group.total_size as usize || mask.len() != group.total_size as usize {
        return Err(Error::Arg);
    }
    let mut offset = 0usize;
    let mut notifications = Vec::new();
    for m in &group.members {
        let end = offset + m.size as usize;
        notifications.extend(server.tag_mask_write(None, m.index, m.byte, &data[offset..end], &mask[offset..end])?);
        offset = end;
    }
    Ok(notifications)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DINT;

    #[test]
    fn oversize_group_is_refused() {
        let mut table = GroupTable::default();
        let members = vec![
            TagHandle { index: 0, byte: 0, bit: 0, count: 1, size: GROUP_DATA_BUDGET as u32 + 1, type_: DINT },
        ];
        assert_eq!(table.add(members).unwrap_err(), Error::TooBig);
        assert!(table.groups.iter().all(|g| g.is_none()));
    }

    #[test]
    fn group_round_trips_concatenated_bytes() {
        let mut server = TagServer::new(0);
        let a = server.tag_add(None, "a", DINT, 1, 0).unwrap();
        let b = server.tag_add(None, "b", DINT, 1, 0).unwrap();
        let mut table = GroupTable::default();
        let id = table
            .add(vec![
                TagHandle { index: a, byte: 0, bit: 0, count: 1, size: 4, type_: DINT },
                TagHandle { index: b, byte: 0, bit: 0, count: 1, size: 4, type_: DINT },
            ])
            .unwrap();
        let group = table.get(id).unwrap().clone();
        group_write(&mut server, &group, &[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        let data = group_read(&mut server, &group).unwrap();
        assert_eq!(data, vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }
}
