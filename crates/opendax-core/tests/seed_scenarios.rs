// SPDX-License-Identifier: MIT

//! End-to-end scenarios exercising `TagServer` the way a connected module
//! would, one call at a time, without going through the wire protocol.

use opendax_core::error::Error;
use opendax_core::events::{EventKind, EventOptions};
use opendax_core::handle::TagHandle;
use opendax_core::store::TagServer;
use opendax_core::types;

fn server() -> TagServer {
    TagServer::new(0)
}

#[test]
fn create_read_write_base_tag() {
    let mut server = server();
    let i = server.tag_add(None, "t1", types::DINT, 4, 0).unwrap();

    server
        .tag_write(None, i, 4, &[0x12, 0x34, 0x56, 0x78])
        .unwrap();

    let data = server.tag_read(None, i, 0, 16).unwrap();
    assert_eq!(data.len(), 16);
    assert_eq!(&data[4..8], &[0x12, 0x34, 0x56, 0x78]);
    assert!(data[0..4].iter().all(|&b| b == 0));
    assert!(data[8..16].iter().all(|&b| b == 0));
}

#[test]
fn cdt_with_bool_packing_sizes_correctly() {
    let mut server = server();
    let t = server.types.create("_test:a,BOOL,3:b,BOOL,5:c,INT,1").unwrap();
    // 8 packed BOOLs fit in one byte, byte-aligned, then a 2-byte INT member.
    assert_eq!(server.types.type_size(t).unwrap(), 3);
}

#[test]
fn mapping_propagates_a_write() {
    let mut server = server();
    let src = server.tag_add(None, "src", types::INT, 1, 0).unwrap();
    let dst = server.tag_add(None, "dst", types::INT, 1, 0).unwrap();

    let source = TagHandle {
        index: src,
        byte: 0,
        bit: 0,
        count: 1,
        size: 2,
        type_: types::INT,
    };
    let dest = TagHandle {
        index: dst,
        byte: 0,
        bit: 0,
        count: 1,
        size: 2,
        type_: types::INT,
    };
    server.map_add(source, dest).unwrap();

    server.tag_write(None, src, 0, &0x00AAu16.to_ne_bytes()).unwrap();

    let read = server.tag_read(None, dst, 0, 2).unwrap();
    assert_eq!(read, 0x00AAu16.to_ne_bytes());
}

#[test]
fn change_event_fires_once_for_a_repeated_write() {
    let mut server = server();
    let t = server.tag_add(None, "t", types::DINT, 1, 0).unwrap();
    const M: u32 = 7;

    server
        .event_add(t, M, EventKind::Change, 0, 0, 1, 4, types::DINT, EventOptions::default())
        .unwrap();

    let first = server.tag_write(None, t, 0, &5i32.to_ne_bytes()).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].module, M);

    let second = server.tag_write(None, t, 0, &5i32.to_ne_bytes()).unwrap();
    assert!(second.is_empty());
}

#[test]
fn atomic_or_touches_only_the_targeted_bits() {
    use opendax_core::atomic::{atomic_op, AtomicOp};

    let mut server = server();
    let t = server.tag_add(None, "b", types::BOOL, 24, 0).unwrap();

    let handle = TagHandle {
        index: t,
        byte: 0,
        bit: 4,
        count: 12,
        size: 2,
        type_: types::BOOL,
    };
    atomic_op(&mut server, handle, &[0xFF, 0xFF], AtomicOp::Or).unwrap();

    // Bits 4..15 (global) fall in the slice: byte 0's upper nibble and all
    // of byte 1. Bits 0..3 and 16..23 stay clear.
    let data = server.tag_read(None, t, 0, 3).unwrap();
    let bit = |byte: usize, n: u8| (data[byte] >> n) & 1;
    for n in 0..4 {
        assert_eq!(bit(0, n), 0, "bit {n} of byte 0 should be untouched");
    }
    for n in 4..8 {
        assert_eq!(bit(0, n), 1, "bit {n} of byte 0 should be set");
    }
    assert_eq!(data[1], 0xFF, "byte 1 is entirely inside the slice");
    assert_eq!(data[2], 0, "byte 2 is entirely outside the slice");
}

#[test]
fn override_overlay_masks_in_and_restores() {
    let mut server = server();
    let t = server.tag_add(None, "x", types::INT, 1, 0).unwrap();
    server.tag_write(None, t, 0, &0x1234u16.to_ne_bytes()).unwrap();

    server
        .override_add(t, 0, &0x5678u16.to_ne_bytes(), &0xFF00u16.to_ne_bytes())
        .unwrap();
    server.override_set(t, true).unwrap();

    let overlaid = server.tag_read(None, t, 0, 2).unwrap();
    assert_eq!(overlaid, 0x5634u16.to_ne_bytes());

    server.override_set(t, false).unwrap();
    let restored = server.tag_read(None, t, 0, 2).unwrap();
    assert_eq!(restored, 0x1234u16.to_ne_bytes());
}

#[test]
fn deleted_tag_index_reads_as_deleted_and_name_is_freed() {
    let mut server = server();
    let i = server.tag_add(None, "gone", types::DINT, 1, 0).unwrap();
    server.tag_del(i).unwrap();

    assert_eq!(server.tag_read(None, i, 0, 4).unwrap_err(), Error::Deleted);
    assert_eq!(server.tag_get_by_name("gone").unwrap_err(), Error::NotFound);
}

#[test]
fn group_over_budget_is_refused_and_leaves_table_empty() {
    use opendax_core::groups::{GroupTable, GROUP_DATA_BUDGET};

    let mut table = GroupTable::default();
    let oversize = TagHandle {
        index: 0,
        byte: 0,
        bit: 0,
        count: 1,
        size: GROUP_DATA_BUDGET as u32 + 1,
        type_: types::DINT,
    };
    assert_eq!(table.add(vec![oversize]).unwrap_err(), Error::TooBig);
    assert_eq!(table.get(0).unwrap_err(), Error::NotFound);
}
