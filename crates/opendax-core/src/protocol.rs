// SPDX-License-Identifier: MIT

//! Wire framing and command codes.
//!
//! Every request and response is a length-prefixed frame: a big-endian
//! `u32` size, a big-endian `u32` command word, then `size - 8` bytes of
//! payload in host byte order. Responses OR the command word with
//! [`RESPONSE_FLAG`]; errors additionally OR in [`ERROR_FLAG`] and carry a
//! single host-order `i32` error code as their payload.

use crate::error::Error;
use crate::events::Notification;

/// Header size: a 4-byte size field plus a 4-byte command word.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest frame (header + payload) the server will read or write.
pub const MAX_FRAME_SIZE: usize = 4096;

pub const RESPONSE_FLAG: u32 = 0x0100_0000;
pub const ERROR_FLAG: u32 = 0x0200_0000;
/// Set on an unsolicited event-notification frame pushed to a subscribing
/// module, as opposed to a reply to that connection's own request.
pub const NOTIFY_FLAG: u32 = 0x0400_0000;

/// Registration sentinel values the client uses to detect an
/// endian/float-layout mismatch against this server.
pub const REG_TEST_INT: u16 = 0xBCDE;
pub const REG_TEST_DINT: u32 = 0x56789ABC;
pub const REG_TEST_LINT: u64 = 0x1234_5678_9ABC_DEF0;
pub const REG_TEST_REAL: f32 = 3.14159265;
pub const REG_TEST_LREAL: f64 = -58765463.8766677;

/// Registration channel flags.
pub const REGISTER_SYNC: u32 = 0x01;
pub const REGISTER_EVENT: u32 = 0x02;

/// Stable command codes. Numeric values are this crate's own; the
/// specification only guarantees the names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    ModReg = 0,
    ModSet = 1,
    ModGet = 2,
    TagAdd = 3,
    TagDel = 4,
    TagGet = 5,
    TagList = 6,
    TagRead = 7,
    TagWrite = 8,
    TagMwrite = 9,
    EvntAdd = 10,
    EvntDel = 11,
    EvntGet = 12,
    EvntOpt = 13,
    CdtCreate = 14,
    CdtGet = 15,
    MapAdd = 16,
    MapDel = 17,
    MapGet = 18,
    GrpAdd = 19,
    GrpDel = 20,
    GrpRead = 21,
    GrpWrite = 22,
    GrpMwrite = 23,
    AtomicOp = 24,
    AddOvrd = 25,
    DelOvrd = 26,
    GetOvrd = 27,
    SetOvrd = 28,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Command> {
        use Command::*;
        Some(match v {
            0 => ModReg,
            1 => ModSet,
            2 => ModGet,
            3 => TagAdd,
            4 => TagDel,
            5 => TagGet,
            6 => TagList,
            7 => TagRead,
            8 => TagWrite,
            9 => TagMwrite,
            10 => EvntAdd,
            11 => EvntDel,
            12 => EvntGet,
            13 => EvntOpt,
            14 => CdtCreate,
            15 => CdtGet,
            16 => MapAdd,
            17 => MapDel,
            18 => MapGet,
            19 => GrpAdd,
            20 => GrpDel,
            21 => GrpRead,
            22 => GrpWrite,
            23 => GrpMwrite,
            24 => AtomicOp,
            25 => AddOvrd,
            26 => DelOvrd,
            27 => GetOvrd,
            28 => SetOvrd,
            _ => return None,
        })
    }
}

/// A fully decoded request frame: the command and its raw payload.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub payload: Vec<u8>,
}

/// Serializes a successful response.
pub fn encode_response(command: Command, payload: &[u8]) -> Vec<u8> {
    encode_frame((command as u32) | RESPONSE_FLAG, payload)
}

/// Serializes an error response carrying the wire error code.
pub fn encode_error(command: Command, err: &Error) -> Vec<u8> {
    encode_frame(
        (command as u32) | RESPONSE_FLAG | ERROR_FLAG,
        &err.wire_code().to_ne_bytes(),
    )
}

fn encode_frame(command_word: u32, payload: &[u8]) -> Vec<u8> {
    let size = (FRAME_HEADER_SIZE + payload.len()) as u32;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&command_word.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encodes a client request frame.
pub fn encode_request(command: Command, payload: &[u8]) -> Vec<u8> {
    encode_frame(command as u32, payload)
}

/// Encodes a push notification for a fired event, delivered to the
/// subscribing module's connection independent of whoever caused the write.
pub fn encode_notify(n: &Notification) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12 + n.value.len());
    payload.extend_from_slice(&n.tag_index.to_ne_bytes());
    payload.extend_from_slice(&n.event_id.to_ne_bytes());
    payload.extend_from_slice(&(n.value.len() as u16).to_ne_bytes());
    payload.extend_from_slice(&n.value);
    encode_frame(NOTIFY_FLAG, &payload)
}

/// Attempts to split one complete frame off the front of `buf`. Returns the
/// decoded request and the number of bytes consumed, or `None` if `buf`
/// does not yet contain a full frame.
pub fn try_decode_request(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if size < FRAME_HEADER_SIZE || size > MAX_FRAME_SIZE {
        return Err(Error::TooBig);
    }
    if buf.len() < size {
        return Ok(None);
    }
    let command_word = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let command = Command::from_u32(command_word & !(RESPONSE_FLAG | ERROR_FLAG))
        .ok_or(Error::NotImplemented)?;
    let payload = buf[FRAME_HEADER_SIZE..size].to_vec();
    Ok(Some((Request { command, payload }, size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_is_big_endian() {
        let frame = encode_request(Command::TagAdd, b"hello");
        assert_eq!(&frame[0..4], &13u32.to_be_bytes());
        assert_eq!(&frame[4..8], &3u32.to_be_bytes());
    }

    #[test]
    fn partial_frame_returns_none() {
        let frame = encode_request(Command::TagAdd, b"hello");
        assert!(try_decode_request(&frame[..6]).unwrap().is_none());
        let (req, consumed) = try_decode_request(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(req.command, Command::TagAdd);
        assert_eq!(req.payload, b"hello");
    }

    #[test]
    fn error_response_sets_both_flags() {
        let frame = encode_error(Command::TagRead, &Error::NotFound);
        let word = u32::from_be_bytes(frame[4..8].try_into().unwrap());
        assert_eq!(word & RESPONSE_FLAG, RESPONSE_FLAG);
        assert_eq!(word & ERROR_FLAG, ERROR_FLAG);
        let code = i32::from_ne_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(code, Error::NotFound.wire_code());
    }
}
