// SPDX-License-Identifier: MIT

//! Per-tag event subscriptions and the predicate evaluation run on every
//! write.

use crate::types::TagType;

pub type ModuleId = u32;

/// The predicate kind for an event subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Fires on any write that intersects the watched slice.
    Write,
    /// Fires when the watched bytes differ from the last-observed snapshot.
    Change,
    /// Fires when a watched BOOL transitions 0 -> 1.
    Set,
    /// Fires when a watched BOOL transitions 1 -> 0.
    Reset,
    /// Fires when the current value equals `payload`.
    Equal { payload: f64 },
    /// Fires when the current value is greater than `payload`.
    Greater { payload: f64 },
    /// Fires when the current value is less than `payload`.
    Less { payload: f64 },
    /// Fires when `|current - last_notified| >= payload`.
    Deadband { payload: f64 },
}

/// Per-event options; currently just whether to ship the changed data along
/// with the notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventOptions {
    pub send_data: bool,
}

/// A single event subscription attached to a tag.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: u32,
    pub module: ModuleId,
    pub kind: EventKind,
    pub byte: u32,
    pub bit: u8,
    pub count: u32,
    pub size: u32,
    pub datatype: TagType,
    pub options: EventOptions,
    /// Snapshot used by CHANGE (last-seen bytes), SET/RESET (last BOOL bit),
    /// and DEADBAND (last-notified numeric value, stored as 8 bytes LE).
    baseline: Vec<u8>,
}

impl Event {
    pub fn new(
        id: u32,
        module: ModuleId,
        kind: EventKind,
        byte: u32,
        bit: u8,
        count: u32,
        size: u32,
        datatype: TagType,
        options: EventOptions,
        initial_slice: &[u8],
    ) -> Self {
        let baseline = match &kind {
            EventKind::Change => initial_slice.to_vec(),
            EventKind::Set | EventKind::Reset => vec![read_bool_bit(initial_slice, bit) as u8],
            EventKind::Deadband { .. } => {
                read_numeric(initial_slice, datatype).to_le_bytes().to_vec()
            }
            _ => Vec::new(),
        };
        Event {
            id,
            module,
            kind,
            byte,
            bit,
            count,
            size,
            datatype,
            options,
            baseline,
        }
    }

    /// Byte range `[byte, byte+size)` watched by this event.
    pub fn range(&self) -> (u32, u32) {
        (self.byte, self.byte + self.size)
    }

    fn intersects(&self, offset: u32, len: u32) -> bool {
        let (a0, a1) = self.range();
        let b0 = offset;
        let b1 = offset + len;
        a0 < b1 && b0 < a1
    }

    /// Evaluates this event's predicate against the tag's *current* full
    /// data buffer, given the byte range just written. Returns `Some(value)`
    /// if the event fires, carrying the slice's current bytes when the event
    /// asked for them.
    pub fn check(&mut self, write_offset: u32, write_len: u32, tag_data: &[u8]) -> Option<Vec<u8>> {
        if !self.intersects(write_offset, write_len) {
            return None;
        }
        let start = self.byte as usize;
        let end = (self.byte + self.size) as usize;
        if end > tag_data.len() {
            return None;
        }
        let current = &tag_data[start..end];

        let fired = match &self.kind {
            EventKind::Write => true,
            EventKind::Change => {
                let changed = current != self.baseline.as_slice();
                if changed {
                    self.baseline = current.to_vec();
                }
                changed
            }
            EventKind::Set => {
                let was = self.baseline.first().copied().unwrap_or(0) != 0;
                let now = read_bool_bit(current, self.bit);
                self.baseline = vec![now as u8];
                !was && now
            }
            EventKind::Reset => {
                let was = self.baseline.first().copied().unwrap_or(0) != 0;
                let now = read_bool_bit(current, self.bit);
                self.baseline = vec![now as u8];
                was && !now
            }
            EventKind::Equal { payload } => read_numeric(current, self.datatype) == *payload,
            EventKind::Greater { payload } => read_numeric(current, self.datatype) > *payload,
            EventKind::Less { payload } => read_numeric(current, self.datatype) < *payload,
            EventKind::Deadband { payload } => {
                let last = f64::from_le_bytes(self.baseline.clone().try_into().unwrap_or([0; 8]));
                let now = read_numeric(current, self.datatype);
                let fired = (now - last).abs() >= *payload;
                if fired {
                    self.baseline = now.to_le_bytes().to_vec();
                }
                fired
            }
        };

        if fired {
            Some(if self.options.send_data {
                current.to_vec()
            } else {
                Vec::new()
            })
        } else {
            None
        }
    }
}

fn read_bool_bit(bytes: &[u8], bit: u8) -> bool {
    let byte_idx = (bit / 8) as usize;
    let bit_idx = bit % 8;
    bytes
        .get(byte_idx)
        .map(|b| (b >> bit_idx) & 1 == 1)
        .unwrap_or(false)
}

/// Interprets `bytes` as a numeric value of `datatype`'s native width, in
/// host byte order.
pub fn read_numeric(bytes: &[u8], datatype: TagType) -> f64 {
    use crate::types::*;
    let base = base_of(datatype);
    match base {
        BOOL | BYTE => bytes.first().copied().unwrap_or(0) as f64,
        SINT => bytes.first().map(|&b| b as i8 as f64).unwrap_or(0.0),
        WORD | UINT => bytes
            .get(0..2)
            .map(|s| u16::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        INT => bytes
            .get(0..2)
            .map(|s| i16::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        DWORD | UDINT | TIME => bytes
            .get(0..4)
            .map(|s| u32::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        DINT => bytes
            .get(0..4)
            .map(|s| i32::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        REAL => bytes
            .get(0..4)
            .map(|s| f32::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        LWORD | ULINT => bytes
            .get(0..8)
            .map(|s| u64::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        LINT => bytes
            .get(0..8)
            .map(|s| i64::from_ne_bytes(s.try_into().unwrap()) as f64)
            .unwrap_or(0.0),
        LREAL => bytes
            .get(0..8)
            .map(|s| f64::from_ne_bytes(s.try_into().unwrap()))
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// A fired event, ready for the dispatcher to deliver on the subscriber's
/// asynchronous socket.
#[derive(Debug, Clone)]
pub struct Notification {
    pub module: ModuleId,
    pub tag_index: u32,
    pub event_id: u32,
    /// Present only when the event's `send_data` option was set.
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_event_does_not_fire_on_identical_rewrite() {
        let mut ev = Event::new(
            1,
            9,
            EventKind::Change,
            0,
            0,
            1,
            4,
            crate::types::DINT,
            EventOptions::default(),
            &[0, 0, 0, 0],
        );
        assert!(ev.check(0, 4, &[0, 0, 0, 0]).is_none());
        assert!(ev.check(0, 4, &[1, 0, 0, 0]).is_some());
        assert!(ev.check(0, 4, &[1, 0, 0, 0]).is_none());
    }

    #[test]
    fn set_fires_only_on_rising_edge() {
        let mut ev = Event::new(
            1,
            9,
            EventKind::Set,
            0,
            0,
            1,
            1,
            crate::types::BOOL,
            EventOptions::default(),
            &[0],
        );
        assert!(ev.check(0, 1, &[1]).is_some());
        assert!(ev.check(0, 1, &[1]).is_none());
        assert!(ev.check(0, 1, &[0]).is_none());
    }
}
