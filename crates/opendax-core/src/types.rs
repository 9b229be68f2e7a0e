// SPDX-License-Identifier: MIT

//! The compound data type (CDT) system.
//!
//! A tag type is a 32-bit identifier. Bit 31 marks a compound (custom) type;
//! bit 30 marks a queue (FIFO) tag rather than a flat buffer. The low 4 bits
//! of a base type give its bit-size as a power of two (`TYPESIZE(t) = 1 <<
//! (t & 0xF)`).

use crate::error::{Error, Result};

/// A tag type identifier (base type or CDT handle, optionally queue-flagged).
pub type TagType = u32;

/// Bit 31: this type identifier names a user-defined compound type.
pub const CDT_FLAG: TagType = 0x8000_0000;
/// Bit 30: the tagged data is a FIFO queue rather than a flat buffer.
pub const QUEUE_FLAG: TagType = 0x4000_0000;

pub const BOOL: TagType = 0x0010;
pub const BYTE: TagType = 0x0003;
pub const SINT: TagType = 0x0013;
pub const CHAR: TagType = 0x0013;
pub const WORD: TagType = 0x0004;
pub const INT: TagType = 0x0014;
pub const UINT: TagType = 0x0024;
pub const DWORD: TagType = 0x0005;
pub const DINT: TagType = 0x0015;
pub const UDINT: TagType = 0x0025;
pub const TIME: TagType = 0x0035;
pub const REAL: TagType = 0x0045;
pub const LWORD: TagType = 0x0006;
pub const LINT: TagType = 0x0016;
pub const ULINT: TagType = 0x0026;
pub const LREAL: TagType = 0x0036;

/// Returns `true` if `t` names a compound type rather than a base type.
pub fn is_custom(t: TagType) -> bool {
    t & CDT_FLAG != 0
}

/// Returns `true` if the queue bit is set.
pub fn is_queue(t: TagType) -> bool {
    t & QUEUE_FLAG != 0
}

/// Strips the queue flag, leaving a bare base or CDT type id.
pub fn base_of(t: TagType) -> TagType {
    t & !QUEUE_FLAG
}

/// `1 << (t & 0xF)`: the bit width of a base type.
fn typesize_bits(t: TagType) -> u32 {
    1u32 << (t & 0x0F)
}

fn base_type_name(t: TagType) -> Option<&'static str> {
    Some(match t {
        BOOL => "BOOL",
        BYTE => "BYTE",
        SINT => "SINT",
        WORD => "WORD",
        INT => "INT",
        UINT => "UINT",
        DWORD => "DWORD",
        DINT => "DINT",
        UDINT => "UDINT",
        TIME => "TIME",
        REAL => "REAL",
        LWORD => "LWORD",
        LINT => "LINT",
        ULINT => "ULINT",
        LREAL => "LREAL",
        _ => return None,
    })
}

fn base_type_by_name(name: &str) -> Option<TagType> {
    match name.to_ascii_uppercase().as_str() {
        "BOOL" => Some(BOOL),
        "BYTE" => Some(BYTE),
        "SINT" | "CHAR" => Some(SINT),
        "WORD" => Some(WORD),
        "INT" => Some(INT),
        "UINT" => Some(UINT),
        "DWORD" => Some(DWORD),
        "DINT" => Some(DINT),
        "UDINT" => Some(UDINT),
        "TIME" => Some(TIME),
        "REAL" => Some(REAL),
        "LWORD" => Some(LWORD),
        "LINT" => Some(LINT),
        "ULINT" => Some(ULINT),
        "LREAL" => Some(LREAL),
        _ => None,
    }
}

/// A single member of a compound type: name, type, and array count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdtMember {
    pub name: String,
    pub member_type: TagType,
    pub count: u32,
}

/// A user-defined compound type: a named, ordered list of members.
#[derive(Debug, Clone)]
pub struct Cdt {
    pub name: String,
    pub members: Vec<CdtMember>,
    /// Number of tags currently using this type.
    pub refcount: u32,
}

impl Cdt {
    /// Serializes to the wire form `Name:m1,T1,c1:m2,T2,c2:...`.
    pub fn serialize(&self, registry: &TypeRegistry) -> String {
        let mut s = self.name.clone();
        for m in &self.members {
            let type_name = registry.type_name(m.member_type).unwrap_or_default();
            s.push(':');
            s.push_str(&m.name);
            s.push(',');
            s.push_str(&type_name);
            s.push(',');
            s.push_str(&m.count.to_string());
        }
        s
    }
}

/// Registers base and compound data types; resolves ids, names, and sizes.
///
/// Base type ids are fixed constants above and are not stored here; only
/// compound types occupy an index. A CDT's `TagType` is `CDT_FLAG | index`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    cdts: Vec<Cdt>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self { cdts: Vec::new() }
    }

    fn index_of(t: TagType) -> usize {
        (t & !CDT_FLAG) as usize
    }

    /// Looks up a type id by name, checking base names first. Returns `None`
    /// if no type (base or CDT) has this name.
    pub fn get_type(&self, name: &str) -> Option<TagType> {
        if let Some(t) = base_type_by_name(name) {
            return Some(t);
        }
        self.cdts
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(|idx| CDT_FLAG | idx as TagType)
    }

    /// Returns the canonical name for a type id, or `None` if unknown.
    pub fn type_name(&self, t: TagType) -> Option<String> {
        let base = base_of(t);
        if is_custom(base) {
            self.cdts.get(Self::index_of(base)).map(|c| c.name.clone())
        } else {
            base_type_name(base).map(str::to_string)
        }
    }

    /// Parses a colon-separated CDT spec and registers it.
    ///
    /// Duplicate names are idempotent: if a CDT with the same name already
    /// exists and its serialized form is byte-identical to `spec`, the
    /// existing type id is returned rather than erroring.
    pub fn create(&mut self, spec: &str) -> Result<TagType> {
        let mut parts = spec.split(':');
        let name = parts.next().ok_or(Error::Arg)?.to_string();
        if name.is_empty() || !is_valid_identifier(&name) {
            return Err(Error::Arg);
        }

        let mut members = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for part in parts {
            let fields: Vec<&str> = part.split(',').collect();
            if fields.len() != 3 {
                return Err(Error::Arg);
            }
            let mname = fields[0].to_string();
            if mname.is_empty() || !is_valid_identifier(&mname) {
                return Err(Error::Arg);
            }
            if !seen.insert(mname.clone()) {
                return Err(Error::Duplicate);
            }
            let mtype = self.get_type(fields[1]).ok_or(Error::Arg)?;
            let count: u32 = fields[2].parse().map_err(|_| Error::Arg)?;
            if count == 0 {
                return Err(Error::Arg);
            }
            members.push(CdtMember {
                name: mname,
                member_type: mtype,
                count,
            });
        }

        if let Some(existing_idx) = self.cdts.iter().position(|c| c.name == name) {
            let existing = self.cdts[existing_idx].clone();
            if existing.serialize(self) == spec {
                return Ok(CDT_FLAG | existing_idx as TagType);
            }
            return Err(Error::Duplicate);
        }

        self.cdts.push(Cdt {
            name,
            members,
            refcount: 0,
        });
        Ok(CDT_FLAG | (self.cdts.len() - 1) as TagType)
    }

    pub fn get(&self, t: TagType) -> Option<&Cdt> {
        if !is_custom(base_of(t)) {
            return None;
        }
        self.cdts.get(Self::index_of(base_of(t)))
    }

    pub fn inc_refcount(&mut self, t: TagType) {
        if let Some(c) = self.cdts.get_mut(Self::index_of(base_of(t))) {
            c.refcount += 1;
        }
    }

    pub fn dec_refcount(&mut self, t: TagType) {
        if let Some(c) = self.cdts.get_mut(Self::index_of(base_of(t))) {
            c.refcount = c.refcount.saturating_sub(1);
        }
    }

    /// Deletes a CDT by type id. Fails if any tag still references it.
    pub fn delete(&mut self, t: TagType) -> Result<()> {
        let idx = Self::index_of(base_of(t));
        let cdt = self.cdts.get(idx).ok_or(Error::NotFound)?;
        if cdt.refcount > 0 {
            return Err(Error::Illegal);
        }
        // Indices must stay stable for other live CDTs, so we tombstone
        // rather than remove; a zeroed-out name can never match get_type.
        self.cdts[idx].name.clear();
        self.cdts[idx].members.clear();
        Ok(())
    }

    /// Computes the flat byte size of a tag with `count` elements of `t`.
    /// A base-BOOL tag packs its elements into bits (`ceil(count/8)`
    /// bytes); everything else is `type_size(t) * count`.
    pub fn tag_size(&self, t: TagType, count: u32) -> Result<u32> {
        let base = base_of(t);
        if base == BOOL {
            return Ok((count + 7) / 8);
        }
        Ok(self.type_size(base)? * count)
    }

    /// Computes the flat byte size of a (possibly compound) type, recursing
    /// through nested CDTs. BOOL members accumulate bit position; any other
    /// member byte-aligns the running bit position first.
    pub fn type_size(&self, t: TagType) -> Result<u32> {
        let base = base_of(t);
        if !is_custom(base) {
            return Ok(typesize_bits(base) / 8);
        }
        let cdt = self.cdts.get(Self::index_of(base)).ok_or(Error::Arg)?;
        let mut bits: u64 = 0;
        for m in &cdt.members {
            if m.member_type == BOOL {
                bits += m.count as u64;
            } else {
                if bits % 8 != 0 {
                    bits |= 0x07;
                    bits += 1;
                }
                let member_bytes = self.type_size(m.member_type)? as u64;
                bits += member_bytes * m.count as u64 * 8;
            }
        }
        if bits == 0 {
            Ok(0)
        } else {
            Ok((((bits - 1) / 8) + 1) as u32)
        }
    }
}

/// First char must be a letter or `_`; remaining chars letters, digits, or `_`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_type_lookup_is_case_insensitive() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.get_type("dint"), Some(DINT));
        assert_eq!(reg.get_type("DINT"), Some(DINT));
        assert_eq!(reg.get_type("bogus"), None);
    }

    #[test]
    fn cdt_bool_packing_matches_seed_scenario() {
        let mut reg = TypeRegistry::new();
        let t = reg.create("_test:a,BOOL,3:b,BOOL,5:c,INT,1").unwrap();
        assert_eq!(reg.type_size(t).unwrap(), 3);
    }

    #[test]
    fn cdt_create_is_idempotent_on_identical_spec() {
        let mut reg = TypeRegistry::new();
        let spec = "point:x,DINT,1:y,DINT,1";
        let t1 = reg.create(spec).unwrap();
        let t2 = reg.create(spec).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn cdt_round_trip_through_serialize() {
        let mut reg = TypeRegistry::new();
        let spec = "point:x,DINT,1:y,DINT,1";
        let t1 = reg.create(spec).unwrap();
        let serialized = reg.get(t1).unwrap().serialize(&reg);
        let t2 = reg.create(&serialized).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn duplicate_member_names_rejected() {
        let mut reg = TypeRegistry::new();
        assert_eq!(
            reg.create("bad:x,DINT,1:x,INT,1").unwrap_err(),
            Error::Duplicate
        );
    }

    #[test]
    fn nested_cdt_size_recurses() {
        let mut reg = TypeRegistry::new();
        let inner = reg.create("inner:a,DINT,1:b,DINT,1").unwrap();
        let _ = inner;
        let outer = reg.create("outer:p,inner,2:f,BOOL,1").unwrap();
        // 2 * 8 bytes for `inner` + 1 byte for the trailing BOOL.
        assert_eq!(reg.type_size(outer).unwrap(), 17);
    }
}
