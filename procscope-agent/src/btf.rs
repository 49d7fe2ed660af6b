//! `task_struct` field offsets from kernel BTF
//!
//! The probes read task fields at `task + offset`. Offsets move between kernel
//! builds (and with struct randomization), so they are looked up by member
//! name in `/sys/kernel/btf/vmlinux` at startup.

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use procscope_common::TaskOffsets;
use std::path::Path;

/// Raw BTF of the running kernel.
pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

const BTF_MAGIC: u16 = 0xeb9f;
const HEADER_LEN: usize = 24;
const TYPE_LEN: usize = 12;
/// Bound on typedef chains and anonymous member nesting.
const MAX_DEPTH: usize = 32;

const KIND_INT: u32 = 1;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

/// Resolves [`TaskOffsets`] from the running kernel's BTF.
pub fn task_offsets() -> Result<TaskOffsets> {
    task_offsets_from_path(VMLINUX_BTF)
}

/// Resolves [`TaskOffsets`] from a BTF file on disk.
pub fn task_offsets_from_path(path: impl AsRef<Path>) -> Result<TaskOffsets> {
    let path = path.as_ref();
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read BTF from {}", path.display()))?;
    task_offsets_from(&data)
}

/// Resolves [`TaskOffsets`] from a raw BTF blob.
pub fn task_offsets_from(data: &[u8]) -> Result<TaskOffsets> {
    let btf = Btf::parse(data)?;
    let task = btf
        .struct_by_name("task_struct")
        .ok_or_else(|| anyhow!("struct task_struct not found in BTF"))?;

    let field = |name: &str| -> Result<u32> {
        btf.member_offset(task, name)
            .ok_or_else(|| anyhow!("task_struct::{} not found in BTF", name))
    };

    let offsets = TaskOffsets {
        pid: field("pid")?,
        tgid: field("tgid")?,
        utime: field("utime")?,
        stime: field("stime")?,
        comm: field("comm")?,
        _padding: 0,
    };
    debug!("Resolved task_struct offsets: {:?}", offsets);
    Ok(offsets)
}

#[derive(Debug, Clone, Copy)]
struct Member {
    name_off: u32,
    type_id: u32,
    bit_offset: u32,
}

#[derive(Debug)]
struct BtfType {
    name_off: u32,
    kind: u32,
    /// Referenced type for modifiers and typedefs.
    type_ref: u32,
    members: Vec<Member>,
}

/// Minimal BTF reader: only what member-offset lookup needs.
struct Btf<'a> {
    /// Index 0 is `void`, so ids index directly.
    types: Vec<BtfType>,
    strings: &'a [u8],
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| anyhow!("BTF truncated at byte {}", self.pos))?;
        self.pos += 4;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            bail!("BTF truncated at byte {}", self.pos);
        }
        self.pos += n;
        Ok(())
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

impl<'a> Btf<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            bail!("BTF too short: {} bytes", data.len());
        }
        let magic = u16::from_ne_bytes([data[0], data[1]]);
        if magic != BTF_MAGIC {
            bail!("Bad BTF magic {:#06x}", magic);
        }

        let mut header = Cursor { data, pos: 4 };
        let hdr_len = header.u32()? as usize;
        let type_off = header.u32()? as usize;
        let type_len = header.u32()? as usize;
        let str_off = header.u32()? as usize;
        let str_len = header.u32()? as usize;

        let section = |off: usize, len: usize, what: &str| -> Result<&'a [u8]> {
            let start = hdr_len + off;
            data.get(start..start + len)
                .ok_or_else(|| anyhow!("BTF {} section out of bounds", what))
        };
        let type_data = section(type_off, type_len, "type")?;
        let strings = section(str_off, str_len, "string")?;

        let mut types = vec![BtfType {
            name_off: 0,
            kind: 0,
            type_ref: 0,
            members: Vec::new(),
        }];
        let mut cur = Cursor {
            data: type_data,
            pos: 0,
        };
        while !cur.done() {
            types.push(Self::parse_type(&mut cur)?);
        }

        Ok(Self { types, strings })
    }

    fn parse_type(cur: &mut Cursor<'_>) -> Result<BtfType> {
        let name_off = cur.u32()?;
        let info = cur.u32()?;
        let size_or_type = cur.u32()?;

        let vlen = (info & 0xffff) as usize;
        let kind = (info >> 24) & 0x1f;
        let kind_flag = info >> 31 == 1;

        let mut members = Vec::new();
        match kind {
            KIND_STRUCT | KIND_UNION => {
                for _ in 0..vlen {
                    let name_off = cur.u32()?;
                    let type_id = cur.u32()?;
                    let offset = cur.u32()?;
                    // With kind_flag the high byte holds the bitfield size.
                    let bit_offset = if kind_flag { offset & 0x00ff_ffff } else { offset };
                    members.push(Member {
                        name_off,
                        type_id,
                        bit_offset,
                    });
                }
            }
            KIND_INT | KIND_VAR | KIND_DECL_TAG => cur.skip(4)?,
            KIND_ARRAY => cur.skip(12)?,
            KIND_ENUM | KIND_FUNC_PROTO => cur.skip(vlen * 8)?,
            KIND_DATASEC | KIND_ENUM64 => cur.skip(vlen * TYPE_LEN)?,
            _ => {}
        }

        Ok(BtfType {
            name_off,
            kind,
            type_ref: size_or_type,
            members,
        })
    }

    fn name(&self, off: u32) -> &[u8] {
        let rest = self.strings.get(off as usize..).unwrap_or(&[]);
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        &rest[..end]
    }

    fn struct_by_name(&self, name: &str) -> Option<u32> {
        self.types
            .iter()
            .position(|t| {
                t.kind == KIND_STRUCT
                    && !t.members.is_empty()
                    && self.name(t.name_off) == name.as_bytes()
            })
            .map(|id| id as u32)
    }

    /// Follows typedefs and qualifiers down to the underlying type.
    fn resolve(&self, mut id: u32) -> Option<&BtfType> {
        for _ in 0..MAX_DEPTH {
            let ty = self.types.get(id as usize)?;
            match ty.kind {
                KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_TYPE_TAG => {
                    id = ty.type_ref
                }
                _ => return Some(ty),
            }
        }
        None
    }

    /// Byte offset of member `name`, searching anonymous struct/union members.
    fn member_offset(&self, struct_id: u32, name: &str) -> Option<u32> {
        let ty = self.types.get(struct_id as usize)?;
        self.find_member(ty, name.as_bytes(), 0, 0)
            .filter(|bits| bits % 8 == 0)
            .map(|bits| bits / 8)
    }

    fn find_member(&self, ty: &BtfType, name: &[u8], base_bits: u32, depth: usize) -> Option<u32> {
        if depth >= MAX_DEPTH {
            return None;
        }
        for member in &ty.members {
            let bits = base_bits.checked_add(member.bit_offset)?;
            if member.name_off == 0 {
                if let Some(inner) = self.resolve(member.type_id) {
                    if matches!(inner.kind, KIND_STRUCT | KIND_UNION) {
                        if let Some(found) = self.find_member(inner, name, bits, depth + 1) {
                            return Some(found);
                        }
                    }
                }
            } else if self.name(member.name_off) == name {
                return Some(bits);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds raw BTF blobs for tests.
    #[derive(Default)]
    struct BtfBuilder {
        types: Vec<u8>,
        strings: Vec<u8>,
        next_id: u32,
    }

    impl BtfBuilder {
        fn new() -> Self {
            Self {
                types: Vec::new(),
                strings: vec![0],
                next_id: 1,
            }
        }

        fn string(&mut self, s: &str) -> u32 {
            if s.is_empty() {
                return 0;
            }
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(s.as_bytes());
            self.strings.push(0);
            off
        }

        fn push(&mut self, words: &[u32]) -> u32 {
            for w in words {
                self.types.extend_from_slice(&w.to_ne_bytes());
            }
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn int(&mut self, name: &str, size: u32) -> u32 {
            let name = self.string(name);
            self.push(&[name, KIND_INT << 24, size, size * 8])
        }

        fn array(&mut self, elem: u32, index: u32, len: u32) -> u32 {
            self.push(&[0, KIND_ARRAY << 24, 0, elem, index, len])
        }

        fn typedef(&mut self, name: &str, target: u32) -> u32 {
            let name = self.string(name);
            self.push(&[name, KIND_TYPEDEF << 24, target])
        }

        fn composite(
            &mut self,
            kind: u32,
            name: &str,
            size: u32,
            kind_flag: bool,
            members: &[(&str, u32, u32)],
        ) -> u32 {
            let name = self.string(name);
            let flag = if kind_flag { 1 << 31 } else { 0 };
            let mut words = vec![name, flag | (kind << 24) | members.len() as u32, size];
            for (member, ty, offset) in members {
                let member = self.string(member);
                words.extend_from_slice(&[member, *ty, *offset]);
            }
            self.push(&words)
        }

        fn build(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&BTF_MAGIC.to_ne_bytes());
            out.push(1);
            out.push(0);
            for word in [
                HEADER_LEN as u32,
                0,
                self.types.len() as u32,
                self.types.len() as u32,
                self.strings.len() as u32,
            ] {
                out.extend_from_slice(&word.to_ne_bytes());
            }
            out.extend_from_slice(&self.types);
            out.extend_from_slice(&self.strings);
            out
        }
    }

    fn kernel_like_btf(kind_flag: bool) -> Vec<u8> {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4);
        let u64_ty = b.int("long long unsigned int", 8);
        let pid_t = b.typedef("pid_t", int);
        let char_ty = b.int("char", 1);
        let comm = b.array(char_ty, int, 16);
        // Fields under randomization end up inside an anonymous struct.
        let ids = b.composite(KIND_STRUCT, "", 8, false, &[("pid", pid_t, 0), ("tgid", pid_t, 32)]);
        let ids_alias = b.typedef("", ids);
        // The forward-declared duplicate must be skipped.
        b.composite(KIND_STRUCT, "task_struct", 0, false, &[]);
        b.composite(
            KIND_STRUCT,
            "task_struct",
            2048,
            kind_flag,
            &[
                ("__state", int, 0),
                ("", ids_alias, 1184 * 8),
                ("utime", u64_ty, 1464 * 8),
                ("stime", u64_ty, 1472 * 8),
                ("comm", comm, 1872 * 8),
            ],
        );
        b.build()
    }

    #[test]
    fn test_task_offsets_from_blob() {
        let offsets = task_offsets_from(&kernel_like_btf(false)).unwrap();
        assert_eq!(
            offsets,
            TaskOffsets {
                pid: 1184,
                tgid: 1188,
                utime: 1464,
                stime: 1472,
                comm: 1872,
                _padding: 0,
            }
        );
        assert!(offsets.is_resolved());
    }

    #[test]
    fn test_kind_flag_masks_bitfield_size() {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4);
        // bitfield size 3 in the high byte, bit offset 64 in the low 24 bits
        b.composite(KIND_STRUCT, "flags", 16, true, &[("lo", int, 0), ("hi", int, (3 << 24) | 64)]);
        let data = b.build();

        let btf = Btf::parse(&data).unwrap();
        let id = btf.struct_by_name("flags").unwrap();
        assert_eq!(btf.member_offset(id, "hi"), Some(8));
        assert_eq!(btf.member_offset(id, "missing"), None);
    }

    #[test]
    fn test_kind_flag_task_struct() {
        let offsets = task_offsets_from(&kernel_like_btf(true)).unwrap();
        assert_eq!(offsets.tgid, 1188);
    }

    #[test]
    fn test_missing_task_struct() {
        let mut b = BtfBuilder::new();
        b.int("int", 4);
        let err = task_offsets_from(&b.build()).unwrap_err();
        assert!(err.to_string().contains("task_struct"));
    }

    #[test]
    fn test_missing_member() {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4);
        b.composite(KIND_STRUCT, "task_struct", 8, false, &[("pid", int, 0), ("tgid", int, 32)]);
        let err = task_offsets_from(&b.build()).unwrap_err();
        assert!(err.to_string().contains("utime"));
    }

    #[test]
    fn test_self_nested_anonymous_member() {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4);
        let id = b.next_id;
        b.composite(KIND_STRUCT, "nested", 8, false, &[("", id, 0), ("pid", int, 32)]);
        let btf = Btf::parse(&b.build()).unwrap();

        let id = btf.struct_by_name("nested").unwrap();
        assert_eq!(btf.member_offset(id, "tgid"), None);
    }

    #[test]
    fn test_member_offset_overflow() {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4);
        let inner = b.composite(KIND_STRUCT, "", 8, false, &[("pid", int, 0x100)]);
        b.composite(KIND_STRUCT, "outer", 8, false, &[("", inner, 0xffff_ff80)]);
        let btf = Btf::parse(&b.build()).unwrap();

        let id = btf.struct_by_name("outer").unwrap();
        assert_eq!(btf.member_offset(id, "pid"), None);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = kernel_like_btf(false);
        data[0] ^= 0xff;
        assert!(Btf::parse(&data).is_err());
    }

    #[test]
    fn test_truncated() {
        let data = kernel_like_btf(false);
        assert!(Btf::parse(&data[..data.len() - 40]).is_err());
        assert!(Btf::parse(&data[..10]).is_err());
    }

    #[test]
    fn test_from_missing_path() {
        let err = task_offsets_from_path("/nonexistent/btf").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/btf"));
    }
}
