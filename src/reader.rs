use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::{bail, Result};
use bitflags::bitflags;
use log::{debug, warn};

use crate::bytes::{
    align_to, read_cstr, read_u16, read_u32, read_u64, read_u8, write_u16, write_u32, write_u8,
};
use crate::context::{ImportRecord, ObjectContext};
use crate::hash::HashIndex;
use crate::vm::{vm_info, VmFlags, VmInfo, MAGIC_IW, MAGIC_MASK, MAGIC_TREYARCH, VM_MW23, VM_T8, VM_T9, VM_T937};

bitflags! {
    /// Canonical export attribute bits every reader remaps to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExportFlags: u8 {
        const AUTOEXEC = 0x01;
        const LINKED = 0x02;
        const PRIVATE = 0x04;
        const CLASS_MEMBER = 0x08;
        const EVENT = 0x10;
        const VE = 0x20;
        const CLASS_LINKED = 0x40;
        const CLASS_DESTRUCTOR = 0x80;
    }
}

/// Distinguished remapped value (not a bit combination) marking a compiler
/// generated vtable export.
pub const CLASS_VTABLE: u8 = 0x15;

/// Import call kinds, low nibble of the canonical import flags.
pub const CALLTYPE_MASK: u8 = 0x0F;
pub const FUNC_METHOD: u8 = 0x01;
pub const FUNCTION: u8 = 0x02;
pub const FUNCTION_THREAD: u8 = 0x03;
pub const FUNCTION_CHILDTHREAD: u8 = 0x04;
pub const METHOD: u8 = 0x05;
pub const METHOD_THREAD: u8 = 0x06;
pub const METHOD_CHILDTHREAD: u8 = 0x07;
/// Modifier bits above the call kind.
pub const DEV_CALL: u8 = 0x10;
pub const GET_CALL: u8 = 0x20;

/// 32-bit hash of the empty string, written as the namespace of get-calls so
/// the walker knows not to print a namespace prefix.
pub const EMPTY_STR_HASH32: u32 = 0xC124_3180;

pub fn calltype_name(flags: u8) -> &'static str {
    match flags & CALLTYPE_MASK {
        FUNC_METHOD => "funcmethod",
        FUNCTION => "function",
        FUNCTION_THREAD => "function thread",
        FUNCTION_CHILDTHREAD => "function childthread",
        METHOD => "method",
        METHOD_THREAD => "method thread",
        METHOD_CHILDTHREAD => "method childthread",
        _ => "<errorflag>",
    }
}

/// Normalized export table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportEntry {
    pub namespace: u64,
    pub name: u64,
    pub file_namespace: u64,
    pub checksum: u64,
    pub address: u32,
    pub param_count: u8,
    pub flags: u8,
}

pub fn export_entry_size(hash64: bool) -> usize {
    if hash64 {
        0x28
    } else {
        0x18
    }
}

pub fn read_export(data: &[u8], off: usize, hash64: bool) -> Result<ExportEntry> {
    if hash64 {
        Ok(ExportEntry {
            namespace: read_u64(data, off)?,
            name: read_u64(data, off + 0x08)?,
            file_namespace: read_u64(data, off + 0x10)?,
            checksum: read_u64(data, off + 0x18)?,
            address: read_u32(data, off + 0x20)?,
            param_count: read_u8(data, off + 0x24)?,
            flags: read_u8(data, off + 0x25)?,
        })
    } else {
        Ok(ExportEntry {
            checksum: read_u32(data, off)? as u64,
            address: read_u32(data, off + 0x04)?,
            name: read_u32(data, off + 0x08)? as u64,
            namespace: read_u32(data, off + 0x0C)? as u64,
            file_namespace: read_u32(data, off + 0x10)? as u64,
            param_count: read_u8(data, off + 0x14)?,
            flags: read_u8(data, off + 0x15)?,
        })
    }
}

/// String table entry: literal address plus its code fixups.
#[derive(Debug, Clone)]
pub struct StringEntry {
    pub address: u32,
    pub kind: u8,
    pub fixups: Vec<u32>,
}

pub const STRING_ENTRY_SIZE: usize = 8;
pub const IMPORT32_ENTRY_SIZE: usize = 12;
pub const IMPORT64_ENTRY_SIZE: usize = 20;
pub const GLOBAL_ENTRY_SIZE: usize = 8;
pub const ANIMTREE_SINGLE_ENTRY_SIZE: usize = 8;
pub const ANIMTREE_DOUBLE_ENTRY_SIZE: usize = 12;

/// Capability over a mapped script blob. One implementation per on-disk
/// variant; everything downstream of the reader sees the same logical view.
pub trait ScriptReader {
    fn blob(&self) -> &[u8];
    fn blob_mut(&mut self) -> &mut [u8];
    fn vm(&self) -> &'static VmInfo;

    fn name(&self) -> u64;
    fn header_size(&self) -> usize;
    fn file_size(&self) -> u32;

    fn includes_count(&self) -> u16;
    fn includes_offset(&self) -> u32;
    fn strings_count(&self) -> u16;
    fn strings_offset(&self) -> u32;
    fn imports_count(&self) -> u16;
    fn imports_offset(&self) -> u32;
    fn globals_count(&self) -> u16 {
        0
    }
    fn globals_offset(&self) -> u32 {
        0
    }
    fn animtree_single_count(&self) -> u16 {
        0
    }
    fn animtree_single_offset(&self) -> u32 {
        0
    }
    fn animtree_double_count(&self) -> u16 {
        0
    }
    fn animtree_double_offset(&self) -> u32 {
        0
    }
    fn exports_count(&self) -> u16;
    fn exports_offset(&self) -> u32;
    fn cseg_offset(&self) -> u32;
    fn cseg_size(&self) -> u32;

    /// Decode the string literal stored at `addr`.
    fn decrypt_string(&self, addr: u32) -> Result<String>;

    // by default no remapping
    fn remap_flags_import(&self, flags: u8) -> u8 {
        flags
    }
    fn remap_flags_export(&self, flags: u8) -> u8 {
        flags
    }

    /// Header precondition: minimum size and magic.
    fn validate(&self, size: usize) -> bool;

    fn dump_header(&self, out: &mut String, test_header: bool);

    fn dump_experimental(&self, _out: &mut String, _test_header: bool) {}

    /// Walk the string table without patching; used by the `--strings`
    /// diagnostic section and the string dump sink.
    fn string_entries(&self) -> Result<Vec<StringEntry>> {
        let mut entries = Vec::with_capacity(self.strings_count() as usize);
        let data = self.blob();
        let mut loc = self.strings_offset() as usize;
        for _ in 0..self.strings_count() {
            let address = read_u32(data, loc)?;
            let count = read_u8(data, loc + 4)? as usize;
            let kind = read_u8(data, loc + 5)?;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + STRING_ENTRY_SIZE + j * 4)?);
            }
            loc += STRING_ENTRY_SIZE + count * 4;
            entries.push(StringEntry { address, kind, fixups });
        }
        Ok(entries)
    }

    /// Link patching: rewrite in-code operands so pointers into the fixup
    /// tables become compact interned indexes. Entry failures are logged and
    /// skipped; the rest of the file still disassembles.
    fn patch_code(
        &mut self,
        ctx: &mut ObjectContext,
        hash: &HashIndex,
        dumped_strings: &mut BTreeSet<String>,
    ) -> Result<()> {
        if self.vm().has(VmFlags::HASH64) {
            self.patch_hash64(ctx, hash, dumped_strings)
        } else {
            self.patch_hash32(ctx, hash, dumped_strings)
        }
    }

    fn patch_hash32(
        &mut self,
        ctx: &mut ObjectContext,
        hash: &HashIndex,
        dumped_strings: &mut BTreeSet<String>,
    ) -> Result<()> {
        // imports: unlink the refs so the code carries namespace::name and the
        // declared arity instead of a table pointer
        let mut loc = self.imports_offset() as usize;
        for i in 0..self.imports_count() {
            let data = self.blob();
            let name = read_u32(data, loc)?;
            let namespace = read_u32(data, loc + 4)?;
            let count = read_u16(data, loc + 8)? as usize;
            let param_count = read_u8(data, loc + 10)?;
            let flags = read_u8(data, loc + 11)?;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + IMPORT32_ENTRY_SIZE + j * 4)? as usize);
            }
            loc += IMPORT32_ENTRY_SIZE + count * 4;

            let remapped = self.remap_flags_import(flags);
            for addr in fixups {
                let target = match remapped & CALLTYPE_MASK {
                    FUNC_METHOD => align_to(addr + 2, 8),
                    FUNCTION | FUNCTION_THREAD | FUNCTION_CHILDTHREAD | METHOD | METHOD_THREAD
                    | METHOD_CHILDTHREAD => {
                        // the linker would fix bad arities here; we only need
                        // the declared count next to the callsite
                        if let Err(err) = write_u8(self.blob_mut(), addr + 2, param_count) {
                            warn!("import patch skipped (entry {}): {:#}", i, err);
                            continue;
                        }
                        align_to(addr + 3, 8)
                    }
                    other => {
                        warn!("import patch skipped (entry {}): unknown call kind {:#x}", i, other);
                        continue;
                    }
                };
                let ns = if remapped & GET_CALL != 0 {
                    // dynamic get-calls carry no namespace
                    EMPTY_STR_HASH32
                } else {
                    namespace
                };
                let blob = self.blob_mut();
                if let Err(err) =
                    write_u32(blob, target, name).and_then(|_| write_u32(blob, target + 4, ns))
                {
                    warn!("import patch skipped (entry {}): {:#}", i, err);
                }
            }
        }

        // globals: intern the name, write the compact id at every use
        let mut loc = self.globals_offset() as usize;
        for i in 0..self.globals_count() {
            let data = self.blob();
            let name = read_u32(data, loc)? as u64;
            let count = read_u16(data, loc + 4)? as usize;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + GLOBAL_ENTRY_SIZE + j * 4)? as usize);
            }
            loc += GLOBAL_ENTRY_SIZE + count * 4;

            let id = ctx.add_global_var_name(name);
            for addr in fixups {
                if let Err(err) = write_u16(self.blob_mut(), addr, id) {
                    warn!("global patch skipped (entry {}): {:#}", i, err);
                }
            }
        }

        // strings last: decryption feeds the hash index and the dump sink
        for (i, entry) in self.string_entries()?.into_iter().enumerate() {
            let text = match self.decrypt_string(entry.address) {
                Ok(text) => text,
                Err(err) => {
                    warn!("string patch skipped (entry {}): {:#}", i, err);
                    continue;
                }
            };
            hash.add(&text);
            dumped_strings.insert(text.clone());
            let id = ctx.add_string(&text);
            for addr in entry.fixups {
                if let Err(err) = write_u32(self.blob_mut(), addr as usize, id) {
                    warn!("string patch skipped (entry {}): {:#}", i, err);
                }
            }
        }
        Ok(())
    }

    fn patch_hash64(
        &mut self,
        ctx: &mut ObjectContext,
        hash: &HashIndex,
        dumped_strings: &mut BTreeSet<String>,
    ) -> Result<()> {
        // single animtrees first: their slot is one byte wide, so they must
        // claim the low interned-string ids
        let mut loc = self.animtree_single_offset() as usize;
        for i in 0..self.animtree_single_count() {
            let data = self.blob();
            let count = read_u32(data, loc)? as usize;
            let address = read_u32(data, loc + 4)?;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + ANIMTREE_SINGLE_ENTRY_SIZE + j * 4)? as usize);
            }
            loc += ANIMTREE_SINGLE_ENTRY_SIZE + count * 4;

            let text = match read_cstr(self.blob(), address as usize) {
                Ok(s) => s.to_string(),
                Err(err) => {
                    warn!("animtree patch skipped (entry {}): {:#}", i, err);
                    continue;
                }
            };
            hash.add(&text);
            ctx.animtrees.insert(text.clone());
            let id = ctx.add_string(&text);
            if id > 0xFF {
                warn!("animtree patch skipped (entry {}): too many single animtrees", i);
                continue;
            }
            for addr in fixups {
                if let Err(err) = write_u8(self.blob_mut(), addr, id as u8) {
                    warn!("animtree patch skipped (entry {}): {:#}", i, err);
                }
            }
        }

        for (i, entry) in self.string_entries()?.into_iter().enumerate() {
            let text = match self.decrypt_string(entry.address) {
                Ok(text) => text,
                Err(err) => {
                    warn!("string patch skipped (entry {}): {:#}", i, err);
                    continue;
                }
            };
            hash.add(&text);
            dumped_strings.insert(text.clone());
            let id = ctx.add_string(&text);
            for addr in entry.fixups {
                if let Err(err) = write_u32(self.blob_mut(), addr as usize, id) {
                    warn!("string patch skipped (entry {}): {:#}", i, err);
                }
            }
        }

        // imports become interned records referenced by a 16-bit id
        let mut loc = self.imports_offset() as usize;
        for i in 0..self.imports_count() {
            let data = self.blob();
            let name = read_u64(data, loc)?;
            let namespace = read_u64(data, loc + 8)?;
            let param_count = read_u8(data, loc + 16)?;
            let count = read_u8(data, loc + 17)? as usize;
            let flags = read_u16(data, loc + 18)? as u8;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + IMPORT64_ENTRY_SIZE + j * 4)? as usize);
            }
            loc += IMPORT64_ENTRY_SIZE + count * 4;

            let remapped = self.remap_flags_import(flags);
            for addr in fixups {
                let id = ctx.add_linked_import(ImportRecord {
                    namespace,
                    name,
                    param_count,
                    flags: remapped,
                });
                if let Err(err) = write_u16(self.blob_mut(), addr, id) {
                    warn!("import patch skipped (entry {}): {:#}", i, err);
                }
            }
        }

        // double animtrees: two interned string ids side by side
        let mut loc = self.animtree_double_offset() as usize;
        for i in 0..self.animtree_double_count() {
            let data = self.blob();
            let count = read_u32(data, loc)? as usize;
            let addr1 = read_u32(data, loc + 4)?;
            let addr2 = read_u32(data, loc + 8)?;
            let mut fixups = Vec::with_capacity(count);
            for j in 0..count {
                fixups.push(read_u32(data, loc + ANIMTREE_DOUBLE_ENTRY_SIZE + j * 4)? as usize);
            }
            loc += ANIMTREE_DOUBLE_ENTRY_SIZE + count * 4;

            let (s1, s2) = {
                let data = self.blob();
                match (read_cstr(data, addr1 as usize), read_cstr(data, addr2 as usize)) {
                    (Ok(a), Ok(b)) => (a.to_string(), b.to_string()),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!("animtree patch skipped (entry {}): {:#}", i, err);
                        continue;
                    }
                }
            };
            hash.add(&s1);
            hash.add(&s2);
            ctx.animtrees.insert(s1.clone());
            let ref1 = ctx.add_string(&s1);
            let ref2 = ctx.add_string(&s2);
            for addr in fixups {
                let blob = self.blob_mut();
                if let Err(err) =
                    write_u32(blob, addr, ref1).and_then(|_| write_u32(blob, addr + 4, ref2))
                {
                    warn!("animtree patch skipped (entry {}): {:#}", i, err);
                }
            }
        }
        Ok(())
    }
}

/// Shared header dump body: every Treyarch-family header prints the same
/// table summary shape.
fn dump_header_common(r: &dyn ScriptReader, out: &mut String) {
    let _ = writeln!(out, "// size ..... {} (0x{:x})", r.file_size(), r.file_size());
    let _ = writeln!(
        out,
        "// includes . {:<3} (offset: 0x{:x})",
        r.includes_count(),
        r.includes_offset()
    );
    let _ = writeln!(
        out,
        "// strings .. {:<3} (offset: 0x{:x})",
        r.strings_count(),
        r.strings_offset()
    );
    let _ = writeln!(
        out,
        "// exports .. {:<3} (offset: 0x{:x})",
        r.exports_count(),
        r.exports_offset()
    );
    let _ = writeln!(
        out,
        "// imports .. {:<3} (offset: 0x{:x})",
        r.imports_count(),
        r.imports_offset()
    );
}

// ---------------------------------------------------------------------------
// Black Ops 4 (hash32, 0x60 header)

mod t8 {
    pub const CRC: usize = 0x08;
    pub const NAME: usize = 0x10;
    pub const INCLUDE_OFFSET: usize = 0x18;
    pub const STRING_COUNT: usize = 0x1C;
    pub const EXPORTS_COUNT: usize = 0x1E;
    pub const INCLUDE_COUNT: usize = 0x20;
    pub const IMPORTS_COUNT: usize = 0x22;
    pub const STRING_OFFSET: usize = 0x24;
    pub const IMPORTS_OFFSET: usize = 0x28;
    pub const GLOBALVAR_COUNT: usize = 0x2C;
    pub const GLOBALVAR_OFFSET: usize = 0x30;
    pub const EXPORT_TABLE_OFFSET: usize = 0x34;
    pub const FIXUP_OFFSET: usize = 0x38;
    pub const FIXUP_COUNT: usize = 0x3C;
    pub const SCRIPT_SIZE: usize = 0x40;
    pub const UKN44: usize = 0x44;
    pub const CSEG_OFFSET: usize = 0x48;
    pub const CSEG_SIZE: usize = 0x4C;
    pub const UKN50: usize = 0x50;
    pub const UKN5C: usize = 0x5C;
    pub const SIZE: usize = 0x60;
}

pub struct T8Reader {
    data: Vec<u8>,
}

impl T8Reader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    fn u16_at(&self, off: usize) -> u16 {
        read_u16(&self.data, off).unwrap_or(0)
    }
    fn u32_at(&self, off: usize) -> u32 {
        read_u32(&self.data, off).unwrap_or(0)
    }
}

impl ScriptReader for T8Reader {
    fn blob(&self) -> &[u8] {
        &self.data
    }
    fn blob_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
    fn vm(&self) -> &'static VmInfo {
        vm_info(VM_T8).unwrap()
    }

    fn name(&self) -> u64 {
        read_u64(&self.data, t8::NAME).unwrap_or(0)
    }
    fn header_size(&self) -> usize {
        t8::SIZE
    }
    fn file_size(&self) -> u32 {
        self.u32_at(t8::SCRIPT_SIZE)
    }

    fn includes_count(&self) -> u16 {
        self.u16_at(t8::INCLUDE_COUNT)
    }
    fn includes_offset(&self) -> u32 {
        self.u32_at(t8::INCLUDE_OFFSET)
    }
    fn strings_count(&self) -> u16 {
        self.u16_at(t8::STRING_COUNT)
    }
    fn strings_offset(&self) -> u32 {
        self.u32_at(t8::STRING_OFFSET)
    }
    fn imports_count(&self) -> u16 {
        self.u16_at(t8::IMPORTS_COUNT)
    }
    fn imports_offset(&self) -> u32 {
        self.u32_at(t8::IMPORTS_OFFSET)
    }
    fn globals_count(&self) -> u16 {
        self.u16_at(t8::GLOBALVAR_COUNT)
    }
    fn globals_offset(&self) -> u32 {
        self.u32_at(t8::GLOBALVAR_OFFSET)
    }
    fn exports_count(&self) -> u16 {
        self.u16_at(t8::EXPORTS_COUNT)
    }
    fn exports_offset(&self) -> u32 {
        self.u32_at(t8::EXPORT_TABLE_OFFSET)
    }
    fn cseg_offset(&self) -> u32 {
        self.u32_at(t8::CSEG_OFFSET)
    }
    fn cseg_size(&self) -> u32 {
        self.u32_at(t8::CSEG_SIZE)
    }

    fn decrypt_string(&self, addr: u32) -> Result<String> {
        decrypt_hash32_string(&self.data, addr as usize, 2)
    }

    fn validate(&self, size: usize) -> bool {
        size >= t8::SIZE
            && read_u64(&self.data, 0)
                .map(|m| m == MAGIC_TREYARCH | ((VM_T8 as u64) << 56))
                .unwrap_or(false)
    }

    fn dump_header(&self, out: &mut String, test_header: bool) {
        let _ = writeln!(out, "// crc: 0x{:x}", self.u32_at(t8::CRC));
        dump_header_common(self, out);
        let _ = writeln!(
            out,
            "// globals .. {:<3} (offset: 0x{:x})",
            self.globals_count(),
            self.globals_offset()
        );
        let _ = writeln!(
            out,
            "// fixups ... {:<3} (offset: 0x{:x})",
            self.u32_at(t8::FIXUP_COUNT),
            self.u32_at(t8::FIXUP_OFFSET)
        );
        let _ = writeln!(out, "// cseg ..... 0x{:x} + 0x{:x}", self.cseg_offset(), self.cseg_size());
        if test_header {
            let _ = writeln!(out, "// ukn44 .... 0x{:x}", self.u32_at(t8::UKN44));
            let _ = writeln!(out, "// ukn50 .... 0x{:x}", self.u32_at(t8::UKN50));
            let _ = writeln!(out, "// ukn5c .... 0x{:x}", self.u16_at(t8::UKN5C));
        }
    }

    fn dump_experimental(&self, out: &mut String, _test_header: bool) {
        let count = self.u32_at(t8::FIXUP_COUNT) as usize;
        let mut loc = self.u32_at(t8::FIXUP_OFFSET) as usize;
        for _ in 0..count {
            let (offset, address) = match (read_u32(&self.data, loc), read_u32(&self.data, loc + 4)) {
                (Ok(o), Ok(a)) => (o, a),
                _ => break,
            };
            let _ = writeln!(out, "#fixup 0x{:x} = 0x{:x};", offset, address);
            loc += 8;
        }
        if count != 0 {
            out.push('\n');
        }
    }
}

// ---------------------------------------------------------------------------
// Cold War family (hash32, 0x68 header, encrypted strings, remapped flags)

mod cw {
    pub const CRC: usize = 0x08;
    pub const NAME: usize = 0x10;
    pub const FILE_SIZE: usize = 0x18;
    pub const UNK1C: usize = 0x1C;
    pub const INCLUDES_TABLE: usize = 0x20;
    pub const INCLUDES_COUNT: usize = 0x24;
    pub const EXPORTS_COUNT: usize = 0x26;
    pub const EXPORTS_TABLES: usize = 0x28;
    pub const STRING_OFFSET: usize = 0x2C;
    pub const STRING_COUNT: usize = 0x30;
    pub const IMPORTS_COUNT: usize = 0x32;
    pub const IMPORTS_OFFSET: usize = 0x34;
    pub const GLOBALVAR_OFFSET: usize = 0x38;
    pub const GLOBALVAR_COUNT: usize = 0x3C;
    pub const CSEG_OFFSET: usize = 0x40;
    pub const CSEG_SIZE: usize = 0x44;
    pub const UNK48: usize = 0x48;
    pub const UNK4C: usize = 0x4C;
    pub const SIZE: usize = 0x68;
}

/// T9 raw import call kinds, permuted relative to the canonical order.
const T9_IF_FUNCTION: u8 = 0x1;
const T9_IF_METHOD: u8 = 0x2;
const T9_IF_FUNCTION_THREAD: u8 = 0x3;
const T9_IF_METHOD_THREAD: u8 = 0x4;
const T9_IF_FUNC_METHOD: u8 = 0x5;
const T9_IF_FUNCTION_CHILDTHREAD: u8 = 0x6;
const T9_IF_METHOD_CHILDTHREAD: u8 = 0x7;

const T9_EF_LINKED: u8 = 0x01;
const T9_EF_AUTOEXEC: u8 = 0x02;
const T9_EF_CLASS_MEMBER: u8 = 0x04;
const T9_EF_PRIVATE: u8 = 0x08;
const T9_EF_CLASS_LINKED: u8 = 0x10;
const T9_EF_VE: u8 = 0x20;
const T9_EF_EVENT: u8 = 0x40;
const T9_EF_CLASS_DESTRUCTOR: u8 = 0x80;
const T9_EF_CLASS_VTABLE: u8 = 0x86;

macro_rules! cw_reader {
    ($name:ident, $vm:expr) => {
        pub struct $name {
            data: Vec<u8>,
        }

        impl $name {
            pub fn new(data: Vec<u8>) -> Self {
                Self { data }
            }

            fn u16_at(&self, off: usize) -> u16 {
                read_u16(&self.data, off).unwrap_or(0)
            }
            fn u32_at(&self, off: usize) -> u32 {
                read_u32(&self.data, off).unwrap_or(0)
            }
        }

        impl ScriptReader for $name {
            fn blob(&self) -> &[u8] {
                &self.data
            }
            fn blob_mut(&mut self) -> &mut [u8] {
                &mut self.data
            }
            fn vm(&self) -> &'static VmInfo {
                vm_info($vm).unwrap()
            }

            fn name(&self) -> u64 {
                read_u64(&self.data, cw::NAME).unwrap_or(0)
            }
            fn header_size(&self) -> usize {
                cw::SIZE
            }
            fn file_size(&self) -> u32 {
                self.u32_at(cw::FILE_SIZE)
            }

            fn includes_count(&self) -> u16 {
                self.u16_at(cw::INCLUDES_COUNT)
            }
            fn includes_offset(&self) -> u32 {
                self.u32_at(cw::INCLUDES_TABLE)
            }
            fn strings_count(&self) -> u16 {
                self.u16_at(cw::STRING_COUNT)
            }
            fn strings_offset(&self) -> u32 {
                self.u32_at(cw::STRING_OFFSET)
            }
            fn imports_count(&self) -> u16 {
                self.u16_at(cw::IMPORTS_COUNT)
            }
            fn imports_offset(&self) -> u32 {
                self.u32_at(cw::IMPORTS_OFFSET)
            }
            fn globals_count(&self) -> u16 {
                self.u16_at(cw::GLOBALVAR_COUNT)
            }
            fn globals_offset(&self) -> u32 {
                self.u32_at(cw::GLOBALVAR_OFFSET)
            }
            fn exports_count(&self) -> u16 {
                self.u16_at(cw::EXPORTS_COUNT)
            }
            fn exports_offset(&self) -> u32 {
                self.u32_at(cw::EXPORTS_TABLES)
            }
            fn cseg_offset(&self) -> u32 {
                self.u32_at(cw::CSEG_OFFSET)
            }
            fn cseg_size(&self) -> u32 {
                self.u32_at(cw::CSEG_SIZE)
            }

            fn decrypt_string(&self, addr: u32) -> Result<String> {
                decrypt_hash32_string(&self.data, addr as usize, 3)
            }

            fn remap_flags_import(&self, flags: u8) -> u8 {
                let mut nflags = match flags & CALLTYPE_MASK {
                    T9_IF_FUNC_METHOD => FUNC_METHOD,
                    T9_IF_FUNCTION => FUNCTION,
                    T9_IF_FUNCTION_THREAD => FUNCTION_THREAD,
                    T9_IF_FUNCTION_CHILDTHREAD => FUNCTION_CHILDTHREAD,
                    T9_IF_METHOD => METHOD,
                    T9_IF_METHOD_THREAD => METHOD_THREAD,
                    T9_IF_METHOD_CHILDTHREAD => METHOD_CHILDTHREAD,
                    other => other,
                };
                nflags |= flags & !CALLTYPE_MASK;
                nflags
            }

            fn remap_flags_export(&self, flags: u8) -> u8 {
                if flags == T9_EF_CLASS_VTABLE {
                    return CLASS_VTABLE;
                }
                let mut nflags = ExportFlags::empty();
                if flags & T9_EF_AUTOEXEC != 0 {
                    nflags |= ExportFlags::AUTOEXEC;
                }
                if flags & T9_EF_LINKED != 0 {
                    nflags |= ExportFlags::LINKED;
                }
                if flags & T9_EF_PRIVATE != 0 {
                    nflags |= ExportFlags::PRIVATE;
                }
                if flags & T9_EF_CLASS_MEMBER != 0 {
                    nflags |= ExportFlags::CLASS_MEMBER;
                }
                if flags & T9_EF_EVENT != 0 {
                    nflags |= ExportFlags::EVENT;
                }
                if flags & T9_EF_VE != 0 {
                    nflags |= ExportFlags::VE;
                }
                if flags & T9_EF_CLASS_LINKED != 0 {
                    nflags |= ExportFlags::CLASS_LINKED;
                }
                if flags & T9_EF_CLASS_DESTRUCTOR != 0 {
                    nflags |= ExportFlags::CLASS_DESTRUCTOR;
                }
                nflags.bits()
            }

            fn validate(&self, size: usize) -> bool {
                size >= cw::SIZE
                    && read_u64(&self.data, 0)
                        .map(|m| m == MAGIC_TREYARCH | (($vm as u64) << 56))
                        .unwrap_or(false)
            }

            fn dump_header(&self, out: &mut String, test_header: bool) {
                let _ = writeln!(out, "// crc: 0x{:x}", self.u32_at(cw::CRC));
                dump_header_common(self, out);
                let _ = writeln!(
                    out,
                    "// globals .. {:<3} (offset: 0x{:x})",
                    self.globals_count(),
                    self.globals_offset()
                );
                let _ = writeln!(
                    out,
                    "// cseg ..... 0x{:x} + 0x{:x}",
                    self.cseg_offset(),
                    self.cseg_size()
                );
                if test_header {
                    let _ = writeln!(out, "// unk1c .... 0x{:x}", self.u32_at(cw::UNK1C));
                    let _ = writeln!(out, "// unk48 .... 0x{:x}", self.u32_at(cw::UNK48));
                    let _ = writeln!(out, "// unk4c .... 0x{:x}", self.u32_at(cw::UNK4C));
                }
            }
        }
    };
}

cw_reader!(T937Reader, VM_T937);
cw_reader!(T9Reader, VM_T9);

// ---------------------------------------------------------------------------
// Modern Warfare III (wide-hash, 0x68 header, plain strings)

mod mw23 {
    pub const NAME: usize = 0x08;
    pub const UNK16: usize = 0x16;
    pub const INCLUDE_TABLE: usize = 0x18;
    pub const UNK1C: usize = 0x1C;
    pub const INCLUDES_COUNT: usize = 0x1E;
    pub const STRING_TABLE: usize = 0x20;
    pub const STRING_COUNT: usize = 0x24;
    pub const UNK26: usize = 0x26;
    pub const UNK28: usize = 0x28;
    pub const UNK2A: usize = 0x2A;
    pub const IMPORT_TABLE: usize = 0x2C;
    pub const IMPORTS_COUNT: usize = 0x30;
    pub const EXPORT_COUNT: usize = 0x32;
    pub const EXPORT_OFFSET: usize = 0x34;
    pub const ANIMTREE_USE_OFFSET: usize = 0x38;
    pub const ANIMTREE_USE_COUNT: usize = 0x3C;
    pub const ANIMTREE_COUNT: usize = 0x3E;
    pub const ANIMTREE_OFFSET: usize = 0x40;
    pub const CSEG_OFFSET: usize = 0x44;
    pub const SIZE1: usize = 0x48;
    pub const CSEG_SIZE: usize = 0x4C;
    pub const SIZE2: usize = 0x54;
    pub const UNK5C: usize = 0x5C;
    pub const SIZE: usize = 0x68;
}

pub struct Mw23Reader {
    data: Vec<u8>,
}

impl Mw23Reader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    fn u16_at(&self, off: usize) -> u16 {
        read_u16(&self.data, off).unwrap_or(0)
    }
    fn u32_at(&self, off: usize) -> u32 {
        read_u32(&self.data, off).unwrap_or(0)
    }
}

impl ScriptReader for Mw23Reader {
    fn blob(&self) -> &[u8] {
        &self.data
    }
    fn blob_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
    fn vm(&self) -> &'static VmInfo {
        vm_info(VM_MW23).unwrap()
    }

    fn name(&self) -> u64 {
        read_u64(&self.data, mw23::NAME).unwrap_or(0)
    }
    fn header_size(&self) -> usize {
        mw23::SIZE
    }
    fn file_size(&self) -> u32 {
        self.u32_at(mw23::SIZE1)
    }

    fn includes_count(&self) -> u16 {
        self.u16_at(mw23::INCLUDES_COUNT)
    }
    fn includes_offset(&self) -> u32 {
        self.u32_at(mw23::INCLUDE_TABLE)
    }
    fn strings_count(&self) -> u16 {
        self.u16_at(mw23::STRING_COUNT)
    }
    fn strings_offset(&self) -> u32 {
        self.u32_at(mw23::STRING_TABLE)
    }
    fn imports_count(&self) -> u16 {
        self.u16_at(mw23::IMPORTS_COUNT)
    }
    fn imports_offset(&self) -> u32 {
        self.u32_at(mw23::IMPORT_TABLE)
    }
    fn animtree_single_count(&self) -> u16 {
        self.u16_at(mw23::ANIMTREE_USE_COUNT)
    }
    fn animtree_single_offset(&self) -> u32 {
        self.u32_at(mw23::ANIMTREE_USE_OFFSET)
    }
    fn animtree_double_count(&self) -> u16 {
        self.u16_at(mw23::ANIMTREE_COUNT)
    }
    fn animtree_double_offset(&self) -> u32 {
        self.u32_at(mw23::ANIMTREE_OFFSET)
    }
    fn exports_count(&self) -> u16 {
        self.u16_at(mw23::EXPORT_COUNT)
    }
    fn exports_offset(&self) -> u32 {
        self.u32_at(mw23::EXPORT_OFFSET)
    }
    fn cseg_offset(&self) -> u32 {
        self.u32_at(mw23::CSEG_OFFSET)
    }
    fn cseg_size(&self) -> u32 {
        self.u32_at(mw23::CSEG_SIZE)
    }

    fn decrypt_string(&self, addr: u32) -> Result<String> {
        // iw stores literals in clear
        Ok(read_cstr(&self.data, addr as usize)?.to_string())
    }

    fn remap_flags_import(&self, flags: u8) -> u8 {
        let mut nflags = match flags & CALLTYPE_MASK {
            5 => FUNC_METHOD,
            4 => FUNCTION,
            2 => FUNCTION_THREAD,
            1 => FUNCTION_CHILDTHREAD,
            3 | 6 | 7 => {
                // TODO: unknown script call kinds, coerced until understood
                debug!("mw23 import call kind {:#x} coerced to function", flags & CALLTYPE_MASK);
                FUNCTION
            }
            8 | 0xA => FUNCTION | GET_CALL, // api call
            9 | 0xB => METHOD | GET_CALL,   // api call
            other => other,
        };
        nflags |= flags & !CALLTYPE_MASK;
        nflags
    }

    fn remap_flags_export(&self, flags: u8) -> u8 {
        let mut nflags = ExportFlags::empty();
        if flags & 0x01 != 0 {
            nflags |= ExportFlags::AUTOEXEC;
        }
        if flags & 0x02 != 0 {
            nflags |= ExportFlags::LINKED;
        }
        if flags & 0x04 != 0 {
            nflags |= ExportFlags::PRIVATE;
        }
        nflags.bits()
    }

    fn validate(&self, size: usize) -> bool {
        size >= mw23::SIZE
            && read_u64(&self.data, 0)
                .map(|m| m & MAGIC_MASK == MAGIC_IW)
                .unwrap_or(false)
    }

    fn dump_header(&self, out: &mut String, test_header: bool) {
        dump_header_common(self, out);
        let _ = writeln!(
            out,
            "// animtree1 . {:<3} (offset: 0x{:x})",
            self.animtree_single_count(),
            self.animtree_single_offset()
        );
        let _ = writeln!(
            out,
            "// animtree2 . {:<3} (offset: 0x{:x})",
            self.animtree_double_count(),
            self.animtree_double_offset()
        );
        let _ = writeln!(out, "// cseg ..... 0x{:x} + 0x{:x}", self.cseg_offset(), self.cseg_size());
        if test_header {
            let _ = writeln!(out, "// unk16 .... 0x{:x}", self.u16_at(mw23::UNK16));
            let _ = writeln!(out, "// unk1C .... 0x{:x}", self.u16_at(mw23::UNK1C));
            let _ = writeln!(out, "// unk26 .... 0x{:x}", self.u16_at(mw23::UNK26));
            let _ = writeln!(out, "// unk28 .... 0x{:x}", self.u16_at(mw23::UNK28));
            let _ = writeln!(out, "// unk2A .... 0x{:x}", self.u16_at(mw23::UNK2A));
            let _ = writeln!(out, "// unk54 .... 0x{:x}", self.u32_at(mw23::SIZE2));
            let _ = writeln!(out, "// unk5C .... 0x{:x}", self.u32_at(mw23::UNK5C));
        }
    }

    fn dump_experimental(&self, out: &mut String, test_header: bool) {
        if !test_header {
            return;
        }
        // animtree tables, raw: useful while mapping new revisions
        let mut loc = self.animtree_single_offset() as usize;
        for _ in 0..self.animtree_single_count() {
            let (count, address) = match (read_u32(&self.data, loc), read_u32(&self.data, loc + 4)) {
                (Ok(c), Ok(a)) => (c as usize, a),
                _ => break,
            };
            if let Ok(s) = read_cstr(&self.data, address as usize) {
                let _ = writeln!(out, "animtree #{}", s);
            }
            loc += ANIMTREE_SINGLE_ENTRY_SIZE + count * 4;
        }
    }
}

/// Hash32-family string literal: a type byte, a length-prefixed payload and
/// `prefix` header bytes. Clear storage is marked by `(type & 0xC0) == 0x80`;
/// anything else is engine-encrypted and surfaced as a placeholder.
fn decrypt_hash32_string(data: &[u8], addr: usize, prefix: usize) -> Result<String> {
    let kind = read_u8(data, addr)?;
    if kind & 0xC0 != 0x80 {
        debug!("encrypted string (type {:#x}) at {:#x}", kind, addr);
        return Ok(format!("<encrypted:{:#x}>", kind));
    }
    let len = read_u8(data, addr + prefix - 1)? as usize;
    let len = len.saturating_sub(1);
    let start = addr + prefix;
    if start + len > data.len() {
        bail!("bad string location at {:#x}", addr);
    }
    match std::str::from_utf8(&data[start..start + len]) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => bail!("non-utf8 string literal at {:#x}", addr),
    }
}

/// Build the reader for a VM revision. The blob must already be stripped of
/// any GSIC wrapper.
pub fn reader_for(vm: u8, data: Vec<u8>) -> Option<Box<dyn ScriptReader>> {
    match vm {
        VM_T8 => Some(Box::new(T8Reader::new(data))),
        VM_T937 => Some(Box::new(T937Reader::new(data))),
        VM_T9 => Some(Box::new(T9Reader::new(data))),
        VM_MW23 => Some(Box::new(Mw23Reader::new(data))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_info;

    fn t8_header() -> Vec<u8> {
        let mut data = vec![0u8; t8::SIZE];
        data[..8].copy_from_slice(&(MAGIC_TREYARCH | ((VM_T8 as u64) << 56)).to_le_bytes());
        data[t8::SCRIPT_SIZE..t8::SCRIPT_SIZE + 4]
            .copy_from_slice(&(t8::SIZE as u32).to_le_bytes());
        data
    }

    #[test]
    fn t8_validate_checks_magic_and_size() {
        let data = t8_header();
        let r = T8Reader::new(data.clone());
        assert!(r.validate(data.len()));
        assert!(!r.validate(t8::SIZE - 1));

        let mut bad = data;
        bad[1] = 0xFF;
        let r = T8Reader::new(bad);
        assert!(!r.validate(t8::SIZE));
    }

    #[test]
    fn t9_remaps_vtable_value() {
        let r = T9Reader::new(vec![0u8; cw::SIZE]);
        assert_eq!(r.remap_flags_export(T9_EF_CLASS_VTABLE), CLASS_VTABLE);
        assert_eq!(
            r.remap_flags_export(T9_EF_AUTOEXEC | T9_EF_LINKED),
            (ExportFlags::AUTOEXEC | ExportFlags::LINKED).bits()
        );
        assert_eq!(r.remap_flags_import(T9_IF_METHOD_THREAD | DEV_CALL), METHOD_THREAD | DEV_CALL);
    }

    #[test]
    fn mw23_coerces_unknown_call_kinds() {
        let r = Mw23Reader::new(vec![0u8; mw23::SIZE]);
        assert_eq!(r.remap_flags_import(3) & CALLTYPE_MASK, FUNCTION);
        assert_eq!(r.remap_flags_import(6) & CALLTYPE_MASK, FUNCTION);
        assert_eq!(r.remap_flags_import(7) & CALLTYPE_MASK, FUNCTION);
        assert_eq!(r.remap_flags_import(8), FUNCTION | GET_CALL);
        assert_eq!(r.remap_flags_import(9), METHOD | GET_CALL);
    }

    #[test]
    fn clear_string_decode() {
        let mut data = vec![0u8; 0x20];
        data[0x10] = 0x80; // clear marker
        data[0x11] = 4; // len + 1
        data[0x12..0x15].copy_from_slice(b"abc");
        assert_eq!(decrypt_hash32_string(&data, 0x10, 2).unwrap(), "abc");

        data[0x10] = 0x42; // encrypted type
        assert!(decrypt_hash32_string(&data, 0x10, 2).unwrap().starts_with("<encrypted:"));
    }

    #[test]
    fn export_entry_round_trip() {
        let mut data = vec![0u8; 0x30];
        // hash32 layout
        data[0x00..0x04].copy_from_slice(&0x11u32.to_le_bytes()); // checksum
        data[0x04..0x08].copy_from_slice(&0x80u32.to_le_bytes()); // address
        data[0x08..0x0C].copy_from_slice(&0x22u32.to_le_bytes()); // name
        data[0x0C..0x10].copy_from_slice(&0x33u32.to_le_bytes()); // namespace
        data[0x14] = 2;
        data[0x15] = ExportFlags::LINKED.bits();
        let e = read_export(&data, 0, false).unwrap();
        assert_eq!(e.address, 0x80);
        assert_eq!(e.name, 0x22);
        assert_eq!(e.param_count, 2);
        assert_eq!(e.flags, ExportFlags::LINKED.bits());
    }

    #[test]
    fn reader_for_rejects_unknown_vm() {
        assert!(reader_for(0x99, Vec::new()).is_none());
        assert!(reader_for(VM_T8, t8_header()).is_some());
        assert!(vm_info(VM_T9).is_some());
    }
}
