use anyhow::{bail, Result};
use bitflags::bitflags;

/// Treyarch family magic, low 7 bytes: `80 47 53 43 0D 0A 00`; the top byte
/// carries the VM revision.
pub const MAGIC_TREYARCH: u64 = 0x00000a0d43534780;
/// Wide-hash (IW) family magic, low 7 bytes: `8A 47 53 43 0D 0A 00`; the top
/// byte is unused and the VM comes from user input.
pub const MAGIC_IW: u64 = 0x00000a0d4353478a;

pub const MAGIC_MASK: u64 = !0xFF00_0000_0000_0000;

/// A header can't be smaller than magic(8) + crc(4) + pad(4) + name(8).
pub const MIN_FILE_SIZE: usize = 0x18;

pub const VM_T8: u8 = 0x36;
pub const VM_T937: u8 = 0x37;
pub const VM_T9: u8 = 0x38;
pub const VM_MW23: u8 = 0x8A;

bitflags! {
    /// Capability bits of a VM dialect. Data on the descriptor, not subclasses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u16 {
        /// Opcodes are aligned 16-bit halfwords instead of single bytes.
        const OPCODE_SHORT = 0x0001;
        /// Tables store full 64-bit hashes (wide-hash family).
        const HASH64 = 0x0002;
        /// The second export namespace field holds the full file name.
        const FULL_FILE_NAMESPACE = 0x0004;
        /// The VM has no numeric revision to print in headers.
        const NO_VERSION = 0x0008;
        /// Local variable declarations carry no per-parameter flag byte.
        const NO_PARAM_FLAGS = 0x0010;
        /// Local variables are referenced by id rather than name hash.
        const VAR_ID = 0x0020;
        /// The on-disk form has no magic; the VM must come from user input.
        const NO_MAGIC = 0x0040;
        /// IW-like dialect quirks (call-kind table, plain strings).
        const IW_LIKE = 0x0080;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmInfo {
    pub vm: u8,
    pub name: &'static str,
    /// Short code accepted by `--vm`.
    pub code: &'static str,
    pub flags: VmFlags,
}

impl VmInfo {
    pub fn has(&self, flags: VmFlags) -> bool {
        self.flags.contains(flags)
    }
}

pub const VMS: &[VmInfo] = &[
    VmInfo {
        vm: VM_T8,
        name: "Black Ops 4",
        code: "t8",
        flags: VmFlags::OPCODE_SHORT,
    },
    VmInfo {
        vm: VM_T937,
        name: "Cold War Alpha",
        code: "t937",
        flags: VmFlags::OPCODE_SHORT,
    },
    VmInfo {
        vm: VM_T9,
        name: "Cold War",
        code: "t9",
        flags: VmFlags::OPCODE_SHORT,
    },
    VmInfo {
        vm: VM_MW23,
        name: "Modern Warfare III (2023)",
        code: "mw23",
        flags: VmFlags::HASH64
            .union(VmFlags::FULL_FILE_NAMESPACE)
            .union(VmFlags::NO_VERSION)
            .union(VmFlags::IW_LIKE),
    },
];

pub fn vm_info(vm: u8) -> Option<&'static VmInfo> {
    VMS.iter().find(|i| i.vm == vm)
}

pub fn vm_of(code: &str) -> Option<&'static VmInfo> {
    VMS.iter().find(|i| i.code.eq_ignore_ascii_case(code))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Platform {
    #[default]
    Pc,
    Playstation,
    Xbox,
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::Pc => "pc",
            Platform::Playstation => "ps",
            Platform::Xbox => "xbox",
        }
    }
}

pub fn platform_of(name: &str) -> Result<Platform> {
    match name.to_ascii_lowercase().as_str() {
        "pc" => Ok(Platform::Pc),
        "ps" | "ps4" | "ps5" | "playstation" => Ok(Platform::Playstation),
        "xbox" | "xb" => Ok(Platform::Xbox),
        _ => bail!("unknown platform: {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn treyarch_magic_matches_disk_bytes() {
        let bytes = [0x80u8, 0x47, 0x53, 0x43, 0x0D, 0x0A, 0x00, 0x36];
        let magic = u64::from_le_bytes(bytes);
        assert_eq!(magic & MAGIC_MASK, MAGIC_TREYARCH);
        assert_eq!((magic >> 56) as u8, VM_T8);
    }

    #[test]
    fn vm_lookup() {
        assert_eq!(vm_of("mw23").map(|i| i.vm), Some(VM_MW23));
        assert_eq!(vm_of("T9").map(|i| i.vm), Some(VM_T9));
        assert!(vm_of("unknown").is_none());
        assert!(vm_info(VM_T937).unwrap().has(VmFlags::OPCODE_SHORT));
        assert!(vm_info(VM_MW23).unwrap().has(VmFlags::HASH64));
    }

    #[test]
    fn platform_names() {
        assert_eq!(platform_of("pc").unwrap(), Platform::Pc);
        assert_eq!(platform_of("PS").unwrap(), Platform::Playstation);
        assert!(platform_of("wii").is_err());
    }
}
