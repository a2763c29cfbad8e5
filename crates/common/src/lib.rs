pub mod region;

pub use region::{Access, MappedRegion, RegionError};

/// 64-bit Mach-O magic (`MH_MAGIC_64`), little-endian on disk.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

/// `CPU_ARCH_ABI64` flag OR'd into 64-bit CPU types.
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// `CPU_TYPE_ARM64` (`CPU_TYPE_ARM | CPU_ARCH_ABI64`).
pub const CPU_TYPE_ARM64: u32 = 12 | CPU_ARCH_ABI64;
/// `CPU_SUBTYPE_ARM64_ALL`.
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

/// `LC_ENCRYPTION_INFO_64` load command kind.
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

/// Size of `mach_header_64`; the load command stream starts right after it.
pub const MACH_HEADER_64_SIZE: usize = 32;
/// Size of the `{cmd, cmdsize}` prefix shared by every load command.
pub const LOAD_COMMAND_SIZE: usize = 8;
/// Size of `encryption_info_command_64` (including its trailing pad word).
pub const ENCRYPTION_INFO_64_SIZE: usize = 24;

/// Field offsets inside `encryption_info_command_64`.
pub const CRYPTOFF_OFFSET: usize = 8;
pub const CRYPTSIZE_OFFSET: usize = 12;
pub const CRYPTID_OFFSET: usize = 16;

/// Architecture pair handed to the decryption capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuTarget {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
}

impl CpuTarget {
    /// The only architecture this tool accepts: arm64, "all" subtype.
    pub const ARM64_ALL: CpuTarget = CpuTarget {
        cpu_type: CPU_TYPE_ARM64,
        cpu_subtype: CPU_SUBTYPE_ARM64_ALL,
    };
}

/// An `LC_ENCRYPTION_INFO_64` directive located inside an image.
///
/// `command_offset` is the byte offset of the directive itself, which is the
/// same in the source and in its duplicate because the two share a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub command_offset: usize,
    pub crypt_offset: u32,
    pub crypt_size: u32,
    pub crypt_id: u32,
}

impl EncryptionInfo {
    /// Returns `true` while the range is still marked as encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.crypt_id != 0
    }

    /// Byte range `[crypt_offset, crypt_offset + crypt_size)` as `usize`s.
    pub fn crypt_range(&self) -> std::ops::Range<usize> {
        let start = self.crypt_offset as usize;
        start..start + self.crypt_size as usize
    }

    /// Absolute offset of the `cryptid` field within the image.
    pub fn crypt_id_offset(&self) -> usize {
        self.command_offset + CRYPTID_OFFSET
    }
}
