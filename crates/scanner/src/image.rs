//! Header validation and descriptor lookup over a borrowed image buffer.

use crate::directive::Directives;
use crate::FormatError;
use common::{
    CpuTarget, EncryptionInfo, CRYPTID_OFFSET, CRYPTOFF_OFFSET, CRYPTSIZE_OFFSET,
    ENCRYPTION_INFO_64_SIZE, LC_ENCRYPTION_INFO_64, MACH_HEADER_64_SIZE, MH_MAGIC_64,
};
use tracing::{debug, info, warn};

/// Reads a little-endian `u32` at `offset`, or `None` if it would run past `data`.
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes = data.get(offset..end)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// The fields of `mach_header_64` this tool looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader {
    pub magic: u32,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    /// Number of load directives; drives the walk.
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl MachHeader {
    pub fn cpu_target(&self) -> CpuTarget {
        CpuTarget {
            cpu_type: self.cpu_type,
            cpu_subtype: self.cpu_subtype,
        }
    }
}

/// A validated thin arm64 Mach-O image borrowed from a mapping.
///
/// Only lives as long as the bytes it borrows; never persisted.
#[derive(Debug, Clone, Copy)]
pub struct BinaryImage<'a> {
    bytes: &'a [u8],
    header: MachHeader,
}

impl<'a> BinaryImage<'a> {
    /// Validates the header of `bytes`.
    ///
    /// # Errors
    /// - `FormatError::Truncated` if the buffer cannot hold a 32-byte header.
    /// - `FormatError::BadMagic` for anything but `MH_MAGIC_64` (fat binaries included).
    /// - `FormatError::UnsupportedCpu` for anything but arm64 / `CPU_SUBTYPE_ARM64_ALL`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        if bytes.len() < MACH_HEADER_64_SIZE {
            return Err(FormatError::Truncated { len: bytes.len() });
        }
        let field = |offset: usize| {
            read_u32(bytes, offset).ok_or(FormatError::Truncated { len: bytes.len() })
        };

        let header = MachHeader {
            magic: field(0)?,
            cpu_type: field(4)?,
            cpu_subtype: field(8)?,
            file_type: field(12)?,
            ncmds: field(16)?,
            sizeofcmds: field(20)?,
            flags: field(24)?,
        };

        if header.magic != MH_MAGIC_64 {
            return Err(FormatError::BadMagic {
                found: header.magic,
            });
        }
        if header.cpu_target() != CpuTarget::ARM64_ALL {
            return Err(FormatError::UnsupportedCpu {
                cpu_type: header.cpu_type,
                cpu_subtype: header.cpu_subtype,
            });
        }

        debug!(
            ncmds = header.ncmds,
            sizeofcmds = header.sizeofcmds,
            file_type = header.file_type,
            "validated Mach-O header"
        );
        Ok(Self { bytes, header })
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Walks the load directives in storage order.
    pub fn directives(&self) -> Directives<'a> {
        Directives::new(self.bytes, self.header.ncmds)
    }

    /// Every encryption descriptor in storage order.
    ///
    /// The container format carries at most one; this exists so callers can
    /// check that, while [`BinaryImage::find_encryption_info`] stops early.
    pub fn encryption_descriptors(
        &self,
    ) -> impl Iterator<Item = Result<EncryptionInfo, FormatError>> + 'a {
        let bytes = self.bytes;
        self.directives().filter_map(move |directive| match directive {
            Ok(d) if d.kind == LC_ENCRYPTION_INFO_64 => Some(decode_encryption_info(bytes, &d)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    }

    /// Returns the first `LC_ENCRYPTION_INFO_64` directive, or `None` once the
    /// walk completes without one.
    ///
    /// The returned range is guaranteed to lie inside the image.
    pub fn find_encryption_info(&self) -> Result<Option<EncryptionInfo>, FormatError> {
        match self.encryption_descriptors().next() {
            Some(Ok(info)) => {
                info!(
                    offset = info.command_offset,
                    cryptoff = info.crypt_offset,
                    cryptsize = info.crypt_size,
                    cryptid = info.crypt_id,
                    "found encryption descriptor"
                );
                if cfg!(debug_assertions) {
                    if let Some(extra) = self.second_descriptor() {
                        warn!(
                            first = info.command_offset,
                            second = extra.command_offset,
                            "image carries more than one encryption descriptor; using the first"
                        );
                    }
                }
                Ok(Some(info))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// A well-formed second descriptor, if the image has one.
    fn second_descriptor(&self) -> Option<EncryptionInfo> {
        self.encryption_descriptors().nth(1).and_then(Result::ok)
    }
}

fn decode_encryption_info(
    bytes: &[u8],
    directive: &crate::LoadDirective,
) -> Result<EncryptionInfo, FormatError> {
    if (directive.size as usize) < ENCRYPTION_INFO_64_SIZE {
        return Err(FormatError::DirectiveTooSmall {
            index: directive.index,
            offset: directive.offset,
            size: directive.size,
            min: ENCRYPTION_INFO_64_SIZE,
        });
    }

    // The directive walk already proved [offset, offset + size) is in bounds.
    let body = &bytes[directive.offset..directive.offset + directive.size as usize];
    let field = |offset: usize| {
        read_u32(body, offset).ok_or(FormatError::DirectiveHeaderOverrun {
            index: directive.index,
            offset: directive.offset,
        })
    };

    let info = EncryptionInfo {
        command_offset: directive.offset,
        crypt_offset: field(CRYPTOFF_OFFSET)?,
        crypt_size: field(CRYPTSIZE_OFFSET)?,
        crypt_id: field(CRYPTID_OFFSET)?,
    };

    let end = (info.crypt_offset as u64) + (info.crypt_size as u64);
    if end > bytes.len() as u64 {
        return Err(FormatError::CryptRangeOutOfBounds {
            offset: info.crypt_offset,
            size: info.crypt_size,
            len: bytes.len(),
        });
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CPU_SUBTYPE_ARM64_ALL, CPU_TYPE_ARM64};

    const LC_UUID: u32 = 0x1b;

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds an arm64 image of `len` bytes from `(kind, size, body)` directives.
    fn image(len: usize, directives: &[(u32, u32, &[u32])]) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        put_u32(&mut buf, 0, MH_MAGIC_64);
        put_u32(&mut buf, 4, CPU_TYPE_ARM64);
        put_u32(&mut buf, 8, CPU_SUBTYPE_ARM64_ALL);
        put_u32(&mut buf, 12, 2); // MH_EXECUTE
        put_u32(&mut buf, 16, directives.len() as u32);
        let total: u32 = directives.iter().map(|d| d.1).sum();
        put_u32(&mut buf, 20, total);

        let mut offset = MACH_HEADER_64_SIZE;
        for (kind, size, body) in directives {
            put_u32(&mut buf, offset, *kind);
            put_u32(&mut buf, offset + 4, *size);
            for (i, word) in body.iter().enumerate() {
                put_u32(&mut buf, offset + 8 + i * 4, *word);
            }
            offset += *size as usize;
        }
        buf
    }

    #[test]
    fn test_finds_second_directive() {
        let bytes = image(
            4096,
            &[
                (LC_UUID, 24, &[]),
                (LC_ENCRYPTION_INFO_64, 24, &[1024, 512, 1, 0]),
            ],
        );
        let img = BinaryImage::parse(&bytes).unwrap();
        let info = img.find_encryption_info().unwrap().unwrap();
        assert_eq!(info.command_offset, MACH_HEADER_64_SIZE + 24);
        assert_eq!(info.crypt_offset, 1024);
        assert_eq!(info.crypt_size, 512);
        assert_eq!(info.crypt_id, 1);
    }

    #[test]
    fn test_no_descriptor() {
        let bytes = image(1024, &[(LC_UUID, 24, &[]), (LC_UUID, 24, &[])]);
        let img = BinaryImage::parse(&bytes).unwrap();
        assert_eq!(img.find_encryption_info().unwrap(), None);
    }

    #[test]
    fn test_single_descriptor_in_image() {
        let bytes = image(
            4096,
            &[
                (LC_ENCRYPTION_INFO_64, 24, &[2048, 1024, 7, 0]),
                (LC_UUID, 24, &[]),
            ],
        );
        let img = BinaryImage::parse(&bytes).unwrap();
        let all: Vec<_> = img.encryption_descriptors().collect();
        assert_eq!(all.len(), 1);
        assert!(all[0].as_ref().unwrap().is_encrypted());
    }

    #[test]
    fn test_second_descriptor_does_not_change_result() {
        let bytes = image(
            4096,
            &[
                (LC_ENCRYPTION_INFO_64, 24, &[1024, 512, 1, 0]),
                (LC_ENCRYPTION_INFO_64, 24, &[2048, 512, 2, 0]),
            ],
        );
        let img = BinaryImage::parse(&bytes).unwrap();
        let first = img.find_encryption_info().unwrap().unwrap();
        assert_eq!(first.crypt_offset, 1024);
        assert_eq!(first.crypt_id, 1);

        let extra = img.second_descriptor().unwrap();
        assert_eq!(extra.command_offset, MACH_HEADER_64_SIZE + 24);
        assert_eq!(extra.crypt_id, 2);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = image(256, &[]);
        put_u32(&mut bytes, 0, 0xcafe_babe);
        assert_eq!(
            BinaryImage::parse(&bytes).unwrap_err(),
            FormatError::BadMagic { found: 0xcafe_babe }
        );
    }

    #[test]
    fn test_wrong_cpu_rejected() {
        let mut bytes = image(256, &[]);
        put_u32(&mut bytes, 4, 0x0100_0007); // x86_64
        assert!(matches!(
            BinaryImage::parse(&bytes),
            Err(FormatError::UnsupportedCpu { .. })
        ));

        let mut bytes = image(256, &[]);
        put_u32(&mut bytes, 8, 2); // arm64e
        assert!(matches!(
            BinaryImage::parse(&bytes),
            Err(FormatError::UnsupportedCpu { cpu_subtype: 2, .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            BinaryImage::parse(&[0xcf, 0xfa, 0xed, 0xfe]).unwrap_err(),
            FormatError::Truncated { len: 4 }
        );
    }

    #[test]
    fn test_crypt_range_past_end() {
        let bytes = image(
            2048,
            &[(LC_ENCRYPTION_INFO_64, 24, &[1024, 4096, 1, 0])],
        );
        let img = BinaryImage::parse(&bytes).unwrap();
        assert!(matches!(
            img.find_encryption_info(),
            Err(FormatError::CryptRangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_short_encryption_directive() {
        let bytes = image(512, &[(LC_ENCRYPTION_INFO_64, 16, &[0, 0])]);
        let img = BinaryImage::parse(&bytes).unwrap();
        assert!(matches!(
            img.find_encryption_info(),
            Err(FormatError::DirectiveTooSmall { min: 24, .. })
        ));
    }
}
