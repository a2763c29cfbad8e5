//! Kernel-backed capability: `mremap_encrypted(2)` on Apple platforms.
//!
//! The call asks the kernel to re-fault the given executable mapping through
//! the protection scheme's pager, which leaves plaintext pages behind. The
//! pager daemon can be momentarily unavailable, so a nonzero status is
//! reported as [`DecryptError::Transient`]. The kernel only remaps whole
//! pages, so a range that does not start on a page boundary is refused with
//! [`DecryptError::Misaligned`] before the call.

use crate::{CryptMapping, DecryptError, Decryptor};
use common::CpuTarget;

#[cfg(target_vendor = "apple")]
extern "C" {
    fn mremap_encrypted(
        addr: *mut libc::c_void,
        len: libc::size_t,
        cryptid: u32,
        cputype: u32,
        cpusubtype: u32,
    ) -> libc::c_int;
}

/// The platform decryption service.
#[derive(Debug, Default, Clone, Copy)]
pub struct FairPlay;

impl Decryptor for FairPlay {
    fn decrypt(
        &self,
        mapping: &mut CryptMapping,
        crypt_id: u32,
        target: CpuTarget,
    ) -> Result<(), DecryptError> {
        if !mapping.is_page_aligned() {
            return Err(DecryptError::Misaligned {
                offset: mapping.offset(),
            });
        }
        remap(mapping, crypt_id, target)
    }
}

#[cfg(target_vendor = "apple")]
fn remap(mapping: &mut CryptMapping, crypt_id: u32, target: CpuTarget) -> Result<(), DecryptError> {
    let len = mapping.len();
    // SAFETY: the mapping is live, page-aligned, covers `len` bytes and is
    // exclusively borrowed for the duration of the call.
    let status = unsafe {
        mremap_encrypted(
            mapping.as_mut_ptr().cast(),
            len,
            crypt_id,
            target.cpu_type,
            target.cpu_subtype,
        )
    };
    if status != 0 {
        let source = std::io::Error::last_os_error();
        tracing::warn!(status, %source, "mremap_encrypted failed");
        return Err(DecryptError::Transient { status, source });
    }
    Ok(())
}

#[cfg(not(target_vendor = "apple"))]
fn remap(
    _mapping: &mut CryptMapping,
    _crypt_id: u32,
    _target: CpuTarget,
) -> Result<(), DecryptError> {
    Err(DecryptError::Unsupported(
        "mremap_encrypted is only provided by Apple kernels",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Protection;
    use std::io::Write;

    // Read/write mappings here: some CI mounts forbid PROT_EXEC file mappings.
    fn scratch(len: usize) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    #[test]
    fn test_unaligned_range_is_permanent_failure() {
        let file = scratch(8192);
        let mut mapping = CryptMapping::map(&file, 1024, 512, Protection::ReadWrite).unwrap();

        let err = FairPlay
            .decrypt(&mut mapping, 1, CpuTarget::ARM64_ALL)
            .unwrap_err();
        assert!(matches!(err, DecryptError::Misaligned { offset: 1024 }));
        assert!(!err.is_transient());
        assert!(!err.to_string().contains("try again"));
    }

    #[cfg(not(target_vendor = "apple"))]
    #[test]
    fn test_unsupported_off_apple() {
        assert_eq!(FairPlay.protection(), Protection::ReadExec);

        let file = scratch(64);
        let mut mapping = CryptMapping::map(&file, 0, 64, Protection::ReadWrite).unwrap();

        let err = FairPlay
            .decrypt(&mut mapping, 1, CpuTarget::ARM64_ALL)
            .unwrap_err();
        assert!(matches!(err, DecryptError::Unsupported(_)));
        assert!(!err.is_transient());
    }
}
