//! Ephemeral private mapping of exactly the encrypted byte range.
//!
//! `mmap` wants a page-aligned file offset, so the mapping starts at the
//! page boundary at or below the requested offset; [`CryptMapping`] hides
//! the slack and only ever exposes `[offset, offset + len)`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use tracing::debug;

/// Page protection requested for the encrypted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// `PROT_READ | PROT_EXEC`, what the kernel decryption path expects.
    ReadExec,
    /// `PROT_READ | PROT_WRITE`, for capabilities that write plaintext themselves.
    ReadWrite,
}

impl Protection {
    fn bits(self) -> libc::c_int {
        match self {
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// `MAP_PRIVATE` view of one byte range of a file, unmapped on drop.
pub struct CryptMapping {
    base: *mut libc::c_void,
    /// File offset of the first requested byte.
    offset: u64,
    /// Length of the whole mapping, slack included.
    mapped_len: usize,
    /// Distance from `base` to the first requested byte.
    slack: usize,
    len: usize,
    protection: Protection,
}

impl CryptMapping {
    /// Maps `len` bytes of `file` starting at `offset`.
    ///
    /// `len` must be nonzero.
    pub fn map(file: &File, offset: u64, len: usize, protection: Protection) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty range",
            ));
        }

        let page = page_size()?;
        let slack = (offset % page as u64) as usize;
        let aligned = offset - slack as u64;
        let mapped_len = len
            .checked_add(slack)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;
        let file_offset = libc::off_t::try_from(aligned)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;

        // SAFETY: a fresh mapping at a kernel-chosen address; nothing else
        // aliases it until this struct hands out views.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                protection.bits(),
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                file_offset,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        debug!(offset, len, slack, ?protection, "mapped encrypted range");
        Ok(Self {
            base,
            offset,
            mapped_len,
            slack,
            len,
            protection,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// File offset the exposed range starts at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// `true` when the exposed range starts on a page boundary, so
    /// [`CryptMapping::as_mut_ptr`] is the mapping's base address.
    pub fn is_page_aligned(&self) -> bool {
        self.slack == 0
    }

    /// Address of the first requested byte.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        // SAFETY: slack < page size <= mapped_len.
        unsafe { (self.base as *mut u8).add(self.slack) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: every protection includes PROT_READ and the range lies
        // inside the live mapping.
        unsafe { std::slice::from_raw_parts((self.base as *const u8).add(self.slack), self.len) }
    }

    /// Writable view; `None` unless mapped with [`Protection::ReadWrite`].
    pub fn as_mut_bytes(&mut self) -> Option<&mut [u8]> {
        if self.protection != Protection::ReadWrite {
            return None;
        }
        let len = self.len;
        let ptr = self.as_mut_ptr();
        // SAFETY: mapping is PROT_WRITE and exclusively borrowed through `self`.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }
}

impl Drop for CryptMapping {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len are exactly what mmap returned.
        unsafe {
            libc::munmap(self.base, self.mapped_len);
        }
    }
}

impl std::fmt::Debug for CryptMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptMapping")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("slack", &self.slack)
            .field("protection", &self.protection)
            .finish()
    }
}

fn page_size() -> io::Result<usize> {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn numbered_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_unaligned_offset_exposes_exact_range() {
        let tmp = numbered_file(8192);
        let file = File::open(tmp.path()).unwrap();

        let mapping = CryptMapping::map(&file, 1024, 512, Protection::ReadWrite).unwrap();
        assert_eq!(mapping.len(), 512);
        assert_eq!(mapping.offset(), 1024);
        assert!(!mapping.is_page_aligned());
        let expected: Vec<u8> = (1024..1536).map(|i| (i % 251) as u8).collect();
        assert_eq!(mapping.as_bytes(), expected.as_slice());
    }

    #[test]
    fn test_private_writes_do_not_reach_file() {
        let tmp = numbered_file(4096);
        let file = File::open(tmp.path()).unwrap();

        {
            let mut mapping = CryptMapping::map(&file, 0, 16, Protection::ReadWrite).unwrap();
            assert!(mapping.is_page_aligned());
            mapping.as_mut_bytes().unwrap().fill(0xAA);
            assert_eq!(mapping.as_bytes(), &[0xAA; 16]);
        }

        let on_disk = std::fs::read(tmp.path()).unwrap();
        assert_eq!(on_disk[0], 0);
        assert_eq!(on_disk[15], 15);
    }

    #[test]
    fn test_empty_range_rejected() {
        let tmp = numbered_file(64);
        let file = File::open(tmp.path()).unwrap();
        let err = CryptMapping::map(&file, 0, 0, Protection::ReadWrite).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
