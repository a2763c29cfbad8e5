//! # The Patcher: Writable Duplicate & Descriptor Patch
//!
//! ## Workflow
//! 1. [`duplicate`] copies the source binary to the destination path.
//! 2. [`Patcher::open`] maps the duplicate read-write and shared, so stores
//!    land in the file.
//! 3. [`Patcher::check_crypt_id`] confirms the duplicate's descriptor matches
//!    the source before anything is written.
//! 4. The decryption step splices plaintext through [`Patcher::bytes_mut`].
//! 5. [`Patcher::clear_crypt_id`] zeroes the duplicate's `cryptid`, only
//!    after the splice succeeded, so the loader stops trying to decrypt.
//! 6. [`Patcher::commit`] flushes the mapping and releases it.
//!
//! If step 3 or 4 fails, steps 5 and 6 are skipped and the duplicate is still a
//! faithful, still-protected copy.

pub mod duplicate;

pub use duplicate::{duplicate, same_file, Duplication};

use common::{Access, EncryptionInfo, MappedRegion, RegionError};
use std::path::{Path, PathBuf};
use tracing::info;

/// Errors from duplication and patching.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("cannot read source {}: {source}", path.display())]
    OpenSource {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot create {}: {source}", path.display())]
    CreateDest {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("copy {} -> {} failed: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("duplicate cryptid at offset {offset} is {found}, expected {expected}; files differ in layout")]
    LayoutMismatch {
        offset: usize,
        expected: u32,
        found: u32,
    },
}

/// Read-write view of the output file.
#[derive(Debug)]
pub struct Patcher {
    dupe: MappedRegion,
}

impl Patcher {
    /// Maps the duplicate at `path` read-write, shared with storage.
    pub fn open(path: &Path) -> Result<Self, PatchError> {
        Ok(Self {
            dupe: MappedRegion::open(path, Access::ReadWrite, false)?,
        })
    }

    pub fn len(&self) -> usize {
        self.dupe.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dupe.is_empty()
    }

    pub fn path(&self) -> &Path {
        self.dupe.path()
    }

    pub fn bytes(&self) -> &[u8] {
        self.dupe.as_bytes()
    }

    /// Mutable bytes of the duplicate; writes reach the file.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], PatchError> {
        Ok(self.dupe.as_mut_bytes()?)
    }

    /// Confirms the duplicate's `cryptid` field still holds the value scanned
    /// from the source, i.e. both files share a layout.
    ///
    /// Must run before anything is spliced in: the encrypted range may cover
    /// the descriptor itself.
    pub fn check_crypt_id(&self, info: &EncryptionInfo) -> Result<(), PatchError> {
        let offset = info.crypt_id_offset();
        let found = self
            .bytes()
            .get(offset..offset + 4)
            .map(|field| {
                let mut current = [0u8; 4];
                current.copy_from_slice(field);
                u32::from_le_bytes(current)
            })
            .ok_or(PatchError::LayoutMismatch {
                offset,
                expected: info.crypt_id,
                found: 0,
            })?;
        if found != info.crypt_id {
            return Err(PatchError::LayoutMismatch {
                offset,
                expected: info.crypt_id,
                found,
            });
        }
        Ok(())
    }

    /// Zeroes the `cryptid` field of the duplicate's encryption descriptor,
    /// whatever it currently holds.
    ///
    /// Call [`Patcher::check_crypt_id`] first; after the splice the field may
    /// carry plaintext from the decrypted range.
    pub fn clear_crypt_id(&mut self, info: &EncryptionInfo) -> Result<(), PatchError> {
        let offset = info.crypt_id_offset();
        let field = self
            .bytes_mut()?
            .get_mut(offset..offset + 4)
            .ok_or(PatchError::LayoutMismatch {
                offset,
                expected: info.crypt_id,
                found: 0,
            })?;
        field.copy_from_slice(&0u32.to_le_bytes());
        info!(offset, "cleared cryptid");
        Ok(())
    }

    /// Flushes pending writes and unmaps the duplicate.
    pub fn commit(self) -> Result<(), PatchError> {
        self.dupe.flush()?;
        Ok(())
    }
}
