//! # The Driver: Obtaining Plaintext from the Decryption Capability
//!
//! The tool never decrypts anything itself. It maps the protected range of
//! the *original* file privately, hands that mapping to a [`Decryptor`], and
//! once the capability reports success copies the now-plaintext bytes into
//! the caller's buffer.
//!
//! ## Protocol
//! 1. Map `[cryptoff, cryptoff + cryptsize)` of the source with the
//!    protection the capability asks for ([`Decryptor::protection`]).
//! 2. Call [`Decryptor::decrypt`] with the mapping, `cryptid` and target CPU.
//! 3. On success, copy the mapped bytes to the same offset of `dest`.
//! 4. Drop the mapping, whatever happened in 2 or 3.
//!
//! A failed call leaves `dest` untouched.

pub mod fairplay;
pub mod mapping;

pub use fairplay::FairPlay;
pub use mapping::{CryptMapping, Protection};

use common::{CpuTarget, EncryptionInfo, MappedRegion};
use tracing::{info, warn};

/// Errors from the decryption step.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("source mapping for {0} was opened without keeping its file handle")]
    NoFileHandle(String),
    #[error("cannot map encrypted range [{offset}, {offset}+{size}): {source}")]
    Map {
        offset: u32,
        size: u32,
        source: std::io::Error,
    },
    #[error("encrypted range [{offset}, {offset}+{size}) does not fit the {len}-byte destination")]
    OutOfBounds { offset: u32, size: u32, len: usize },
    /// The capability refused for now; rerunning shortly usually succeeds.
    #[error(
        "decryption service failed (status {status}): {source}; please wait a second and try again"
    )]
    Transient {
        status: i32,
        source: std::io::Error,
    },
    /// The kernel service only remaps whole pages; retrying cannot help.
    #[error("encrypted range starts at {offset:#x}, which is not page-aligned")]
    Misaligned { offset: u64 },
    #[error("decryption capability unavailable: {0}")]
    Unsupported(&'static str),
}

impl DecryptError {
    /// `true` when rerunning the whole command later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DecryptError::Transient { .. })
    }
}

/// An opaque, privileged operation that decrypts a mapped range in place.
pub trait Decryptor {
    /// Protection the encrypted range must be mapped with.
    fn protection(&self) -> Protection {
        Protection::ReadExec
    }

    /// Decrypts `mapping` in place.
    ///
    /// Any `Err` must leave the caller free to discard the mapping; nothing
    /// is copied out of it.
    fn decrypt(
        &self,
        mapping: &mut CryptMapping,
        crypt_id: u32,
        target: CpuTarget,
    ) -> Result<(), DecryptError>;
}

/// Runs the capability over `info`'s range of `source` and splices the
/// plaintext into `dest` at the same offset.
///
/// `source` must have been opened with its file handle retained.
pub fn unprotect(
    decryptor: &dyn Decryptor,
    source: &MappedRegion,
    info: &EncryptionInfo,
    target: CpuTarget,
    dest: &mut [u8],
) -> Result<(), DecryptError> {
    let dest_len = dest.len();
    let out = dest
        .get_mut(info.crypt_range())
        .ok_or(DecryptError::OutOfBounds {
            offset: info.crypt_offset,
            size: info.crypt_size,
            len: dest_len,
        })?;

    if info.crypt_size == 0 {
        warn!(cryptoff = info.crypt_offset, "encrypted range is empty; nothing to decrypt");
        return Ok(());
    }

    let file = source
        .file()
        .ok_or_else(|| DecryptError::NoFileHandle(source.path().display().to_string()))?;

    let mut mapping = CryptMapping::map(
        file,
        u64::from(info.crypt_offset),
        info.crypt_size as usize,
        decryptor.protection(),
    )
    .map_err(|source| DecryptError::Map {
        offset: info.crypt_offset,
        size: info.crypt_size,
        source,
    })?;

    decryptor.decrypt(&mut mapping, info.crypt_id, target)?;

    out.copy_from_slice(mapping.as_bytes());
    info!(
        cryptoff = info.crypt_offset,
        cryptsize = info.crypt_size,
        "copied plaintext into duplicate"
    );
    Ok(())
}
