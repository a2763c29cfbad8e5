//! End-to-end run: source binary in, runnable plaintext duplicate out.
//!
//! Steps, in order:
//! 0. Map the source read-only (handle retained for the crypt mapping).
//! 1. Validate the header and locate the encryption descriptor. A bad image
//!    is rejected here, before the destination is created.
//! 2. Duplicate the source to the destination.
//! 3. Map the duplicate read-write and check it matches the source length.
//! 4. If the descriptor marks the range encrypted (or `force` is set), run
//!    the decryption capability and splice its plaintext in.
//! 5. Only on success, zero the duplicate's `cryptid` and flush. The field is
//!    checked against the source before step 4, since the decrypted range
//!    may cover it.
//!
//! Every mapping is owned by a value on this stack frame, so all of them are
//! released on every return path.

use common::{Access, EncryptionInfo, MappedRegion, RegionError};
use driver::{DecryptError, Decryptor};
use patcher::{PatchError, Patcher};
use scanner::{BinaryImage, FormatError};
use std::path::Path;
use tracing::{info, warn};

/// Knobs for a single run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Invoke the capability even when `cryptid` is already 0.
    pub force: bool,
}

/// What a successful run did to the duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Plaintext spliced in and `cryptid` cleared.
    Decrypted { crypt_offset: u32, crypt_size: u32 },
    /// The image has no encryption descriptor; the duplicate is a plain copy.
    NoDescriptor,
    /// The descriptor's `cryptid` is already 0; the duplicate is a plain copy.
    AlreadyPlaintext,
}

/// A failed run, tagged with the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("map source: {0}")]
    MapSource(#[source] RegionError),
    #[error("format: {0}")]
    Format(#[from] FormatError),
    #[error("copy: {0}")]
    Copy(#[source] PatchError),
    #[error("map duplicate: {0}")]
    MapDuplicate(#[source] PatchError),
    #[error("size mismatch: source is {source_len} bytes but duplicate is {duplicate_len}")]
    SizeMismatch {
        source_len: usize,
        duplicate_len: usize,
    },
    #[error("decryption: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("patch: {0}")]
    Patch(#[source] PatchError),
}

impl PipelineError {
    /// `true` when rerunning the same command shortly may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Decrypt(e) if e.is_transient())
    }
}

/// Produces a decrypted duplicate of `src` at `dest`.
pub fn run(
    src: &Path,
    dest: &Path,
    decryptor: &dyn Decryptor,
    options: RunOptions,
) -> Result<Outcome, PipelineError> {
    let source =
        MappedRegion::open(src, Access::ReadOnly, true).map_err(PipelineError::MapSource)?;
    let image = BinaryImage::parse(source.as_bytes())?;
    let descriptor = image.find_encryption_info()?;

    let duplication = patcher::duplicate(src, dest).map_err(PipelineError::Copy)?;
    info!(?duplication, "duplicate ready");

    let mut dupe = Patcher::open(dest).map_err(PipelineError::MapDuplicate)?;
    check_lengths(source.len(), dupe.len())?;

    let Some(descriptor) = descriptor else {
        info!("no encryption descriptor; duplicate left as a plain copy");
        return Ok(Outcome::NoDescriptor);
    };
    if !descriptor.is_encrypted() && !options.force {
        warn!("cryptid is already 0; skipping decryption (use --force to override)");
        return Ok(Outcome::AlreadyPlaintext);
    }

    decrypt_into(&mut dupe, decryptor, &source, &image, &descriptor)?;
    dupe.commit().map_err(PipelineError::Patch)?;

    Ok(Outcome::Decrypted {
        crypt_offset: descriptor.crypt_offset,
        crypt_size: descriptor.crypt_size,
    })
}

fn check_lengths(source_len: usize, duplicate_len: usize) -> Result<(), PipelineError> {
    if source_len != duplicate_len {
        return Err(PipelineError::SizeMismatch {
            source_len,
            duplicate_len,
        });
    }
    Ok(())
}

fn decrypt_into(
    dupe: &mut Patcher,
    decryptor: &dyn Decryptor,
    source: &MappedRegion,
    image: &BinaryImage<'_>,
    descriptor: &EncryptionInfo,
) -> Result<(), PipelineError> {
    // The range may cover the descriptor, so its field is checked up front
    // and overwritten unconditionally afterwards.
    dupe.check_crypt_id(descriptor)
        .map_err(PipelineError::Patch)?;
    let out = dupe.bytes_mut().map_err(PipelineError::Patch)?;
    driver::unprotect(
        decryptor,
        source,
        descriptor,
        image.header().cpu_target(),
        out,
    )?;
    dupe.clear_crypt_id(descriptor)
        .map_err(PipelineError::Patch)
}
