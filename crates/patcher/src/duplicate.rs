//! Byte-for-byte duplication of the source binary.

use crate::PatchError;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// What [`duplicate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplication {
    /// Source and destination are the same file; storage was not touched.
    SameFile,
    /// The destination now holds a copy of this many bytes.
    Copied(u64),
}

/// Returns `true` if `a` and `b` name the same file.
///
/// Textually equal paths always match; otherwise both must exist and
/// canonicalize to the same location.
pub fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (dunce::canonicalize(a), dunce::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copies `src` to `dest`, creating or truncating `dest`.
///
/// Copying a file onto itself is a successful no-op, so `dest` is never
/// truncated out from under its own source. The destination inherits the
/// source's permission bits so an executable stays executable.
///
/// # Errors
/// `PatchError::OpenSource`, `PatchError::CreateDest` or `PatchError::Copy`.
/// Both handles are closed on every path.
pub fn duplicate(src: &Path, dest: &Path) -> Result<Duplication, PatchError> {
    if same_file(src, dest) {
        debug!(path = %src.display(), "source and destination are the same file");
        return Ok(Duplication::SameFile);
    }

    let input = File::open(src).map_err(|source| PatchError::OpenSource {
        path: src.to_path_buf(),
        source,
    })?;
    let permissions = input
        .metadata()
        .map_err(|source| PatchError::OpenSource {
            path: src.to_path_buf(),
            source,
        })?
        .permissions();
    let output = File::create(dest).map_err(|source| PatchError::CreateDest {
        path: dest.to_path_buf(),
        source,
    })?;

    let copy_err = |source: io::Error| PatchError::Copy {
        from: src.to_path_buf(),
        to: dest.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    let copied = io::copy(&mut reader, &mut writer).map_err(copy_err)?;
    writer.flush().map_err(copy_err)?;
    let output = writer.into_inner().map_err(|e| copy_err(e.into_error()))?;
    output.set_permissions(permissions).map_err(copy_err)?;
    output.sync_all().map_err(copy_err)?;

    info!(from = %src.display(), to = %dest.display(), bytes = copied, "duplicated binary");
    Ok(Duplication::Copied(copied))
}
