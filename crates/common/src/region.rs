//! # Byte-Range Mapper: Whole-File Memory Views
//!
//! Opens a file and maps all of it into the process, either as a private
//! read-only view (copy-on-write, never written back) or as a shared
//! read-write view whose stores land in the file.
//!
//! The mapping is released when the [`MappedRegion`] is dropped, so every
//! early return in a caller unmaps automatically.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors from mapping operations.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot map {}: {source}", path.display())]
    Map {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} does not fit in the address space ({len} bytes)", path.display())]
    TooLarge { path: PathBuf, len: u64 },
    #[error("{} is mapped read-only", path.display())]
    ReadOnly { path: PathBuf },
    #[error("cannot flush {}: {source}", path.display())]
    Flush {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Protection/sharing mode of a whole-file mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `PROT_READ`, `MAP_PRIVATE`.
    ReadOnly,
    /// `PROT_READ | PROT_WRITE`, `MAP_SHARED`.
    ReadWrite,
}

enum View {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// Exclusively owned mapping of an entire file.
pub struct MappedRegion {
    view: View,
    /// Kept open only when the caller asked for it (see [`MappedRegion::open`]).
    file: Option<File>,
    path: PathBuf,
}

impl MappedRegion {
    /// Maps `path` in full with the requested `access`.
    ///
    /// When `keep_file` is `true` the underlying handle stays open and is
    /// available through [`MappedRegion::file`], for callers that later map
    /// a precise sub-range of the same file. Otherwise it is closed as soon
    /// as the mapping exists.
    pub fn open(path: &Path, access: Access, keep_file: bool) -> Result<Self, RegionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(access == Access::ReadWrite)
            .open(path)
            .map_err(|source| RegionError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let len = file
            .metadata()
            .map_err(|source| RegionError::Stat {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let len = usize::try_from(len).map_err(|_| RegionError::TooLarge {
            path: path.to_path_buf(),
            len,
        })?;

        let mut options = MmapOptions::new();
        options.len(len);
        // SAFETY: the file is not expected to be modified by other processes
        // while it is mapped; concurrent writers to the duplicate are outside
        // the supported deployment.
        let view = match access {
            Access::ReadOnly => unsafe { options.map_copy_read_only(&file) }.map(View::ReadOnly),
            Access::ReadWrite => unsafe { options.map_mut(&file) }.map(View::ReadWrite),
        }
        .map_err(|source| RegionError::Map {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), len, ?access, "mapped file");

        Ok(Self {
            view,
            file: keep_file.then_some(file),
            path: path.to_path_buf(),
        })
    }

    /// Returns the mapped length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns `true` if the mapped file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> Access {
        match self.view {
            View::ReadOnly(_) => Access::ReadOnly,
            View::ReadWrite(_) => Access::ReadWrite,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open file handle, if it was retained at open time.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.view {
            View::ReadOnly(map) => &map[..],
            View::ReadWrite(map) => &map[..],
        }
    }

    /// Mutable bytes of a [`Access::ReadWrite`] view.
    pub fn as_mut_bytes(&mut self) -> Result<&mut [u8], RegionError> {
        match &mut self.view {
            View::ReadWrite(map) => Ok(&mut map[..]),
            View::ReadOnly(_) => Err(RegionError::ReadOnly {
                path: self.path.clone(),
            }),
        }
    }

    /// Writes dirty pages of a shared view back to storage. No-op for read-only views.
    pub fn flush(&self) -> Result<(), RegionError> {
        match &self.view {
            View::ReadWrite(map) => map.flush().map_err(|source| RegionError::Flush {
                path: self.path.clone(),
                source,
            }),
            View::ReadOnly(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("access", &self.access())
            .field("len", &self.len())
            .field("keeps_file", &self.file.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_only_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"hello region").unwrap();

        let region = MappedRegion::open(&path, Access::ReadOnly, false).unwrap();
        assert_eq!(region.len(), 12);
        assert_eq!(region.as_bytes(), b"hello region");
        assert_eq!(region.access(), Access::ReadOnly);
        assert!(region.file().is_none());
    }

    #[test]
    fn test_keep_file_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, [7u8; 64]).unwrap();

        let region = MappedRegion::open(&path, Access::ReadOnly, true).unwrap();
        let file = region.file().expect("handle retained");
        assert_eq!(file.metadata().unwrap().len(), 64);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, [0u8; 16]).unwrap();

        let mut region = MappedRegion::open(&path, Access::ReadOnly, false).unwrap();
        assert!(matches!(
            region.as_mut_bytes(),
            Err(RegionError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_shared_write_reaches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dupe.bin");
        fs::write(&path, [0u8; 32]).unwrap();

        {
            let mut region = MappedRegion::open(&path, Access::ReadWrite, false).unwrap();
            region.as_mut_bytes().unwrap()[4..8].copy_from_slice(b"abcd");
            region.flush().unwrap();
        }

        let after = fs::read(&path).unwrap();
        assert_eq!(&after[4..8], b"abcd");
        assert_eq!(after.len(), 32);
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappedRegion::open(&dir.path().join("nope"), Access::ReadOnly, false)
            .unwrap_err();
        assert!(matches!(err, RegionError::Open { .. }));
        assert!(err.to_string().contains("cannot open"));
    }
}
