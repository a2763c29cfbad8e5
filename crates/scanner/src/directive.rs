//! Sequential load command walk.
//!
//! Directives self-describe their size; the only way to reach directive `n`
//! is to step over the `n - 1` before it.

use crate::image::read_u32;
use crate::FormatError;
use common::{LOAD_COMMAND_SIZE, MACH_HEADER_64_SIZE};
use tracing::debug;

/// One `{cmd, cmdsize}` record and where it sits in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadDirective {
    /// Position in the header's `ncmds` sequence (0-indexed).
    pub index: u32,
    /// Byte offset of the directive from the start of the image.
    pub offset: usize,
    pub kind: u32,
    pub size: u32,
}

/// Iterator over the load directives of an image.
///
/// Yields `Err` at most once, then stops: a directive that cannot be stepped
/// over leaves nothing trustworthy after it.
pub struct Directives<'a> {
    bytes: &'a [u8],
    cursor: usize,
    index: u32,
    count: u32,
    failed: bool,
}

impl<'a> Directives<'a> {
    pub(crate) fn new(bytes: &'a [u8], count: u32) -> Self {
        Self {
            bytes,
            cursor: MACH_HEADER_64_SIZE,
            index: 0,
            count,
            failed: false,
        }
    }

    fn step(&mut self) -> Result<LoadDirective, FormatError> {
        let offset = self.cursor;
        let overrun = FormatError::DirectiveHeaderOverrun {
            index: self.index,
            offset,
        };
        let kind = read_u32(self.bytes, offset).ok_or(overrun.clone())?;
        let size = read_u32(self.bytes, offset + 4).ok_or(overrun)?;

        if (size as usize) < LOAD_COMMAND_SIZE {
            return Err(FormatError::DirectiveTooSmall {
                index: self.index,
                offset,
                size,
                min: LOAD_COMMAND_SIZE,
            });
        }
        let end = offset
            .checked_add(size as usize)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(FormatError::DirectiveOverrun {
                index: self.index,
                offset,
                size,
                len: self.bytes.len(),
            })?;

        let directive = LoadDirective {
            index: self.index,
            offset,
            kind,
            size,
        };
        debug!(index = self.index, offset, kind, size, "load command");
        self.cursor = end;
        self.index += 1;
        Ok(directive)
    }
}

impl Iterator for Directives<'_> {
    type Item = Result<LoadDirective, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.count {
            return None;
        }
        let item = self.step();
        self.failed = item.is_err();
        Some(item)
    }
}

impl std::iter::FusedIterator for Directives<'_> {}
